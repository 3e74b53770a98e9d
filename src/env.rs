//! Lexically scoped environments.
//!
//! An environment is a chain of frames with parent pointers. Module frames
//! persist across requests and hold a module's top-level bindings; request
//! frames are created per HTTP request and carry the `http`, `session`, and
//! `basil` roots, which shadow any same-named module binding for the
//! duration of that request.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Diagnostic;
use crate::value::Value;

pub type EnvRef = Arc<Frame>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Module,
    Function,
    Block,
    Request,
}

/// Request-scoped roots. `env`, `args`, and `params` back the `@env`,
/// `@args`, and `@params` literals.
#[derive(Debug, Clone, Default)]
pub struct RequestRoots {
    pub http: Value,
    pub session: Value,
    pub basil: Value,
    pub env: Value,
    pub args: Value,
    pub params: Value,
}

impl RequestRoots {
    fn named(&self, name: &str) -> Option<&Value> {
        match name {
            "http" => Some(&self.http),
            "session" => Some(&self.session),
            "basil" => Some(&self.basil),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Frame {
    kind: FrameKind,
    bindings: RwLock<HashMap<String, Value>>,
    parent: Option<EnvRef>,
    roots: Option<RequestRoots>,
}

impl Frame {
    pub fn module() -> EnvRef {
        Arc::new(Frame {
            kind: FrameKind::Module,
            bindings: RwLock::new(HashMap::new()),
            parent: None,
            roots: None,
        })
    }

    pub fn child(parent: &EnvRef, kind: FrameKind) -> EnvRef {
        Arc::new(Frame {
            kind,
            bindings: RwLock::new(HashMap::new()),
            parent: Some(parent.clone()),
            roots: None,
        })
    }

    pub fn request(parent: &EnvRef, roots: RequestRoots) -> EnvRef {
        Arc::new(Frame {
            kind: FrameKind::Request,
            bindings: RwLock::new(HashMap::new()),
            parent: Some(parent.clone()),
            roots: Some(roots),
        })
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn roots(&self) -> Option<&RequestRoots> {
        self.roots.as_ref()
    }

    /// Bind `name` in this frame, shadowing outer bindings.
    pub fn define(&self, name: impl Into<String>, value: Value) {
        self.bindings.write().insert(name.into(), value);
    }

    /// Walk up to the frame that already binds `name` and write there.
    pub fn assign(&self, name: &str, value: Value) -> Result<(), Diagnostic> {
        if self.bindings.read().contains_key(name) {
            self.bindings.write().insert(name.to_string(), value);
            return Ok(());
        }
        match &self.parent {
            Some(parent) => parent.assign(name, value),
            None => Err(Diagnostic::runtime(
                "R-UNBOUND-ASSIGN",
                format!("cannot assign to undefined name '{name}'"),
            )
            .with_hint(format!("declare it first: let {name} = …"))),
        }
    }

    /// Resolve `name`, innermost frame first. A request frame's roots are
    /// consulted after its own bindings but before any parent.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.bindings.read().get(name) {
            return Some(v.clone());
        }
        if self.kind == FrameKind::Request {
            if let Some(root) = self.roots.as_ref().and_then(|r| r.named(name)) {
                return Some(root.clone());
            }
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    /// The nearest request frame's roots, if this chain has one.
    pub fn request_roots(&self) -> Option<RequestRoots> {
        if self.kind == FrameKind::Request {
            return self.roots.clone();
        }
        self.parent.as_ref().and_then(|p| p.request_roots())
    }

    pub fn has_local(&self, name: &str) -> bool {
        self.bindings.read().contains_key(name)
    }

    /// Bind `name` in the nearest module frame so it survives the request
    /// (compiled schemas, module-scope caches). Falls back to this frame
    /// when the chain has no module.
    pub fn define_module_scoped(&self, name: impl Into<String>, value: Value) {
        let mut frame = self;
        loop {
            if frame.kind == FrameKind::Module {
                frame.define(name, value);
                return;
            }
            match &frame.parent {
                Some(parent) => frame = &**parent,
                None => {
                    frame.define(name, value);
                    return;
                }
            }
        }
    }

    /// Snapshot of this frame's own bindings (used by `export`).
    pub fn local_bindings(&self) -> Vec<(String, Value)> {
        self.bindings
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_parent_chain() {
        let module = Frame::module();
        module.define("a", Value::Int(1));
        let block = Frame::child(&module, FrameKind::Block);
        assert_eq!(block.lookup("a"), Some(Value::Int(1)));
        assert_eq!(block.lookup("missing"), None);
    }

    #[test]
    fn define_shadows_outer_binding() {
        let module = Frame::module();
        module.define("a", Value::Int(1));
        let block = Frame::child(&module, FrameKind::Block);
        block.define("a", Value::Int(2));
        assert_eq!(block.lookup("a"), Some(Value::Int(2)));
        assert_eq!(module.lookup("a"), Some(Value::Int(1)));
    }

    #[test]
    fn assign_writes_to_owning_frame() {
        let module = Frame::module();
        module.define("a", Value::Int(1));
        let block = Frame::child(&module, FrameKind::Block);
        block.assign("a", Value::Int(5)).unwrap();
        assert_eq!(module.lookup("a"), Some(Value::Int(5)));
    }

    #[test]
    fn assign_to_undefined_is_a_runtime_error() {
        let module = Frame::module();
        let err = module.assign("ghost", Value::Null).unwrap_err();
        assert_eq!(err.code, "R-UNBOUND-ASSIGN");
    }

    #[test]
    fn request_roots_shadow_module_bindings() {
        let module = Frame::module();
        module.define("http", Value::Int(99));
        let request = Frame::request(
            &module,
            RequestRoots {
                http: Value::str("request-http"),
                ..Default::default()
            },
        );
        assert_eq!(request.lookup("http"), Some(Value::str("request-http")));
        // A local binding in the request frame still wins over the root.
        request.define("http", Value::Int(1));
        assert_eq!(request.lookup("http"), Some(Value::Int(1)));
    }

    #[test]
    fn request_roots_are_reachable_from_nested_frames() {
        let module = Frame::module();
        let request = Frame::request(
            &module,
            RequestRoots {
                args: Value::array(vec![Value::str("2025")]),
                ..Default::default()
            },
        );
        let block = Frame::child(&request, FrameKind::Block);
        let roots = block.request_roots().unwrap();
        assert!(roots.args.is_truthy());
    }
}
