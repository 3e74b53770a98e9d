//! Module imports.
//!
//! `import @path` resolves the module through the source reader, obtains
//! its program from the AST cache, evaluates its top-level statements once
//! per module scope, and yields the dictionary of exported bindings.
//! Concurrent importers of the same module block on the one in-flight
//! initialisation; a module importing itself (directly or through a chain)
//! is a runtime error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::env::{EnvRef, Frame};
use crate::error::Diagnostic;
use crate::lexer::Token;
use crate::parser::ast::ImportPath;
use crate::value::{OrderedMap, Value};

use super::{EvalResult, Evaluator, Interrupt};

/// Process-wide registry of initialised modules. Module frames are stable
/// across requests; the watcher drops entries when their sources change.
#[derive(Default)]
pub struct ModuleRegistry {
    ready: RwLock<HashMap<PathBuf, Value>>,
    inflight: Mutex<HashMap<PathBuf, watch::Receiver<bool>>>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry::default()
    }

    pub fn get(&self, key: &Path) -> Option<Value> {
        self.ready.read().get(key).cloned()
    }

    pub fn insert(&self, key: PathBuf, exports: Value) {
        self.ready.write().insert(key, exports);
    }

    /// Drop the named modules (after cache invalidation).
    pub fn remove_all(&self, keys: &[PathBuf]) {
        let mut ready = self.ready.write();
        for key in keys {
            ready.remove(key);
        }
    }

    pub fn clear(&self) {
        self.ready.write().clear();
    }

    pub fn len(&self) -> usize {
        self.ready.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.read().is_empty()
    }
}

impl Evaluator {
    pub(crate) async fn eval_import(
        &self,
        path: &ImportPath,
        env: &EnvRef,
        token: &Token,
    ) -> EvalResult<Value> {
        let reference = match path {
            ImportPath::Static(text) => text.clone(),
            ImportPath::Dynamic(parts) => self.render_template(parts, env).await?,
        };

        // Resolve relative to the importing source, not the working
        // directory.
        let loading_dir = self.loading_dir(env);
        let canonical = self
            .cache
            .reader()
            .resolve(&reference, &loading_dir)
            .map_err(|e| {
                Diagnostic::io("IO-IMPORT", format!("{e}")).at(token.line, token.column)
            })?;

        if self.import_stack.lock().contains(&canonical) {
            return Err(Diagnostic::runtime(
                "R-IMPORT-CYCLE",
                format!("cyclic import of '{reference}'"),
            )
            .at(token.line, token.column)
            .into());
        }

        loop {
            if let Some(exports) = self.modules.get(&canonical) {
                return Ok(exports);
            }

            enum Role {
                Owner(watch::Sender<bool>),
                Waiter(watch::Receiver<bool>),
            }
            let role = {
                let mut inflight = self.modules.inflight.lock();
                match inflight.get(&canonical) {
                    Some(rx) => Role::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        inflight.insert(canonical.clone(), rx);
                        Role::Owner(tx)
                    }
                }
            };

            match role {
                Role::Owner(tx) => {
                    let result = self.initialise_module(&canonical, token).await;
                    self.modules.inflight.lock().remove(&canonical);
                    let _ = tx.send(true);
                    return result;
                }
                Role::Waiter(mut rx) => {
                    // A closed channel means the owner was torn down
                    // (timeout, cancellation) before cleaning up; drop the
                    // stale claim so the next iteration can take over.
                    if rx.changed().await.is_err() {
                        self.modules.inflight.lock().remove(&canonical);
                    }
                }
            }
        }
    }

    async fn initialise_module(
        &self,
        canonical: &Path,
        token: &Token,
    ) -> EvalResult<Value> {
        self.check_cancel()?;
        let entry = self.cache.get_or_parse(canonical).await.map_err(|e| {
            match e {
                crate::error::BasilError::Script(d) => Interrupt::Diag(d),
                other => Interrupt::Diag(
                    Diagnostic::io("IO-IMPORT", format!("{other}"))
                        .at(token.line, token.column),
                ),
            }
        })?;

        self.import_stack.lock().push(canonical.to_path_buf());
        self.export_stack.lock().push(Vec::new());
        let module_frame = Frame::module();
        let result = self.eval_program(&entry.program, &module_frame).await;
        let exported_names = self.export_stack.lock().pop().unwrap_or_default();
        self.import_stack.lock().pop();
        result?;

        let mut exports = OrderedMap::new();
        for name in exported_names {
            if let Some(value) = module_frame.lookup(&name) {
                exports.insert(name, value);
            }
        }
        let exports = Value::dict(exports);
        self.modules
            .insert(canonical.to_path_buf(), exports.clone());
        Ok(exports)
    }

    /// The directory of the source currently being evaluated: the deepest
    /// in-progress import, then the handler's own directory, then the base
    /// directory.
    fn loading_dir(&self, _env: &EnvRef) -> PathBuf {
        if let Some(current) = self.import_stack.lock().last() {
            if let Some(parent) = current.parent() {
                return parent.to_path_buf();
            }
        }
        if let Some(dir) = self.entry_dir.lock().clone() {
            return dir;
        }
        self.cache.reader().base_dir().to_path_buf()
    }
}
