//! Tag evaluation.
//!
//! A tag either calls a bound component (uppercase name resolving to a
//! function) or emits an HTML fragment string. Components are ordinary
//! functions receiving a props dictionary (rendered children under
//! `children`); they return strings or arrays of strings, which join
//! without a separator.

use crate::env::EnvRef;
use crate::error::Diagnostic;
use crate::lexer::Token;
use crate::parser::ast::{Block, Expr, TagAttr, TagChild};
use crate::value::{OrderedMap, Value};

use super::{EvalResult, Evaluator, Interrupt};

fn is_component_name(name: &str) -> bool {
    name.chars().next().map(|c| c.is_uppercase()).unwrap_or(false)
}

impl Evaluator {
    pub(crate) async fn eval_tag(&self, expr: &Expr, env: &EnvRef) -> EvalResult<Value> {
        match expr {
            Expr::TagLiteral { token, name, attrs } => {
                if name.is_empty() {
                    return Ok(Value::str(""));
                }
                if is_component_name(name) {
                    return self
                        .call_component(name, attrs, Vec::new(), env, token)
                        .await;
                }
                let rendered_attrs = self.render_attrs(attrs, env).await?;
                Ok(Value::str(format!("<{name}{rendered_attrs}/>")))
            }
            Expr::TagPair {
                token,
                name,
                attrs,
                children,
            } => {
                let rendered_children = self.render_children(children, env).await?;
                if is_component_name(name) {
                    return self
                        .call_component(name, attrs, rendered_children, env, token)
                        .await;
                }
                let rendered_attrs = self.render_attrs(attrs, env).await?;
                let body: String = rendered_children.concat();
                Ok(Value::str(format!("<{name}{rendered_attrs}>{body}</{name}>")))
            }
            _ => unreachable!("eval_tag called on a non-tag expression"),
        }
    }

    async fn render_attrs(&self, attrs: &[TagAttr], env: &EnvRef) -> EvalResult<String> {
        let mut out = String::new();
        for attr in attrs {
            match &attr.value {
                None => {
                    out.push(' ');
                    out.push_str(&attr.name);
                }
                Some(expr) => {
                    let value = self.eval_expr(expr, env).await?;
                    match value {
                        // Boolean attributes render by presence.
                        Value::Bool(true) => {
                            out.push(' ');
                            out.push_str(&attr.name);
                        }
                        Value::Bool(false) | Value::Null => {}
                        other => {
                            let text = other.to_display_string().replace('"', "&quot;");
                            out.push(' ');
                            out.push_str(&attr.name);
                            out.push_str("=\"");
                            out.push_str(&text);
                            out.push('"');
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    async fn render_children(
        &self,
        children: &[TagChild],
        env: &EnvRef,
    ) -> EvalResult<Vec<String>> {
        let mut rendered = Vec::new();
        for child in children {
            match child {
                TagChild::Text(text) => rendered.push(text.clone()),
                TagChild::Tag(tag) => {
                    let v = self.eval_expr(tag, env).await?;
                    rendered.push(render_fragment(&v));
                }
                TagChild::Interp(block) => {
                    let v = self.eval_interp_block(block, env).await?;
                    rendered.push(render_fragment(&v));
                }
                TagChild::RawInterp(expr) => {
                    let v = self.eval_expr(expr, env).await?;
                    rendered.push(v.to_display_string());
                }
            }
        }
        Ok(rendered)
    }

    async fn eval_interp_block(&self, block: &Block, env: &EnvRef) -> EvalResult<Value> {
        let child = crate::env::Frame::child(env, crate::env::FrameKind::Block);
        match self.eval_block(block, &child).await {
            Ok(v) => Ok(v),
            Err(Interrupt::Return(v)) => Ok(v),
            Err(other) => Err(other),
        }
    }

    async fn call_component(
        &self,
        name: &str,
        attrs: &[TagAttr],
        children: Vec<String>,
        env: &EnvRef,
        token: &Token,
    ) -> EvalResult<Value> {
        let function = match env.lookup(name) {
            Some(Value::Function(f)) => f,
            Some(other) => {
                return Err(Diagnostic::type_error(
                    "T-COMPONENT",
                    format!("<{name}> resolves to a {}, not a component", other.type_name()),
                )
                .at(token.line, token.column)
                .into());
            }
            None => {
                return Err(Diagnostic::runtime(
                    "R-COMPONENT-UNBOUND",
                    format!("component <{name}> is not defined"),
                )
                .at(token.line, token.column)
                .into());
            }
        };
        let mut props = OrderedMap::new();
        for attr in attrs {
            let value = match &attr.value {
                None => Value::Bool(true),
                Some(expr) => self.eval_expr(expr, env).await?,
            };
            props.insert(attr.name.clone(), value);
        }
        props.insert(
            "children",
            Value::array(children.into_iter().map(Value::str).collect()),
        );
        let result = self
            .call_function(&function, vec![Value::dict(props)], token)
            .await?;
        Ok(Value::str(render_fragment(&result)))
    }
}

/// Fragment coercion: arrays of strings join without a separator; null
/// renders as nothing.
pub(crate) fn render_fragment(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Array(items) => items
            .read()
            .iter()
            .map(render_fragment)
            .collect::<Vec<_>>()
            .concat(),
        other => other.to_display_string(),
    }
}
