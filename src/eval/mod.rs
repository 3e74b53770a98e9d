//! The tree-walking evaluator.
//!
//! Single-threaded and cooperative within a request: evaluation is
//! synchronous and deterministic between suspension points, which occur
//! only at I/O operators and capability calls. Cancellation is checked
//! between statements, between loop iterations, and around capability
//! calls; scripts cannot catch it.

mod builtins;
mod imports;
mod io;
mod ops;
mod query;
mod tags;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;

use crate::capability::Capabilities;
use crate::cache::{ScriptCache, TtlCache};
use crate::env::{EnvRef, Frame, FrameKind};
use crate::error::Diagnostic;
use crate::lexer::Token;
use crate::parser::ast::{
    Block, Expr, NowKind, Pattern, Program, Stmt, TemplateKind, TemplateSeg,
};
use crate::value::{FunctionValue, OrderedMap, RegexValue, Value};

pub use imports::ModuleRegistry;

/// Non-local exits during evaluation. `Skip`/`Stop` are loop signals,
/// `Return` unwinds to the enclosing function (or handler), `Diag` is a
/// script-visible failure, and `Cancelled` tears the request down and can
/// only be observed by the pipeline.
#[derive(Debug)]
pub enum Interrupt {
    Diag(Diagnostic),
    Cancelled,
    Return(Value),
    Skip,
    Stop,
}

impl From<Diagnostic> for Interrupt {
    fn from(d: Diagnostic) -> Interrupt {
        Interrupt::Diag(d)
    }
}

pub type EvalResult<T> = Result<T, Interrupt>;

/// Cooperative cancellation flag carried by each request.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Evaluator {
    pub caps: Capabilities,
    pub cache: Arc<ScriptCache>,
    pub modules: Arc<ModuleRegistry>,
    pub fragments: Arc<TtlCache<String>>,
    pub cancel: CancelToken,
    /// Cycle detection for imports within this evaluation.
    pub(crate) import_stack: Mutex<Vec<PathBuf>>,
    /// Export collectors; the top frame belongs to the module currently
    /// being initialised.
    pub(crate) export_stack: Mutex<Vec<Vec<String>>>,
    /// `|<` cursors, keyed by path, scoped to this request.
    pub(crate) cursors: Mutex<HashMap<String, Value>>,
    /// Directory of the handler being evaluated; anchors `./…` imports
    /// when no import is in progress.
    pub(crate) entry_dir: Mutex<Option<PathBuf>>,
}

impl Evaluator {
    pub fn new(
        caps: Capabilities,
        cache: Arc<ScriptCache>,
        modules: Arc<ModuleRegistry>,
        fragments: Arc<TtlCache<String>>,
        cancel: CancelToken,
    ) -> Evaluator {
        Evaluator {
            caps,
            cache,
            modules,
            fragments,
            cancel,
            import_stack: Mutex::new(Vec::new()),
            export_stack: Mutex::new(Vec::new()),
            cursors: Mutex::new(HashMap::new()),
            entry_dir: Mutex::new(None),
        }
    }

    /// Record the handler source being evaluated so relative imports
    /// resolve against its directory.
    pub fn set_entry_source(&self, source: &std::path::Path) {
        *self.entry_dir.lock() = source.parent().map(|p| p.to_path_buf());
    }

    pub(crate) fn check_cancel(&self) -> EvalResult<()> {
        if self.cancel.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Evaluate a program's top-level statements against `env`, yielding
    /// the handler's result value.
    pub async fn eval_program(&self, program: &Program, env: &EnvRef) -> EvalResult<Value> {
        let mut last = Value::Null;
        for stmt in &program.statements {
            self.check_cancel()?;
            match self.eval_stmt(stmt, env).await {
                Ok(v) => last = v,
                Err(Interrupt::Return(v)) => return Ok(v),
                Err(Interrupt::Skip) | Err(Interrupt::Stop) => {
                    return Err(loop_signal_error(stmt.token()));
                }
                Err(other) => return Err(other),
            }
        }
        Ok(last)
    }

    pub fn eval_block<'a>(
        &'a self,
        block: &'a Block,
        env: &'a EnvRef,
    ) -> BoxFuture<'a, EvalResult<Value>> {
        async move {
            let mut last = Value::Null;
            for stmt in &block.statements {
                self.check_cancel()?;
                last = self.eval_stmt(stmt, env).await?;
            }
            Ok(last)
        }
        .boxed()
    }

    pub fn eval_stmt<'a>(
        &'a self,
        stmt: &'a Stmt,
        env: &'a EnvRef,
    ) -> BoxFuture<'a, EvalResult<Value>> {
        async move {
            match stmt {
                Stmt::Let { pattern, value, token } => {
                    let v = self.eval_expr(value, env).await?;
                    self.bind_pattern(pattern, v, env, true, token)?;
                    Ok(Value::Null)
                }
                Stmt::Assign { targets, value, token } => {
                    let v = self.eval_expr(value, env).await?;
                    if targets.len() == 1 {
                        self.bind_pattern(&targets[0], v, env, false, token)?;
                    } else {
                        let items = match &v {
                            Value::Array(items) => items.read().clone(),
                            other => {
                                return Err(Diagnostic::type_error(
                                    "T-MULTI-ASSIGN",
                                    format!(
                                        "multiple assignment requires an array, found {}",
                                        other.type_name()
                                    ),
                                )
                                .at(token.line, token.column)
                                .into());
                            }
                        };
                        for (i, target) in targets.iter().enumerate() {
                            let item = items.get(i).cloned().unwrap_or(Value::Null);
                            self.bind_pattern(target, item, env, false, token)?;
                        }
                    }
                    Ok(Value::Null)
                }
                Stmt::IndexAssign { target, index, value, token } => {
                    let container = self.eval_expr(target, env).await?;
                    let key = self.eval_expr(index, env).await?;
                    let v = self.eval_expr(value, env).await?;
                    ops::index_assign(&container, &key, v, token)?;
                    Ok(Value::Null)
                }
                Stmt::Return { value, .. } => {
                    let v = match value {
                        Some(e) => self.eval_expr(e, env).await?,
                        None => Value::Null,
                    };
                    Err(Interrupt::Return(v))
                }
                Stmt::Check { cond, token } => {
                    let v = self.eval_expr(cond, env).await?;
                    if v.is_truthy() {
                        Ok(Value::Null)
                    } else {
                        Err(Diagnostic::value_error("V-CHECK", "check failed")
                            .at(token.line, token.column)
                            .into())
                    }
                }
                Stmt::Export { names, decl, .. } => {
                    if let Some(inner) = decl {
                        self.eval_stmt(inner, env).await?;
                    }
                    if let Some(collector) = self.export_stack.lock().last_mut() {
                        for name in names {
                            if !collector.contains(name) {
                                collector.push(name.clone());
                            }
                        }
                    }
                    Ok(Value::Null)
                }
                Stmt::Stop { cond, .. } => {
                    let fire = match cond {
                        Some(c) => self.eval_expr(c, env).await?.is_truthy(),
                        None => true,
                    };
                    if fire {
                        Err(Interrupt::Stop)
                    } else {
                        Ok(Value::Null)
                    }
                }
                Stmt::Skip { cond, .. } => {
                    let fire = match cond {
                        Some(c) => self.eval_expr(c, env).await?.is_truthy(),
                        None => true,
                    };
                    if fire {
                        Err(Interrupt::Skip)
                    } else {
                        Ok(Value::Null)
                    }
                }
                Stmt::Read(read) => self.eval_read(read, env).await,
                Stmt::Write(write) => self.eval_write(write, env).await,
                Stmt::Expr { expr, .. } => self.eval_expr(expr, env).await,
                Stmt::Block { block, .. } => {
                    let child = Frame::child(env, FrameKind::Block);
                    self.eval_block(block, &child).await
                }
            }
        }
        .boxed()
    }

    pub fn eval_expr<'a>(
        &'a self,
        expr: &'a Expr,
        env: &'a EnvRef,
    ) -> BoxFuture<'a, EvalResult<Value>> {
        async move {
            match expr {
                Expr::Null(_) => Ok(Value::Null),
                Expr::Bool { value, .. } => Ok(Value::Bool(*value)),
                Expr::Int { value, .. } => Ok(Value::Int(*value)),
                Expr::Float { value, .. } => Ok(Value::Float(*value)),
                Expr::Str { value, .. } => Ok(Value::str(value)),
                Expr::Template { kind, parts, token } => {
                    let rendered = self.render_template(parts, env).await?;
                    self.finish_template(*kind, rendered, token)
                }
                Expr::Regex { pattern, flags, token } => {
                    let compiled = RegexValue::compile(pattern, flags)
                        .map_err(|d| d.or_at(token.line, token.column))?;
                    Ok(Value::Regex(Arc::new(compiled)))
                }
                Expr::Money { currency, minor, scale, .. } => Ok(Value::Money(
                    crate::money::Money {
                        currency: *currency,
                        minor: *minor,
                        scale: *scale,
                    },
                )),
                Expr::Datetime { value, .. } => Ok(Value::Datetime(*value)),
                Expr::Date { value, .. } => Ok(Value::Date(*value)),
                Expr::Time { value, .. } => Ok(Value::Time(*value)),
                Expr::Duration { months, secs, .. } => Ok(Value::Duration {
                    months: *months,
                    secs: *secs,
                }),
                Expr::Now { kind, .. } => {
                    let now = self.caps.clock.now_utc();
                    Ok(match kind {
                        NowKind::Now => Value::Datetime(now),
                        NowKind::TimeNow => Value::Time(now.time()),
                        NowKind::DateNow | NowKind::Today => Value::Date(now.date_naive()),
                    })
                }
                Expr::PathLit { text, .. } => Ok(Value::Path(Arc::from(text.as_str()))),
                Expr::UrlLit { text, token } => {
                    let url = url::Url::parse(text).map_err(|e| {
                        Diagnostic::value_error("V-URL", format!("invalid URL literal: {e}"))
                            .at(token.line, token.column)
                    })?;
                    Ok(Value::Url(Arc::new(url)))
                }
                Expr::StdlibPath { text, .. } => Ok(Value::Path(Arc::from(text.as_str()))),
                Expr::Connection { kind, args, token } => {
                    self.eval_connection(kind, args, env, token).await
                }
                Expr::EnvRoot { which, token } => {
                    let roots = env.request_roots().ok_or_else(|| {
                        Diagnostic::runtime(
                            "R-NO-REQUEST",
                            format!("@{which} is only available while serving a request"),
                        )
                        .at(token.line, token.column)
                    })?;
                    Ok(match which.as_str() {
                        "env" => roots.env,
                        "args" => roots.args,
                        _ => roots.params,
                    })
                }
                Expr::Ident { name, token } => match env.lookup(name) {
                    Some(v) => Ok(v),
                    None if builtins::is_builtin(name) => Err(Diagnostic::runtime(
                        "R-BUILTIN-REF",
                        format!("builtin '{name}' must be called directly"),
                    )
                    .at(token.line, token.column)
                    .into()),
                    None => Err(Diagnostic::runtime(
                        "R-UNBOUND",
                        format!("'{name}' is not defined"),
                    )
                    .at(token.line, token.column)
                    .into()),
                },
                Expr::Prefix { op, operand, token } => {
                    let v = self.eval_expr(operand, env).await?;
                    ops::prefix(*op, v, token)
                }
                Expr::Infix { op, left, right, token } => {
                    self.eval_infix(*op, left, right, env, token).await
                }
                Expr::Call { callee, args, token } => {
                    self.eval_call(callee, args, env, token).await
                }
                Expr::Index { target, index, token } => {
                    let t = self.eval_expr(target, env).await?;
                    let i = self.eval_expr(index, env).await?;
                    ops::index(&t, &i, token)
                }
                Expr::Slice { target, from, to, token } => {
                    let t = self.eval_expr(target, env).await?;
                    let from = match from {
                        Some(e) => Some(self.eval_expr(e, env).await?),
                        None => None,
                    };
                    let to = match to {
                        Some(e) => Some(self.eval_expr(e, env).await?),
                        None => None,
                    };
                    ops::slice(&t, from.as_ref(), to.as_ref(), token)
                }
                Expr::Dot { target, field, token } => {
                    let t = self.eval_expr(target, env).await?;
                    ops::dot(&t, field, token)
                }
                Expr::Grouped { inner, .. } => self.eval_expr(inner, env).await,
                Expr::If { cond, then, elifs, alternative, .. } => {
                    if self.eval_expr(cond, env).await?.is_truthy() {
                        let child = Frame::child(env, FrameKind::Block);
                        return self.eval_block(then, &child).await;
                    }
                    for (elif_cond, elif_block) in elifs {
                        if self.eval_expr(elif_cond, env).await?.is_truthy() {
                            let child = Frame::child(env, FrameKind::Block);
                            return self.eval_block(elif_block, &child).await;
                        }
                    }
                    match alternative {
                        Some(block) => {
                            let child = Frame::child(env, FrameKind::Block);
                            self.eval_block(block, &child).await
                        }
                        None => Ok(Value::Null),
                    }
                }
                Expr::For { bindings, iterable, body, token } => {
                    self.eval_for(bindings, iterable, body, env, token).await
                }
                Expr::Try { call, .. } => match self.eval_expr(call, env).await {
                    Ok(v) => Ok(v),
                    Err(Interrupt::Diag(d)) => Ok(error_dict(&d)),
                    Err(other) => Err(other),
                },
                Expr::Import { path, alias, token } => {
                    let exports = self.eval_import(path, env, token).await?;
                    // `as Alias` rebinds the module dictionary in scope.
                    if let Some(alias) = alias {
                        env.define(alias.clone(), exports.clone());
                    }
                    Ok(exports)
                }
                Expr::Function { name, params, rest, body, .. } => {
                    Ok(Value::Function(Arc::new(FunctionValue {
                        name: name.clone(),
                        params: params.clone(),
                        rest: rest.clone(),
                        body: body.clone(),
                        env: env.clone(),
                    })))
                }
                Expr::Dict { entries, .. } => {
                    let mut map = OrderedMap::new();
                    for (key, value_expr) in entries {
                        let key = match key {
                            crate::parser::ast::DictKey::Ident(k) => k.clone(),
                            crate::parser::ast::DictKey::Str(k) => k.clone(),
                        };
                        let value = self.eval_expr(value_expr, env).await?;
                        map.insert(key, value);
                    }
                    Ok(Value::dict(map))
                }
                Expr::Array { items, .. } => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval_expr(item, env).await?);
                    }
                    Ok(Value::array(values))
                }
                Expr::TagPair { .. } | Expr::TagLiteral { .. } => {
                    self.eval_tag(expr, env).await
                }
                Expr::Query(q) => self.eval_query(q, env).await,
                Expr::Insert(i) => self.eval_insert(i, env).await,
                Expr::Update(u) => self.eval_update(u, env).await,
                Expr::Delete(d) => self.eval_delete(d, env).await,
                Expr::Transaction(t) => self.eval_transaction(t, env).await,
                Expr::Schema(s) => {
                    let mut fields = OrderedMap::new();
                    for (field, ty) in &s.fields {
                        fields.insert(field.clone(), Value::str(ty));
                    }
                    let mut schema = OrderedMap::new();
                    schema.insert("schema", Value::str(&s.name));
                    schema.insert("fields", Value::dict(fields));
                    let value = Value::dict(schema);
                    // Compiled schemas live on the module frame.
                    env.define_module_scoped(s.name.clone(), value.clone());
                    Ok(value)
                }
                Expr::TableRef { name, .. } => Ok(Value::str(name)),
            }
        }
        .boxed()
    }

    async fn eval_for(
        &self,
        bindings: &[String],
        iterable: &Expr,
        body: &Block,
        env: &EnvRef,
        token: &Token,
    ) -> EvalResult<Value> {
        let mut produced = Vec::new();

        // `for i in a..b` iterates without materialising the range.
        let range = match unwrap_grouped(iterable) {
            Expr::Infix { op: crate::parser::ast::InfixOp::Range, left, right, .. } => {
                Some((left, right))
            }
            _ => None,
        };
        if let Some((left, right)) = range {
            let start = ops::as_int(&self.eval_expr(left, env).await?, token)?;
            let end = ops::as_int(&self.eval_expr(right, env).await?, token)?;
            let mut i = start;
            while i < end {
                self.check_cancel()?;
                let child = Frame::child(env, FrameKind::Block);
                child.define(bindings[0].clone(), Value::Int(i));
                if bindings.len() > 1 {
                    child.define(bindings[1].clone(), Value::Int(i));
                }
                match self.eval_block(body, &child).await {
                    Ok(v) => produced.push(v),
                    Err(Interrupt::Skip) => {}
                    Err(Interrupt::Stop) => break,
                    Err(other) => return Err(other),
                }
                i += 1;
            }
            return Ok(Value::array(produced));
        }

        let iterable = self.eval_expr(iterable, env).await?;
        match &iterable {
            Value::Array(items) => {
                let snapshot = items.read().clone();
                for item in snapshot {
                    self.check_cancel()?;
                    let child = Frame::child(env, FrameKind::Block);
                    if bindings.len() > 1 {
                        // `for i, x in arr` binds index then element.
                        child.define(bindings[0].clone(), Value::Int(produced.len() as i64));
                        child.define(bindings[1].clone(), item);
                    } else {
                        child.define(bindings[0].clone(), item);
                    }
                    match self.eval_block(body, &child).await {
                        Ok(v) => produced.push(v),
                        Err(Interrupt::Skip) => {}
                        Err(Interrupt::Stop) => break,
                        Err(other) => return Err(other),
                    }
                }
                Ok(Value::array(produced))
            }
            Value::Dict(map) => {
                let snapshot: Vec<(String, Value)> = map
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                for (key, value) in snapshot {
                    self.check_cancel()?;
                    let child = Frame::child(env, FrameKind::Block);
                    child.define(bindings[0].clone(), Value::str(&key));
                    if bindings.len() > 1 {
                        child.define(bindings[1].clone(), value);
                    }
                    match self.eval_block(body, &child).await {
                        Ok(v) => produced.push(v),
                        Err(Interrupt::Skip) => {}
                        Err(Interrupt::Stop) => break,
                        Err(other) => return Err(other),
                    }
                }
                Ok(Value::array(produced))
            }
            other => Err(Diagnostic::type_error(
                "T-NOT-ITERABLE",
                format!("cannot iterate over {}", other.type_name()),
            )
            .at(token.line, token.column)
            .into()),
        }
    }

    /// Render the text form of an interpolated literal.
    pub(crate) async fn render_template(
        &self,
        parts: &[TemplateSeg],
        env: &EnvRef,
    ) -> EvalResult<String> {
        let mut out = String::new();
        for part in parts {
            match part {
                TemplateSeg::Text(t) => out.push_str(t),
                TemplateSeg::Expr(e) => {
                    let v = self.eval_expr(e, env).await?;
                    out.push_str(&v.to_display_string());
                }
            }
        }
        Ok(out)
    }

    fn finish_template(
        &self,
        kind: TemplateKind,
        rendered: String,
        token: &Token,
    ) -> EvalResult<Value> {
        match kind {
            TemplateKind::String => Ok(Value::str(rendered)),
            TemplateKind::Path => Ok(Value::Path(Arc::from(rendered.as_str()))),
            TemplateKind::Url => {
                let url = url::Url::parse(&rendered).map_err(|e| {
                    Diagnostic::value_error(
                        "V-URL",
                        format!("template did not produce a valid URL: {e}"),
                    )
                    .at(token.line, token.column)
                })?;
                Ok(Value::Url(Arc::new(url)))
            }
            TemplateKind::Datetime => {
                let parsed = chrono::DateTime::parse_from_rfc3339(&rendered)
                    .map(|dt| Value::Datetime(dt.with_timezone(&chrono::Utc)))
                    .or_else(|_| {
                        chrono::NaiveDate::parse_from_str(&rendered, "%Y-%m-%d")
                            .map(Value::Date)
                    });
                parsed.map_err(|e| {
                    Diagnostic::value_error(
                        "V-DATETIME",
                        format!("template did not produce a valid datetime: {e}"),
                    )
                    .at(token.line, token.column)
                    .into()
                })
            }
        }
    }

    async fn eval_connection(
        &self,
        kind: &str,
        args: &[Expr],
        env: &EnvRef,
        token: &Token,
    ) -> EvalResult<Value> {
        match kind {
            "DB" => Ok(Value::Handle(crate::value::Handle::Db(self.caps.db.clone()))),
            "SEARCH" => Ok(Value::Handle(crate::value::Handle::Search(
                self.caps.search.clone(),
            ))),
            "shell" => Ok(Value::Handle(crate::value::Handle::Shell(
                self.caps.shell.clone(),
            ))),
            "sqlite" => {
                let location = match args.first() {
                    Some(e) => self.eval_expr(e, env).await?.to_display_string(),
                    None => ":memory:".to_string(),
                };
                self.check_cancel()?;
                let db = crate::capability::db::SqliteDb::connect(&location)
                    .await
                    .map_err(|e| {
                        Diagnostic::runtime("R-DB-CONNECT", format!("{e}"))
                            .at(token.line, token.column)
                    })?;
                self.check_cancel()?;
                Ok(Value::Handle(crate::value::Handle::Db(Arc::new(db))))
            }
            other => Err(Diagnostic::runtime(
                "R-CONN-UNSUPPORTED",
                format!("@{other} connections are not available in this build"),
            )
            .at(token.line, token.column)
            .into()),
        }
    }

    /// Bind a pattern to a value, defining (`let`) or assigning.
    pub(crate) fn bind_pattern(
        &self,
        pattern: &Pattern,
        value: Value,
        env: &EnvRef,
        define: bool,
        token: &Token,
    ) -> EvalResult<()> {
        match pattern {
            Pattern::Name(name) => {
                if define {
                    env.define(name.clone(), value);
                } else {
                    env.assign(name, value)
                        .map_err(|d| d.or_at(token.line, token.column))?;
                }
                Ok(())
            }
            Pattern::Dict { entries, rest } => {
                let map = match &value {
                    Value::Dict(map) => map.read().clone(),
                    other => {
                        return Err(Diagnostic::type_error(
                            "T-DESTRUCTURE",
                            format!(
                                "dictionary pattern cannot destructure {}",
                                other.type_name()
                            ),
                        )
                        .at(token.line, token.column)
                        .into());
                    }
                };
                let mut taken: Vec<&str> = Vec::new();
                for entry in entries {
                    let bound = map.get(&entry.key).cloned().unwrap_or(Value::Null);
                    taken.push(entry.key.as_str());
                    match &entry.nested {
                        Some(nested) => {
                            self.bind_pattern(nested, bound, env, define, token)?
                        }
                        None => {
                            let name = entry.alias.as_ref().unwrap_or(&entry.key);
                            if define {
                                env.define(name.clone(), bound);
                            } else {
                                env.assign(name, bound)
                                    .map_err(|d| d.or_at(token.line, token.column))?;
                            }
                        }
                    }
                }
                if let Some(rest_name) = rest {
                    let mut rest_map = OrderedMap::new();
                    for (k, v) in map.iter() {
                        if !taken.contains(&k.as_str()) {
                            rest_map.insert(k.clone(), v.clone());
                        }
                    }
                    let rest_value = Value::dict(rest_map);
                    if define {
                        env.define(rest_name.clone(), rest_value);
                    } else {
                        env.assign(rest_name, rest_value)
                            .map_err(|d| d.or_at(token.line, token.column))?;
                    }
                }
                Ok(())
            }
            Pattern::Array { items, rest } => {
                let elements = match &value {
                    Value::Array(items) => items.read().clone(),
                    other => {
                        return Err(Diagnostic::type_error(
                            "T-DESTRUCTURE",
                            format!("array pattern cannot destructure {}", other.type_name()),
                        )
                        .at(token.line, token.column)
                        .into());
                    }
                };
                for (i, item) in items.iter().enumerate() {
                    let bound = elements.get(i).cloned().unwrap_or(Value::Null);
                    self.bind_pattern(item, bound, env, define, token)?;
                }
                if let Some(rest_name) = rest {
                    let tail: Vec<Value> =
                        elements.iter().skip(items.len()).cloned().collect();
                    let rest_value = Value::array(tail);
                    if define {
                        env.define(rest_name.clone(), rest_value);
                    } else {
                        env.assign(rest_name, rest_value)
                            .map_err(|d| d.or_at(token.line, token.column))?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Call a user function value.
    pub(crate) fn call_function<'a>(
        &'a self,
        function: &'a FunctionValue,
        args: Vec<Value>,
        token: &'a Token,
    ) -> BoxFuture<'a, EvalResult<Value>> {
        async move {
            self.check_cancel()?;
            let frame = Frame::child(&function.env, FrameKind::Function);
            for (i, param) in function.params.iter().enumerate() {
                frame.define(param.clone(), args.get(i).cloned().unwrap_or(Value::Null));
            }
            if let Some(rest) = &function.rest {
                let tail: Vec<Value> = args
                    .iter()
                    .skip(function.params.len())
                    .cloned()
                    .collect();
                frame.define(rest.clone(), Value::array(tail));
            }
            match self.eval_block(&function.body, &frame).await {
                Ok(v) => Ok(v),
                Err(Interrupt::Return(v)) => Ok(v),
                Err(Interrupt::Skip) | Err(Interrupt::Stop) => {
                    Err(loop_signal_error(token))
                }
                Err(other) => Err(other),
            }
        }
        .boxed()
    }

    async fn eval_call(
        &self,
        callee: &Expr,
        args: &[Expr],
        env: &EnvRef,
        token: &Token,
    ) -> EvalResult<Value> {
        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            arg_values.push(self.eval_expr(arg, env).await?);
        }

        // Method-style calls dispatch on the receiver's type, including
        // capability handles.
        if let Expr::Dot { target, field, .. } = callee {
            let receiver = self.eval_expr(target, env).await?;
            return self
                .call_method(&receiver, field, arg_values, token)
                .await;
        }

        if let Expr::Ident { name, .. } = callee {
            match env.lookup(name) {
                Some(Value::Function(f)) => {
                    return self.call_function(&f, arg_values, token).await;
                }
                Some(other) => {
                    return Err(Diagnostic::type_error(
                        "T-NOT-CALLABLE",
                        format!("'{name}' is a {}, not a function", other.type_name()),
                    )
                    .at(token.line, token.column)
                    .into());
                }
                None => {
                    return builtins::call_builtin(self, name, arg_values, token).await;
                }
            }
        }

        let callee_value = self.eval_expr(callee, env).await?;
        match callee_value {
            Value::Function(f) => self.call_function(&f, arg_values, token).await,
            other => Err(Diagnostic::type_error(
                "T-NOT-CALLABLE",
                format!("{} values are not callable", other.type_name()),
            )
            .at(token.line, token.column)
            .into()),
        }
    }
}

fn unwrap_grouped(expr: &Expr) -> &Expr {
    match expr {
        Expr::Grouped { inner, .. } => unwrap_grouped(inner),
        other => other,
    }
}

fn loop_signal_error(token: &Token) -> Interrupt {
    Diagnostic::runtime(
        "R-LOOP-SIGNAL",
        "skip and stop are only meaningful inside a for loop",
    )
    .at(token.line, token.column)
    .into()
}

/// The dictionary `try` yields when the wrapped call fails.
pub(crate) fn error_dict(d: &Diagnostic) -> Value {
    let mut map = OrderedMap::new();
    map.insert("error", Value::Bool(true));
    map.insert("class", Value::str(d.class.as_str()));
    map.insert("code", Value::str(&d.code));
    map.insert("message", Value::str(&d.message));
    map.insert("line", Value::Int(d.line as i64));
    map.insert("column", Value::Int(d.column as i64));
    if !d.hints.is_empty() {
        map.insert(
            "hints",
            Value::array(d.hints.iter().map(Value::str).collect()),
        );
    }
    Value::dict(map)
}

#[cfg(test)]
mod tests;
