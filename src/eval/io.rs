//! Reader/writer operator semantics.
//!
//! Each operator is defined by the capability of its target type: paths go
//! through the file capability, URLs through the HTTP fetcher, SQL strings
//! through the database executor, commands through the shell. Capability
//! calls are cancellation checkpoints on both sides.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::env::EnvRef;
use crate::error::Diagnostic;
use crate::lexer::Token;
use crate::parser::ast::{Expr, InfixOp, Pattern, ReadOp, ReadStmt, WriteOp, WriteStmt};
use crate::value::{FileCursor, Handle, Value};

use super::{EvalResult, Evaluator};

impl Evaluator {
    pub(crate) async fn eval_read(&self, read: &ReadStmt, env: &EnvRef) -> EvalResult<Value> {
        let token = &read.token;
        let value = match read.op {
            ReadOp::Read => {
                let source = self.eval_expr(&read.source, env).await?;
                let content = self.read_all_of(&source, token).await?;
                // Destructuring targets read structured (JSON) content.
                match &read.target {
                    Pattern::Name(_) => content,
                    _ => parse_structured(&content, token)?,
                }
            }
            ReadOp::Fetch => {
                let source = self.eval_expr(&read.source, env).await?;
                self.fetch_url(&source, token).await?
            }
            ReadOp::PipeRead => {
                let source = self.eval_expr(&read.source, env).await?;
                self.pipe_read(&source, token).await?
            }
            ReadOp::QueryOne | ReadOp::QueryMany | ReadOp::Exec => {
                let sql = self.eval_sql_text(&read.source, env, token).await?;
                let params = match &read.params {
                    Some(p) => self.eval_param_array(p, env, token).await?,
                    None => Vec::new(),
                };
                self.run_sql(read.op, &sql, &params, self.caps.db.clone(), token)
                    .await?
            }
        };
        self.bind_pattern(&read.target, value, env, true, token)?;
        Ok(Value::Null)
    }

    pub(crate) async fn eval_write(&self, write: &WriteStmt, env: &EnvRef) -> EvalResult<Value> {
        let token = &write.token;
        let value = self.eval_expr(&write.value, env).await?;
        let target = self.eval_expr(&write.target, env).await?;
        let bytes = value.to_display_string().into_bytes();
        let append = matches!(write.op, WriteOp::Append | WriteOp::RemoteAppend);

        match (&write.op, &target) {
            (WriteOp::Write | WriteOp::Append, Value::Path(path)) => {
                self.check_cancel()?;
                self.caps
                    .fs
                    .write(path, &bytes, append)
                    .await
                    .map_err(|d| d.or_at(token.line, token.column))?;
                self.check_cancel()?;
                Ok(Value::Null)
            }
            (WriteOp::Write | WriteOp::Append, Value::Str(path)) => {
                self.check_cancel()?;
                self.caps
                    .fs
                    .write(path, &bytes, append)
                    .await
                    .map_err(|d| d.or_at(token.line, token.column))?;
                self.check_cancel()?;
                Ok(Value::Null)
            }
            (WriteOp::RemoteWrite | WriteOp::RemoteAppend, Value::Url(url)) => {
                Err(Diagnostic::io(
                    "IO-REMOTE-SINK",
                    format!(
                        "no remote sink is configured for '{}' targets",
                        url.scheme()
                    ),
                )
                .at(token.line, token.column)
                .into())
            }
            (_, other) => Err(Diagnostic::type_error(
                "T-WRITE-TARGET",
                format!("cannot write to {}", other.type_name()),
            )
            .at(token.line, token.column)
            .into()),
        }
    }

    /// `<==`: read the entire contents of the source.
    async fn read_all_of(&self, source: &Value, token: &Token) -> EvalResult<Value> {
        match source {
            Value::Path(path) => {
                self.check_cancel()?;
                let bytes = self
                    .caps
                    .fs
                    .read_all(path)
                    .await
                    .map_err(|d| d.or_at(token.line, token.column))?;
                self.check_cancel()?;
                Ok(Value::str(String::from_utf8_lossy(&bytes)))
            }
            Value::Str(path) => {
                self.check_cancel()?;
                let bytes = self
                    .caps
                    .fs
                    .read_all(path)
                    .await
                    .map_err(|d| d.or_at(token.line, token.column))?;
                self.check_cancel()?;
                Ok(Value::str(String::from_utf8_lossy(&bytes)))
            }
            Value::Url(_) => self.fetch_url(source, token).await,
            Value::Handle(Handle::FileCursor(cursor)) => {
                let mut cursor = cursor.write();
                let split_at = cursor.next.min(cursor.lines.len());
                let rest = cursor.lines.split_off(split_at);
                cursor.next = cursor.lines.len();
                Ok(Value::str(rest.join("\n")))
            }
            other => Err(Diagnostic::type_error(
                "T-READ-SOURCE",
                format!("cannot read from {}", other.type_name()),
            )
            .at(token.line, token.column)
            .into()),
        }
    }

    /// `<=/=`: HTTP GET with the body decoded by content type.
    async fn fetch_url(&self, source: &Value, token: &Token) -> EvalResult<Value> {
        let url = match source {
            Value::Url(url) => url.clone(),
            Value::Str(text) => Arc::new(url::Url::parse(text).map_err(|e| {
                Diagnostic::value_error("V-URL", format!("invalid URL: {e}"))
                    .at(token.line, token.column)
            })?),
            other => {
                return Err(Diagnostic::type_error(
                    "T-FETCH-SOURCE",
                    format!("cannot fetch from {}", other.type_name()),
                )
                .at(token.line, token.column)
                .into());
            }
        };
        self.check_cancel()?;
        let response = self
            .caps
            .http
            .get(&url, &[])
            .await
            .map_err(|d| d.or_at(token.line, token.column))?;
        self.check_cancel()?;
        if response.status >= 400 {
            return Err(Diagnostic::io(
                "IO-FETCH-STATUS",
                format!("GET {url} returned status {}", response.status),
            )
            .at(token.line, token.column)
            .into());
        }
        let content_type = response.content_type.as_deref().unwrap_or("");
        if content_type.contains("json") {
            let json: serde_json::Value =
                serde_json::from_slice(&response.body).map_err(|e| {
                    Diagnostic::io(
                        "IO-FETCH-DECODE",
                        format!("GET {url}: body is not valid JSON: {e}"),
                    )
                    .at(token.line, token.column)
                })?;
            Ok(Value::from_json_value(&json))
        } else {
            Ok(Value::str(String::from_utf8_lossy(&response.body)))
        }
    }

    /// `|<`: read the next line from a cursor over the source, creating the
    /// cursor on first use. Cursors are scoped to the request.
    async fn pipe_read(&self, source: &Value, token: &Token) -> EvalResult<Value> {
        let cursor_value = match source {
            Value::Handle(Handle::FileCursor(_)) => source.clone(),
            Value::Path(path) | Value::Str(path) => {
                let key = path.to_string();
                let existing = self.cursors.lock().get(&key).cloned();
                match existing {
                    Some(v) => v,
                    None => {
                        self.check_cancel()?;
                        let bytes = self
                            .caps
                            .fs
                            .read_all(&key)
                            .await
                            .map_err(|d| d.or_at(token.line, token.column))?;
                        self.check_cancel()?;
                        let lines = String::from_utf8_lossy(&bytes)
                            .lines()
                            .map(|l| l.to_string())
                            .collect();
                        let cursor = Value::Handle(Handle::FileCursor(Arc::new(RwLock::new(
                            FileCursor {
                                path: key.clone(),
                                lines,
                                next: 0,
                            },
                        ))));
                        self.cursors.lock().insert(key, cursor.clone());
                        cursor
                    }
                }
            }
            other => {
                return Err(Diagnostic::type_error(
                    "T-READ-SOURCE",
                    format!("cannot read lines from {}", other.type_name()),
                )
                .at(token.line, token.column)
                .into());
            }
        };
        let Value::Handle(Handle::FileCursor(cursor)) = cursor_value else {
            unreachable!()
        };
        let mut cursor = cursor.write();
        if cursor.next < cursor.lines.len() {
            let line = cursor.lines[cursor.next].clone();
            cursor.next += 1;
            Ok(Value::str(line))
        } else {
            Ok(Value::Null)
        }
    }

    pub(crate) async fn eval_sql_text(
        &self,
        expr: &Expr,
        env: &EnvRef,
        token: &Token,
    ) -> EvalResult<String> {
        match self.eval_expr(expr, env).await? {
            Value::Str(s) => Ok(s.to_string()),
            other => Err(Diagnostic::type_error(
                "T-SQL",
                format!("expected a SQL string, found {}", other.type_name()),
            )
            .at(token.line, token.column)
            .into()),
        }
    }

    pub(crate) async fn eval_param_array(
        &self,
        expr: &Expr,
        env: &EnvRef,
        token: &Token,
    ) -> EvalResult<Vec<Value>> {
        match self.eval_expr(expr, env).await? {
            Value::Array(items) => Ok(items.read().clone()),
            other => Err(Diagnostic::type_error(
                "T-SQL-PARAMS",
                format!("query parameters must be an array, found {}", other.type_name()),
            )
            .at(token.line, token.column)
            .into()),
        }
    }

    pub(crate) async fn run_sql(
        &self,
        op: ReadOp,
        sql: &str,
        params: &[Value],
        db: Arc<dyn crate::capability::DbExecutor>,
        token: &Token,
    ) -> EvalResult<Value> {
        self.check_cancel()?;
        let result = match op {
            ReadOp::QueryOne => db
                .query_one(sql, params)
                .await
                .map(|row| row.unwrap_or(Value::Null)),
            ReadOp::QueryMany => db.query_many(sql, params).await.map(Value::array),
            ReadOp::Exec => db.exec(sql, params).await.map(Value::Int),
            _ => unreachable!("run_sql called with a non-database operator"),
        };
        self.check_cancel()?;
        result.map_err(|d| d.or_at(token.line, token.column).into())
    }

    /// Database operators in expression position:
    /// `sql <=??=> db-handle`, or `sql <=??=> [params]` against the
    /// default database.
    pub(crate) async fn eval_db_infix(
        &self,
        op: InfixOp,
        left: &Expr,
        right: &Expr,
        env: &EnvRef,
        token: &Token,
    ) -> EvalResult<Value> {
        let read_op = match op {
            InfixOp::QueryOne => ReadOp::QueryOne,
            InfixOp::QueryMany => ReadOp::QueryMany,
            _ => ReadOp::Exec,
        };
        let sql = self.eval_sql_text(left, env, token).await?;
        let right_value = self.eval_expr(right, env).await?;
        let (db, params): (Arc<dyn crate::capability::DbExecutor>, Vec<Value>) =
            match right_value {
                Value::Handle(Handle::Db(db)) => (db, Vec::new()),
                Value::Array(items) => (self.caps.db.clone(), items.read().clone()),
                other => {
                    return Err(Diagnostic::type_error(
                        "T-DB-TARGET",
                        format!(
                            "the right side of a database operator must be a connection or a parameter array, found {}",
                            other.type_name()
                        ),
                    )
                    .at(token.line, token.column)
                    .into());
                }
            };
        self.run_sql(read_op, &sql, &params, db, token).await
    }

    /// `cmd <=#=> input`: spawn a subprocess, feed `input` on stdin, and
    /// return stdout. A non-zero exit is an io error carrying stderr.
    pub(crate) async fn eval_shell_pipe(
        &self,
        left: &Expr,
        right: &Expr,
        env: &EnvRef,
        token: &Token,
    ) -> EvalResult<Value> {
        let cmd = match self.eval_expr(left, env).await? {
            Value::Str(s) => s.to_string(),
            other => {
                return Err(Diagnostic::type_error(
                    "T-SHELL",
                    format!("the command must be a string, found {}", other.type_name()),
                )
                .at(token.line, token.column)
                .into());
            }
        };
        let input = self.eval_expr(right, env).await?.to_display_string();
        self.check_cancel()?;
        let output = self
            .caps
            .shell
            .run(&cmd, input.as_bytes())
            .await
            .map_err(|d| d.or_at(token.line, token.column))?;
        self.check_cancel()?;
        if output.code != 0 {
            return Err(Diagnostic::io(
                "IO-SHELL-EXIT",
                format!(
                    "'{cmd}' exited with status {}: {}",
                    output.code,
                    output.stderr.trim()
                ),
            )
            .at(token.line, token.column)
            .into());
        }
        Ok(Value::str(output.stdout))
    }
}

fn parse_structured(content: &Value, token: &Token) -> EvalResult<Value> {
    let text = match content {
        Value::Str(s) => s.to_string(),
        other => return Ok(other.clone()),
    };
    let json: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
        Diagnostic::value_error(
            "V-DESTRUCTURE-JSON",
            format!("destructuring read requires JSON content: {e}"),
        )
        .at(token.line, token.column)
    })?;
    Ok(Value::from_json_value(&json))
}
