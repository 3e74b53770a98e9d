//! Builtin functions and value methods.
//!
//! The builtin set is a registry frozen at startup; scripts cannot mutate
//! it. Methods dispatch on the receiver's type, including the capability
//! handles (`@DB`, `@SEARCH`, `@shell`).

use std::collections::HashSet;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::error::Diagnostic;
use crate::lexer::Token;
use crate::value::{Handle, OrderedMap, Value};

use super::{EvalResult, Evaluator};

static BUILTIN_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "len",
        "type",
        "str",
        "int",
        "float",
        "json",
        "parseJson",
        "keys",
        "values",
        "print",
        "log",
        "fragmentGet",
        "fragmentSet",
    ]
    .into_iter()
    .collect()
});

pub(crate) fn is_builtin(name: &str) -> bool {
    BUILTIN_NAMES.contains(name)
}

fn arity(
    name: &str,
    args: &[Value],
    expected: usize,
    token: &Token,
) -> EvalResult<()> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(Diagnostic::type_error(
            "T-ARITY",
            format!("{name}() takes {expected} argument(s), found {}", args.len()),
        )
        .at(token.line, token.column)
        .into())
    }
}

pub(crate) async fn call_builtin(
    evaluator: &Evaluator,
    name: &str,
    args: Vec<Value>,
    token: &Token,
) -> EvalResult<Value> {
    match name {
        "len" => {
            arity(name, &args, 1, token)?;
            let n = match &args[0] {
                Value::Str(s) => s.chars().count() as i64,
                Value::Array(items) => items.read().len() as i64,
                Value::Dict(map) => map.read().len() as i64,
                other => {
                    return Err(Diagnostic::type_error(
                        "T-LEN",
                        format!("len() is not defined for {}", other.type_name()),
                    )
                    .at(token.line, token.column)
                    .into());
                }
            };
            Ok(Value::Int(n))
        }
        "type" => {
            arity(name, &args, 1, token)?;
            Ok(Value::str(args[0].type_name()))
        }
        "str" => {
            arity(name, &args, 1, token)?;
            Ok(Value::str(args[0].to_display_string()))
        }
        "int" => {
            arity(name, &args, 1, token)?;
            match &args[0] {
                Value::Int(n) => Ok(Value::Int(*n)),
                Value::Float(f) => Ok(Value::Int(*f as i64)),
                Value::Bool(b) => Ok(Value::Int(*b as i64)),
                Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    Diagnostic::value_error(
                        "V-INT-PARSE",
                        format!("'{s}' is not an integer"),
                    )
                    .at(token.line, token.column)
                    .into()
                }),
                other => Err(Diagnostic::type_error(
                    "T-INT",
                    format!("int() is not defined for {}", other.type_name()),
                )
                .at(token.line, token.column)
                .into()),
            }
        }
        "float" => {
            arity(name, &args, 1, token)?;
            match &args[0] {
                Value::Int(n) => Ok(Value::Float(*n as f64)),
                Value::Float(f) => Ok(Value::Float(*f)),
                Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                    Diagnostic::value_error(
                        "V-FLOAT-PARSE",
                        format!("'{s}' is not a number"),
                    )
                    .at(token.line, token.column)
                    .into()
                }),
                other => Err(Diagnostic::type_error(
                    "T-FLOAT",
                    format!("float() is not defined for {}", other.type_name()),
                )
                .at(token.line, token.column)
                .into()),
            }
        }
        "json" => {
            arity(name, &args, 1, token)?;
            let json = args[0]
                .to_json_value()
                .map_err(|d| d.or_at(token.line, token.column))?;
            Ok(Value::str(json.to_string()))
        }
        "parseJson" => {
            arity(name, &args, 1, token)?;
            let text = args[0].to_display_string();
            let json: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
                Diagnostic::value_error("V-JSON", format!("invalid JSON: {e}"))
                    .at(token.line, token.column)
            })?;
            Ok(Value::from_json_value(&json))
        }
        "keys" => {
            arity(name, &args, 1, token)?;
            match &args[0] {
                Value::Dict(map) => Ok(Value::array(
                    map.read().keys().map(Value::str).collect(),
                )),
                other => Err(Diagnostic::type_error(
                    "T-KEYS",
                    format!("keys() is not defined for {}", other.type_name()),
                )
                .at(token.line, token.column)
                .into()),
            }
        }
        "values" => {
            arity(name, &args, 1, token)?;
            match &args[0] {
                Value::Dict(map) => Ok(Value::array(
                    map.read().iter().map(|(_, v)| v.clone()).collect(),
                )),
                other => Err(Diagnostic::type_error(
                    "T-VALUES",
                    format!("values() is not defined for {}", other.type_name()),
                )
                .at(token.line, token.column)
                .into()),
            }
        }
        "print" | "log" => {
            let line = args
                .iter()
                .map(|v| v.to_display_string())
                .collect::<Vec<_>>()
                .join(" ");
            tracing::info!(target: "parsley", "{line}");
            Ok(Value::Null)
        }
        "fragmentGet" => {
            arity(name, &args, 1, token)?;
            let key = args[0].to_display_string();
            Ok(evaluator
                .fragments
                .get(&key)
                .map(Value::str)
                .unwrap_or(Value::Null))
        }
        "fragmentSet" => {
            if args.len() != 2 && args.len() != 3 {
                return Err(Diagnostic::type_error(
                    "T-ARITY",
                    "fragmentSet(key, value[, ttl]) takes 2 or 3 arguments",
                )
                .at(token.line, token.column)
                .into());
            }
            let key = args[0].to_display_string();
            let value = args[1].to_display_string();
            let ttl = match args.get(2) {
                Some(Value::Int(secs)) => Duration::from_secs((*secs).max(0) as u64),
                Some(Value::Duration { secs, .. }) => {
                    Duration::from_secs((*secs).max(0) as u64)
                }
                _ => Duration::from_secs(60),
            };
            evaluator.fragments.put(&key, value.clone(), ttl);
            Ok(Value::str(value))
        }
        _ => Err(Diagnostic::runtime(
            "R-UNBOUND",
            format!("'{name}' is not defined"),
        )
        .at(token.line, token.column)
        .into()),
    }
}

impl Evaluator {
    /// Method dispatch: `value.method(args)`.
    pub(crate) async fn call_method(
        &self,
        receiver: &Value,
        method: &str,
        args: Vec<Value>,
        token: &Token,
    ) -> EvalResult<Value> {
        match receiver {
            Value::Handle(handle) => self.call_handle_method(handle, method, args, token).await,
            Value::Str(s) => string_method(s, method, &args, token),
            Value::Array(_) => array_method(receiver, method, &args, token),
            Value::Dict(map) => {
                // A function stored under the member name is called as a
                // method.
                let member = map.read().get(method).cloned();
                if let Some(Value::Function(f)) = member {
                    return self.call_function(&f, args, token).await;
                }
                dict_method(receiver, method, &args, token)
            }
            Value::Datetime(dt) => match method {
                "format" => {
                    let pattern = args
                        .first()
                        .map(|v| v.to_display_string())
                        .unwrap_or_else(|| "%Y-%m-%d %H:%M:%S".to_string());
                    Ok(Value::str(dt.format(&pattern).to_string()))
                }
                "year" => Ok(Value::Int(chrono::Datelike::year(dt) as i64)),
                _ => Err(no_method(receiver, method, token)),
            },
            Value::Function(f) if method == "call" => {
                self.call_function(f, args, token).await
            }
            _ => Err(no_method(receiver, method, token)),
        }
    }

    async fn call_handle_method(
        &self,
        handle: &Handle,
        method: &str,
        args: Vec<Value>,
        token: &Token,
    ) -> EvalResult<Value> {
        self.check_cancel()?;
        let result = match handle {
            Handle::Db(db) => match method {
                "queryOne" => {
                    let sql = args.first().map(|v| v.to_display_string()).unwrap_or_default();
                    let params = param_array(args.get(1));
                    db.query_one(&sql, &params)
                        .await
                        .map(|row| row.unwrap_or(Value::Null))
                }
                "queryMany" => {
                    let sql = args.first().map(|v| v.to_display_string()).unwrap_or_default();
                    let params = param_array(args.get(1));
                    db.query_many(&sql, &params).await.map(Value::array)
                }
                "exec" => {
                    let sql = args.first().map(|v| v.to_display_string()).unwrap_or_default();
                    let params = param_array(args.get(1));
                    db.exec(&sql, &params).await.map(Value::Int)
                }
                _ => return Err(no_handle_method("database", method, token)),
            },
            Handle::Search(search) => match method {
                "query" => {
                    let text = args.first().map(|v| v.to_display_string()).unwrap_or_default();
                    let limit = match args.get(1) {
                        Some(Value::Int(n)) => (*n).max(0) as usize,
                        _ => 20,
                    };
                    search.query(&text, limit).await.map(Value::array)
                }
                "add" | "update" => {
                    let id = args.first().map(|v| v.to_display_string()).unwrap_or_default();
                    let doc = args.get(1).cloned().unwrap_or(Value::Null);
                    let call = if method == "add" {
                        search.add(&id, doc).await
                    } else {
                        search.update(&id, doc).await
                    };
                    call.map(|_| Value::Null)
                }
                "remove" => {
                    let id = args.first().map(|v| v.to_display_string()).unwrap_or_default();
                    search.remove(&id).await.map(|_| Value::Null)
                }
                "reindex" => search.reindex().await.map(|_| Value::Null),
                "stats" => search.stats().await,
                _ => return Err(no_handle_method("search", method, token)),
            },
            Handle::Shell(shell) => match method {
                "run" => {
                    let cmd = args.first().map(|v| v.to_display_string()).unwrap_or_default();
                    let stdin = args.get(1).map(|v| v.to_display_string()).unwrap_or_default();
                    shell.run(&cmd, stdin.as_bytes()).await.map(|out| {
                        let mut map = OrderedMap::new();
                        map.insert("stdout", Value::str(out.stdout));
                        map.insert("stderr", Value::str(out.stderr));
                        map.insert("code", Value::Int(out.code as i64));
                        Value::dict(map)
                    })
                }
                _ => return Err(no_handle_method("shell", method, token)),
            },
            Handle::Session(_) | Handle::FileCursor(_) => {
                return Err(no_handle_method("this", method, token));
            }
        };
        self.check_cancel()?;
        result.map_err(|d| d.or_at(token.line, token.column).into())
    }
}

fn param_array(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.read().clone(),
        Some(other) => vec![other.clone()],
        None => Vec::new(),
    }
}

fn no_method(receiver: &Value, method: &str, token: &Token) -> super::Interrupt {
    Diagnostic::type_error(
        "T-NO-METHOD",
        format!("{} values have no method '{method}'", receiver.type_name()),
    )
    .at(token.line, token.column)
    .into()
}

fn no_handle_method(kind: &str, method: &str, token: &Token) -> super::Interrupt {
    Diagnostic::runtime(
        "R-NO-METHOD",
        format!("{kind} handles have no operation '{method}'"),
    )
    .at(token.line, token.column)
    .into()
}

fn string_method(
    s: &std::sync::Arc<str>,
    method: &str,
    args: &[Value],
    token: &Token,
) -> EvalResult<Value> {
    match method {
        "upper" => Ok(Value::str(s.to_uppercase())),
        "lower" => Ok(Value::str(s.to_lowercase())),
        "trim" => Ok(Value::str(s.trim())),
        "len" => Ok(Value::Int(s.chars().count() as i64)),
        "contains" => {
            let needle = args.first().map(|v| v.to_display_string()).unwrap_or_default();
            Ok(Value::Bool(s.contains(&needle)))
        }
        "startsWith" => {
            let prefix = args.first().map(|v| v.to_display_string()).unwrap_or_default();
            Ok(Value::Bool(s.starts_with(&prefix)))
        }
        "endsWith" => {
            let suffix = args.first().map(|v| v.to_display_string()).unwrap_or_default();
            Ok(Value::Bool(s.ends_with(&suffix)))
        }
        "split" => {
            let separator = args.first().map(|v| v.to_display_string()).unwrap_or_default();
            let parts: Vec<Value> = if separator.is_empty() {
                s.chars().map(|c| Value::str(c.to_string())).collect()
            } else {
                s.split(&separator).map(Value::str).collect()
            };
            Ok(Value::array(parts))
        }
        "replace" => {
            let from = args.first().map(|v| v.to_display_string()).unwrap_or_default();
            let to = args.get(1).map(|v| v.to_display_string()).unwrap_or_default();
            Ok(Value::str(s.replace(&from, &to)))
        }
        _ => Err(no_method(&Value::Str(s.clone()), method, token)),
    }
}

fn array_method(
    receiver: &Value,
    method: &str,
    args: &[Value],
    token: &Token,
) -> EvalResult<Value> {
    let Value::Array(items) = receiver else {
        unreachable!()
    };
    match method {
        "len" => Ok(Value::Int(items.read().len() as i64)),
        "push" => {
            for arg in args {
                items.write().push(arg.clone());
            }
            Ok(receiver.clone())
        }
        "pop" => Ok(items.write().pop().unwrap_or(Value::Null)),
        "first" => Ok(items.read().first().cloned().unwrap_or(Value::Null)),
        "last" => Ok(items.read().last().cloned().unwrap_or(Value::Null)),
        "reverse" => {
            let mut copy = items.read().clone();
            copy.reverse();
            Ok(Value::array(copy))
        }
        "join" => {
            let separator = args.first().map(|v| v.to_display_string()).unwrap_or_default();
            let joined = items
                .read()
                .iter()
                .map(|v| v.to_display_string())
                .collect::<Vec<_>>()
                .join(&separator);
            Ok(Value::str(joined))
        }
        "contains" => {
            let needle = args.first().cloned().unwrap_or(Value::Null);
            Ok(Value::Bool(items.read().iter().any(|v| v.eq_value(&needle))))
        }
        _ => Err(no_method(receiver, method, token)),
    }
}

fn dict_method(
    receiver: &Value,
    method: &str,
    args: &[Value],
    token: &Token,
) -> EvalResult<Value> {
    let Value::Dict(map) = receiver else {
        unreachable!()
    };
    match method {
        "len" => Ok(Value::Int(map.read().len() as i64)),
        "keys" => Ok(Value::array(map.read().keys().map(Value::str).collect())),
        "values" => Ok(Value::array(
            map.read().iter().map(|(_, v)| v.clone()).collect(),
        )),
        "has" => {
            let key = args.first().map(|v| v.to_display_string()).unwrap_or_default();
            Ok(Value::Bool(map.read().contains_key(&key)))
        }
        "remove" => {
            let key = args.first().map(|v| v.to_display_string()).unwrap_or_default();
            Ok(map.write().remove(&key).unwrap_or(Value::Null))
        }
        _ => Err(no_method(receiver, method, token)),
    }
}
