//! Operator semantics: arithmetic, comparison, membership, regex matching,
//! indexing, and member access.
//!
//! Integer arithmetic is checked 64-bit two's-complement; overflow is a
//! value error, never a wrap. Floats follow IEEE-754 with NaN propagation.
//! Money arithmetic is scale-preserving and single-currency.

use crate::env::EnvRef;
use crate::error::Diagnostic;
use crate::lexer::Token;
use crate::parser::ast::{Expr, InfixOp, PrefixOp};
use crate::value::Value;

use super::{EvalResult, Evaluator, Interrupt};

pub(crate) fn as_int(value: &Value, token: &Token) -> EvalResult<i64> {
    match value {
        Value::Int(n) => Ok(*n),
        other => Err(Diagnostic::type_error(
            "T-EXPECT-INT",
            format!("expected an integer, found {}", other.type_name()),
        )
        .at(token.line, token.column)
        .into()),
    }
}

fn at(d: Diagnostic, token: &Token) -> Interrupt {
    d.or_at(token.line, token.column).into()
}

pub(crate) fn prefix(op: PrefixOp, value: Value, token: &Token) -> EvalResult<Value> {
    match op {
        PrefixOp::Not => Ok(Value::Bool(!value.is_truthy())),
        PrefixOp::Neg => match value {
            Value::Int(n) => n
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| at(overflow("negation"), token)),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Money(m) => m.negate().map(Value::Money).map_err(|d| at(d, token)),
            Value::Duration { months, secs } => Ok(Value::Duration {
                months: -months,
                secs: -secs,
            }),
            other => Err(at(
                Diagnostic::type_error(
                    "T-NEG",
                    format!("cannot negate {}", other.type_name()),
                ),
                token,
            )),
        },
    }
}

fn overflow(what: &str) -> Diagnostic {
    Diagnostic::value_error("V-ARITH-OVERFLOW", format!("integer {what} overflowed"))
}

fn type_mismatch(op: &str, left: &Value, right: &Value) -> Diagnostic {
    Diagnostic::type_error(
        "T-OP",
        format!(
            "'{op}' is not defined for {} and {}",
            left.type_name(),
            right.type_name()
        ),
    )
}

impl Evaluator {
    /// Infix dispatch. `and`/`or`/`??` short-circuit, so the right operand
    /// is evaluated lazily here rather than by the generic path.
    pub(crate) async fn eval_infix(
        &self,
        op: InfixOp,
        left: &Expr,
        right: &Expr,
        env: &EnvRef,
        token: &Token,
    ) -> EvalResult<Value> {
        match op {
            InfixOp::And => {
                let l = self.eval_expr(left, env).await?;
                if !l.is_truthy() {
                    return Ok(l);
                }
                return self.eval_expr(right, env).await;
            }
            InfixOp::Or => {
                let l = self.eval_expr(left, env).await?;
                if l.is_truthy() {
                    return Ok(l);
                }
                return self.eval_expr(right, env).await;
            }
            InfixOp::Nullish => {
                let l = self.eval_expr(left, env).await?;
                if !matches!(l, Value::Null) {
                    return Ok(l);
                }
                return self.eval_expr(right, env).await;
            }
            InfixOp::QueryOne | InfixOp::QueryMany | InfixOp::ExecSql => {
                return self.eval_db_infix(op, left, right, env, token).await;
            }
            InfixOp::ShellPipe => {
                return self.eval_shell_pipe(left, right, env, token).await;
            }
            _ => {}
        }

        let l = self.eval_expr(left, env).await?;
        let r = self.eval_expr(right, env).await?;
        binary(op, &l, &r, token)
    }
}

pub(crate) fn binary(op: InfixOp, l: &Value, r: &Value, token: &Token) -> EvalResult<Value> {
    match op {
        InfixOp::Add => add(l, r, token),
        InfixOp::Sub => sub(l, r, token),
        InfixOp::Mul => mul(l, r, token),
        InfixOp::Div => div(l, r, token),
        InfixOp::Rem => rem(l, r, token),
        InfixOp::Concat => concat(l, r, token),
        InfixOp::Range => range(l, r, token),
        InfixOp::Eq => Ok(Value::Bool(l.eq_value(r))),
        InfixOp::NotEq => Ok(Value::Bool(!l.eq_value(r))),
        InfixOp::Lt | InfixOp::Gt | InfixOp::Le | InfixOp::Ge => compare(op, l, r, token),
        InfixOp::In => membership(l, r, token).map(Value::Bool),
        InfixOp::NotIn => membership(l, r, token).map(|b| Value::Bool(!b)),
        InfixOp::Match => regex_match(l, r, token).map(Value::Bool),
        InfixOp::NotMatch => regex_match(l, r, token).map(|b| Value::Bool(!b)),
        // Short-circuit and capability operators are handled upstream.
        _ => Err(at(
            Diagnostic::runtime("R-OP", "operator not handled in this position"),
            token,
        )),
    }
}

fn add(l: &Value, r: &Value, token: &Token) -> EvalResult<Value> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => a
            .checked_add(*b)
            .map(Value::Int)
            .ok_or_else(|| at(overflow("addition"), token)),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 + b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a + *b as f64)),
        (Value::Money(a), Value::Money(b)) => {
            a.checked_add(b).map(Value::Money).map_err(|d| at(d, token))
        }
        (Value::Str(_), _) | (_, Value::Str(_)) => Err(at(
            Diagnostic::type_error(
                "T-STR-PLUS",
                "'+' is not defined for strings; use '++' to concatenate",
            ),
            token,
        )),
        (Value::Datetime(dt), Value::Duration { months, secs }) => {
            Ok(Value::Datetime(shift_datetime(*dt, *months, *secs)))
        }
        (Value::Date(d), Value::Duration { months, secs }) => {
            Ok(Value::Date(shift_date(*d, *months, *secs)))
        }
        (
            Value::Duration { months: am, secs: a_secs },
            Value::Duration { months: bm, secs: b_secs },
        ) => Ok(Value::Duration {
            months: am + bm,
            secs: a_secs + b_secs,
        }),
        _ => Err(at(type_mismatch("+", l, r), token)),
    }
}

fn sub(l: &Value, r: &Value, token: &Token) -> EvalResult<Value> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => a
            .checked_sub(*b)
            .map(Value::Int)
            .ok_or_else(|| at(overflow("subtraction"), token)),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a - b)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 - b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a - *b as f64)),
        (Value::Money(a), Value::Money(b)) => {
            a.checked_sub(b).map(Value::Money).map_err(|d| at(d, token))
        }
        (Value::Datetime(dt), Value::Duration { months, secs }) => {
            Ok(Value::Datetime(shift_datetime(*dt, -months, -secs)))
        }
        (Value::Date(d), Value::Duration { months, secs }) => {
            Ok(Value::Date(shift_date(*d, -months, -secs)))
        }
        (Value::Datetime(a), Value::Datetime(b)) => Ok(Value::Duration {
            months: 0,
            secs: (*a - *b).num_seconds(),
        }),
        _ => Err(at(type_mismatch("-", l, r), token)),
    }
}

fn mul(l: &Value, r: &Value, token: &Token) -> EvalResult<Value> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => a
            .checked_mul(*b)
            .map(Value::Int)
            .ok_or_else(|| at(overflow("multiplication"), token)),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a * b)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 * b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a * *b as f64)),
        // Money accepts an integer or float scalar on either side and
        // banker's-rounds to the currency scale.
        (Value::Money(m), Value::Int(n)) | (Value::Int(n), Value::Money(m)) => {
            m.mul_int(*n).map(Value::Money).map_err(|d| at(d, token))
        }
        (Value::Money(m), Value::Float(f)) | (Value::Float(f), Value::Money(m)) => {
            m.mul_float(*f).map(Value::Money).map_err(|d| at(d, token))
        }
        (Value::Money(_), Value::Money(_)) => Err(at(
            Diagnostic::type_error("T-MONEY-MUL", "cannot multiply money by money"),
            token,
        )),
        _ => Err(at(type_mismatch("*", l, r), token)),
    }
}

fn div(l: &Value, r: &Value, token: &Token) -> EvalResult<Value> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                Err(at(
                    Diagnostic::value_error("V-DIV-ZERO", "division by zero"),
                    token,
                ))
            } else {
                a.checked_div(*b)
                    .map(Value::Int)
                    .ok_or_else(|| at(overflow("division"), token))
            }
        }
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a / b)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 / b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a / *b as f64)),
        _ => Err(at(type_mismatch("/", l, r), token)),
    }
}

fn rem(l: &Value, r: &Value, token: &Token) -> EvalResult<Value> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                Err(at(
                    Diagnostic::value_error("V-DIV-ZERO", "remainder by zero"),
                    token,
                ))
            } else {
                a.checked_rem(*b)
                    .map(Value::Int)
                    .ok_or_else(|| at(overflow("remainder"), token))
            }
        }
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a % b)),
        _ => Err(at(type_mismatch("%", l, r), token)),
    }
}

fn concat(l: &Value, r: &Value, token: &Token) -> EvalResult<Value> {
    match (l, r) {
        (Value::Array(a), Value::Array(b)) => {
            let mut items = a.read().clone();
            items.extend(b.read().iter().cloned());
            Ok(Value::array(items))
        }
        (Value::Array(_), _) | (_, Value::Array(_)) => {
            Err(at(type_mismatch("++", l, r), token))
        }
        _ => {
            let mut s = l.to_display_string();
            s.push_str(&r.to_display_string());
            Ok(Value::str(s))
        }
    }
}

/// A range evaluated as a value materialises the half-open interval;
/// `for` loops over range syntax never reach this path.
fn range(l: &Value, r: &Value, token: &Token) -> EvalResult<Value> {
    let (start, end) = match (l, r) {
        (Value::Int(a), Value::Int(b)) => (*a, *b),
        _ => return Err(at(type_mismatch("..", l, r), token)),
    };
    const MATERIALISE_CAP: i64 = 10_000_000;
    if end.saturating_sub(start) > MATERIALISE_CAP {
        return Err(at(
            Diagnostic::value_error(
                "V-RANGE-SIZE",
                "range is too large to materialise; iterate it with `for` instead",
            ),
            token,
        ));
    }
    Ok(Value::array((start..end).map(Value::Int).collect()))
}

fn compare(op: InfixOp, l: &Value, r: &Value, token: &Token) -> EvalResult<Value> {
    use std::cmp::Ordering;
    let ordering = match (l, r) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Datetime(a), Value::Datetime(b)) => Some(a.cmp(b)),
        (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
        (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
        (Value::Money(a), Value::Money(b)) if a.currency == b.currency => {
            Some(a.minor.cmp(&b.minor))
        }
        _ => None,
    };
    let Some(ordering) = ordering else {
        // NaN comparisons and mismatched kinds are both false-producing
        // for equality but a type error for ordering.
        if matches!((l, r), (Value::Float(_), _) | (_, Value::Float(_))) {
            return Ok(Value::Bool(false));
        }
        return Err(at(type_mismatch("comparison", l, r), token));
    };
    Ok(Value::Bool(match op {
        InfixOp::Lt => ordering == Ordering::Less,
        InfixOp::Gt => ordering == Ordering::Greater,
        InfixOp::Le => ordering != Ordering::Greater,
        InfixOp::Ge => ordering != Ordering::Less,
        _ => unreachable!(),
    }))
}

/// `in` is linear membership on arrays and key presence on dictionaries.
fn membership(l: &Value, r: &Value, token: &Token) -> EvalResult<bool> {
    match r {
        Value::Array(items) => Ok(items.read().iter().any(|v| v.eq_value(l))),
        Value::Dict(map) => match l {
            Value::Str(key) => Ok(map.read().contains_key(key)),
            other => Err(at(
                Diagnostic::type_error(
                    "T-IN-KEY",
                    format!(
                        "dictionary membership tests a string key, found {}",
                        other.type_name()
                    ),
                ),
                token,
            )),
        },
        Value::Str(haystack) => match l {
            Value::Str(needle) => Ok(haystack.contains(needle.as_ref())),
            other => Err(at(
                Diagnostic::type_error(
                    "T-IN-STR",
                    format!(
                        "string membership tests a substring, found {}",
                        other.type_name()
                    ),
                ),
                token,
            )),
        },
        other => Err(at(
            Diagnostic::type_error(
                "T-IN",
                format!("'in' expects an array or dictionary, found {}", other.type_name()),
            ),
            token,
        )),
    }
}

fn regex_match(l: &Value, r: &Value, token: &Token) -> EvalResult<bool> {
    let text = match l {
        Value::Str(s) => s.to_string(),
        other => other.to_display_string(),
    };
    match r {
        Value::Regex(re) => Ok(re.compiled.is_match(&text)),
        Value::Str(pattern) => {
            let re = crate::value::RegexValue::compile(pattern, "")
                .map_err(|d| at(d, token))?;
            Ok(re.compiled.is_match(&text))
        }
        other => Err(at(
            Diagnostic::type_error(
                "T-MATCH",
                format!("'~' expects a regex on the right, found {}", other.type_name()),
            ),
            token,
        )),
    }
}

fn shift_datetime(
    dt: chrono::DateTime<chrono::Utc>,
    months: i32,
    secs: i64,
) -> chrono::DateTime<chrono::Utc> {
    let with_months = if months >= 0 {
        dt.checked_add_months(chrono::Months::new(months as u32))
    } else {
        dt.checked_sub_months(chrono::Months::new((-months) as u32))
    }
    .unwrap_or(dt);
    with_months + chrono::Duration::seconds(secs)
}

fn shift_date(d: chrono::NaiveDate, months: i32, secs: i64) -> chrono::NaiveDate {
    let with_months = if months >= 0 {
        d.checked_add_months(chrono::Months::new(months as u32))
    } else {
        d.checked_sub_months(chrono::Months::new((-months) as u32))
    }
    .unwrap_or(d);
    with_months + chrono::Duration::seconds(secs)
}

// ---------------------------------------------------------------------------
// Indexing and member access
// ---------------------------------------------------------------------------

pub(crate) fn index(target: &Value, key: &Value, token: &Token) -> EvalResult<Value> {
    match (target, key) {
        (Value::Array(items), Value::Int(i)) => {
            let items = items.read();
            let idx = normalise_index(*i, items.len());
            items.get(idx).cloned().ok_or_else(|| {
                at(
                    Diagnostic::value_error(
                        "V-INDEX",
                        format!("index {i} is out of bounds (length {})", items.len()),
                    ),
                    token,
                )
            })
        }
        (Value::Dict(map), Value::Str(key)) => {
            Ok(map.read().get(key).cloned().unwrap_or(Value::Null))
        }
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = normalise_index(*i, chars.len());
            chars
                .get(idx)
                .map(|c| Value::str(c.to_string()))
                .ok_or_else(|| {
                    at(
                        Diagnostic::value_error(
                            "V-INDEX",
                            format!("index {i} is out of bounds (length {})", chars.len()),
                        ),
                        token,
                    )
                })
        }
        _ => Err(at(
            Diagnostic::type_error(
                "T-INDEX",
                format!(
                    "cannot index {} with {}",
                    target.type_name(),
                    key.type_name()
                ),
            ),
            token,
        )),
    }
}

/// Negative indices count from the end.
fn normalise_index(i: i64, len: usize) -> usize {
    if i < 0 {
        len.saturating_sub((-i) as usize)
    } else {
        i as usize
    }
}

pub(crate) fn slice(
    target: &Value,
    from: Option<&Value>,
    to: Option<&Value>,
    token: &Token,
) -> EvalResult<Value> {
    let bounds = |len: usize| -> EvalResult<(usize, usize)> {
        let start = match from {
            Some(Value::Int(i)) => normalise_index(*i, len).min(len),
            None => 0,
            Some(other) => {
                return Err(at(
                    Diagnostic::type_error(
                        "T-SLICE",
                        format!("slice bounds must be integers, found {}", other.type_name()),
                    ),
                    token,
                ));
            }
        };
        let end = match to {
            Some(Value::Int(i)) => normalise_index(*i, len).min(len),
            None => len,
            Some(other) => {
                return Err(at(
                    Diagnostic::type_error(
                        "T-SLICE",
                        format!("slice bounds must be integers, found {}", other.type_name()),
                    ),
                    token,
                ));
            }
        };
        Ok((start, end.max(start)))
    };
    match target {
        Value::Array(items) => {
            let items = items.read();
            let (start, end) = bounds(items.len())?;
            Ok(Value::array(items[start..end].to_vec()))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (start, end) = bounds(chars.len())?;
            Ok(Value::str(chars[start..end].iter().collect::<String>()))
        }
        other => Err(at(
            Diagnostic::type_error(
                "T-SLICE",
                format!("cannot slice {}", other.type_name()),
            ),
            token,
        )),
    }
}

pub(crate) fn dot(target: &Value, field: &str, token: &Token) -> EvalResult<Value> {
    match target {
        Value::Dict(map) => Ok(map.read().get(field).cloned().unwrap_or(Value::Null)),
        other => Err(at(
            Diagnostic::type_error(
                "T-DOT",
                format!("{} values have no member '{field}'", other.type_name()),
            ),
            token,
        )),
    }
}

pub(crate) fn index_assign(
    container: &Value,
    key: &Value,
    value: Value,
    token: &Token,
) -> EvalResult<()> {
    match (container, key) {
        (Value::Array(items), Value::Int(i)) => {
            let mut items = items.write();
            let len = items.len();
            let idx = normalise_index(*i, len);
            if idx < len {
                items[idx] = value;
                Ok(())
            } else if idx == len {
                items.push(value);
                Ok(())
            } else {
                Err(at(
                    Diagnostic::value_error(
                        "V-INDEX",
                        format!("index {i} is out of bounds (length {len})"),
                    ),
                    token,
                ))
            }
        }
        (Value::Dict(map), Value::Str(key)) => {
            map.write().insert(key.to_string(), value);
            Ok(())
        }
        _ => Err(at(
            Diagnostic::type_error(
                "T-INDEX-ASSIGN",
                format!(
                    "cannot assign into {} with {}",
                    container.type_name(),
                    key.type_name()
                ),
            ),
            token,
        )),
    }
}
