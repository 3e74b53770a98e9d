//! Runtime values for the Parsley evaluator.
//!
//! Values are cheap to clone: containers share storage through `Arc`, which
//! also gives scripts the aliasing semantics they expect (two names bound to
//! one array observe each other's writes). A request never runs scripts in
//! parallel, so the interior locks are uncontended in practice.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use parking_lot::RwLock;
use url::Url;

use crate::capability::{DbExecutor, SearchIndex, SessionStore, ShellExec};
use crate::error::Diagnostic;
use crate::money::Money;
use crate::parser::ast::Block;

/// An insertion-ordered string-keyed map.
#[derive(Debug, Default, Clone)]
pub struct OrderedMap {
    entries: Vec<(String, Value)>,
    index: HashMap<String, usize>,
}

impl OrderedMap {
    pub fn new() -> OrderedMap {
        OrderedMap::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.index.get(key).map(|i| &self.entries[*i].1)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.index.get(&key) {
            Some(i) => self.entries[*i].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let i = self.index.remove(key)?;
        let (_, value) = self.entries.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.iter().map(|(k, _)| k)
    }
}

impl FromIterator<(String, Value)> for OrderedMap {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> OrderedMap {
        let mut map = OrderedMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// A user function: parameters closed over a definition environment.
pub struct FunctionValue {
    pub name: Option<String>,
    pub params: Vec<String>,
    /// Name of a trailing `...rest` parameter, if declared.
    pub rest: Option<String>,
    pub body: Arc<Block>,
    pub env: crate::env::EnvRef,
}

impl fmt::Debug for FunctionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<fn {}>",
            self.name.as_deref().unwrap_or("(anonymous)")
        )
    }
}

/// A compiled regex value with its original flags.
#[derive(Debug)]
pub struct RegexValue {
    pub pattern: String,
    pub flags: String,
    pub compiled: regex::Regex,
}

impl RegexValue {
    /// Compile a pattern with the supported PCRE-subset flags (`i`, `m`,
    /// `s`, `x`). Unknown flags are a value error.
    pub fn compile(pattern: &str, flags: &str) -> Result<RegexValue, Diagnostic> {
        for f in flags.chars() {
            if !matches!(f, 'i' | 'm' | 's' | 'x') {
                return Err(Diagnostic::value_error(
                    "V-REGEX-FLAG",
                    format!("unsupported regex flag '{f}' (supported: i, m, s, x)"),
                ));
            }
        }
        let source = if flags.is_empty() {
            pattern.to_string()
        } else {
            format!("(?{flags}){pattern}")
        };
        let compiled = regex::Regex::new(&source).map_err(|e| {
            Diagnostic::value_error("V-REGEX", format!("invalid regular expression: {e}"))
        })?;
        Ok(RegexValue {
            pattern: pattern.to_string(),
            flags: flags.to_string(),
            compiled,
        })
    }
}

/// Opaque resource handles minted by capability adapters.
#[derive(Clone)]
pub enum Handle {
    Db(Arc<dyn DbExecutor>),
    Search(Arc<dyn SearchIndex>),
    Session(Arc<dyn SessionStore>),
    /// An open file read cursor (`|<` reads one line at a time).
    FileCursor(Arc<RwLock<FileCursor>>),
    Shell(Arc<dyn ShellExec>),
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Handle::Db(_) => "<db>",
            Handle::Search(_) => "<search>",
            Handle::Session(_) => "<session-store>",
            Handle::FileCursor(_) => "<file-cursor>",
            Handle::Shell(_) => "<shell>",
        };
        f.write_str(label)
    }
}

/// Buffered line cursor over file contents, scoped to the expression that
/// opened it.
#[derive(Debug)]
pub struct FileCursor {
    pub path: String,
    pub lines: Vec<String>,
    pub next: usize,
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Array(Arc<RwLock<Vec<Value>>>),
    Dict(Arc<RwLock<OrderedMap>>),
    Function(Arc<FunctionValue>),
    Datetime(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    Duration {
        months: i32,
        secs: i64,
    },
    Money(Money),
    Path(Arc<str>),
    Url(Arc<Url>),
    Regex(Arc<RegexValue>),
    Handle(Handle),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(RwLock::new(items)))
    }

    pub fn dict(map: OrderedMap) -> Value {
        Value::Dict(Arc::new(RwLock::new(map)))
    }

    pub fn empty_dict() -> Value {
        Value::dict(OrderedMap::new())
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Array(items) => !items.read().is_empty(),
            Value::Dict(map) => !map.read().is_empty(),
            _ => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Dict(_) => "dictionary",
            Value::Function(_) => "function",
            Value::Datetime(_) => "datetime",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::Duration { .. } => "duration",
            Value::Money(_) => "money",
            Value::Path(_) => "path",
            Value::Url(_) => "url",
            Value::Regex(_) => "regex",
            Value::Handle(_) => "handle",
        }
    }

    /// Structural equality. NaN never equals anything, matching IEEE-754.
    pub fn eq_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Path(a), Value::Path(b)) => a == b,
            (Value::Url(a), Value::Url(b)) => a == b,
            (Value::Datetime(a), Value::Datetime(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            (
                Value::Duration { months: am, secs: a_secs },
                Value::Duration { months: bm, secs: b_secs },
            ) => am == bm && a_secs == b_secs,
            (Value::Money(a), Value::Money(b)) => a == b,
            (Value::Regex(a), Value::Regex(b)) => {
                a.pattern == b.pattern && a.flags == b.flags
            }
            (Value::Array(a), Value::Array(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.read(), b.read());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_value(y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.read(), b.read());
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).map(|w| v.eq_value(w)).unwrap_or(false))
            }
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Rendering used for HTML coercion and string interpolation.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.to_string(),
            Value::Array(items) => items
                .read()
                .iter()
                .map(|v| v.to_display_string())
                .collect::<Vec<_>>()
                .join(""),
            Value::Dict(_) => self
                .to_json_value()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            Value::Function(f) => format!("{f:?}"),
            Value::Datetime(dt) => dt.to_rfc3339(),
            Value::Date(d) => d.to_string(),
            Value::Time(t) => t.to_string(),
            Value::Duration { months, secs } => format_duration(*months, *secs),
            Value::Money(m) => m.to_string(),
            Value::Path(p) => p.to_string(),
            Value::Url(u) => u.to_string(),
            Value::Regex(r) => format!("/{}/{}", r.pattern, r.flags),
            Value::Handle(h) => format!("{h:?}"),
        }
    }

    /// Convert to a JSON value for API responses, session persistence, and
    /// parameter binding. Handles and functions do not serialise.
    pub fn to_json_value(&self) -> Result<serde_json::Value, Diagnostic> {
        use serde_json::Value as Json;
        Ok(match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::Number((*n).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.to_string()),
            Value::Array(items) => Json::Array(
                items
                    .read()
                    .iter()
                    .map(|v| v.to_json_value())
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Value::Dict(map) => {
                let mut obj = serde_json::Map::new();
                for (k, v) in map.read().iter() {
                    obj.insert(k.clone(), v.to_json_value()?);
                }
                Json::Object(obj)
            }
            Value::Datetime(dt) => Json::String(dt.to_rfc3339()),
            Value::Date(d) => Json::String(d.to_string()),
            Value::Time(t) => Json::String(t.to_string()),
            Value::Duration { months, secs } => {
                Json::String(format_duration(*months, *secs))
            }
            Value::Money(m) => Json::String(m.to_string()),
            Value::Path(p) => Json::String(p.to_string()),
            Value::Url(u) => Json::String(u.to_string()),
            Value::Regex(r) => Json::String(format!("/{}/{}", r.pattern, r.flags)),
            Value::Function(_) | Value::Handle(_) => {
                return Err(Diagnostic::type_error(
                    "T-NO-JSON",
                    format!("{} values cannot be serialised to JSON", self.type_name()),
                ));
            }
        })
    }

    pub fn from_json_value(json: &serde_json::Value) -> Value {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Value::str(s),
            Json::Array(items) => {
                Value::array(items.iter().map(Value::from_json_value).collect())
            }
            Json::Object(obj) => Value::dict(
                obj.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json_value(v)))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.eq_value(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

fn format_duration(months: i32, secs: i64) -> String {
    let mut out = String::new();
    let (mut months, mut secs) = (months, secs);
    if months < 0 || (months == 0 && secs < 0) {
        out.push('-');
        months = -months;
        secs = -secs;
    }
    let years = months / 12;
    let months = months % 12;
    if years > 0 {
        out.push_str(&format!("{years}y"));
    }
    if months > 0 {
        out.push_str(&format!("{months}mo"));
    }
    let (d, rem) = (secs / 86_400, secs % 86_400);
    let (h, rem) = (rem / 3_600, rem % 3_600);
    let (m, s) = (rem / 60, rem % 60);
    for (n, unit) in [(d, "d"), (h, "h"), (m, "m"), (s, "s")] {
        if n > 0 {
            out.push_str(&format!("{n}{unit}"));
        }
    }
    if out.is_empty() || out == "-" {
        out = "0s".to_string();
    }
    out
}
