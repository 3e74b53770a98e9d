use std::{fmt, io, path::StripPrefixError};

use axum::http::StatusCode;
use notify::{Error as NotifyError, ErrorKind as NotifyErrorKind};
use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use sqlx::Error as SqlxError;
use thiserror::Error;
use url::ParseError as UrlParseError;

/// Host-level failures: everything that can go wrong outside of a running
/// script. Script-level failures travel as [`Diagnostic`] values instead,
/// because scripts inspect them through `try`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum BasilError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Script cache error: {0}")]
    Cache(String),
    #[error("Capability error: {0}")]
    Capability(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Request cancelled")]
    Cancelled,
    #[error("Page Not Found")]
    PageNotFound,
    #[error("You do not have permission to access this resource")]
    PermissionDenied,
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Service error: {0}")]
    Service(String),
    #[error("Watcher error: {0}")]
    Watch(String),
    #[error("{0}")]
    Script(Diagnostic),
}

impl BasilError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BasilError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BasilError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BasilError::Capability(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BasilError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BasilError::NotFound(_) => StatusCode::NOT_FOUND,
            BasilError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            BasilError::PageNotFound => StatusCode::NOT_FOUND,
            BasilError::PermissionDenied => StatusCode::FORBIDDEN,
            BasilError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BasilError::Service(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BasilError::Watch(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BasilError::Script(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StripPrefixError> for BasilError {
    fn from(src: StripPrefixError) -> BasilError {
        BasilError::NotFound(format!("Strip prefix failed for path. Error: {src}"))
    }
}

impl From<serde_yaml::Error> for BasilError {
    fn from(src: serde_yaml::Error) -> BasilError {
        BasilError::Serialization(format!("YAML deserialization error: {src}"))
    }
}

impl From<JsonError> for BasilError {
    fn from(src: JsonError) -> BasilError {
        BasilError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<UrlParseError> for BasilError {
    fn from(src: UrlParseError) -> BasilError {
        BasilError::Serialization(format!("Invalid URL: {src}"))
    }
}

impl From<io::Error> for BasilError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => BasilError::NotFound(format!("{x}")),
            io::ErrorKind::PermissionDenied => BasilError::PermissionDenied,
            _ => BasilError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<fmt::Error> for BasilError {
    fn from(x: fmt::Error) -> Self {
        BasilError::Service(format!("{x}"))
    }
}

impl From<RegexError> for BasilError {
    fn from(x: RegexError) -> Self {
        BasilError::Serialization(format!("Regex parse failed: {x}"))
    }
}

impl From<SqlxError> for BasilError {
    fn from(db_error: SqlxError) -> Self {
        BasilError::Capability(format!("database error: {db_error:?}"))
    }
}

impl From<reqwest::Error> for BasilError {
    fn from(x: reqwest::Error) -> Self {
        BasilError::Capability(format!("http fetch error: {x}"))
    }
}

impl From<NotifyError> for BasilError {
    fn from(notify_error: NotifyError) -> Self {
        match notify_error.kind {
            NotifyErrorKind::Generic(msg) => BasilError::Watch(format!(
                "notify-debouncer: {}, paths: {:?}",
                msg, notify_error.paths
            )),
            NotifyErrorKind::Io(io_error) => BasilError::Watch(format!(
                "notify-debouncer: io error {}, paths: {:?}",
                io_error.kind(),
                notify_error.paths
            )),
            NotifyErrorKind::PathNotFound => BasilError::NotFound(format!(
                "notify-debouncer: path(s) not found: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::WatchNotFound => BasilError::NotFound(format!(
                "notify-debouncer: watch not found, paths: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::InvalidConfig(_) => {
                BasilError::Watch("notify-debouncer invalid config".to_string())
            }
            NotifyErrorKind::MaxFilesWatch => {
                BasilError::Watch("notify-debouncer max file watch limit reached".to_string())
            }
        }
    }
}

impl From<Diagnostic> for BasilError {
    fn from(d: Diagnostic) -> Self {
        BasilError::Script(d)
    }
}

/// Which family a script failure belongs to. Parse errors stop compilation;
/// the remaining classes propagate during evaluation unless caught by `try`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticClass {
    Parse,
    Type,
    Value,
    Runtime,
    Io,
}

impl DiagnosticClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticClass::Parse => "parse",
            DiagnosticClass::Type => "type",
            DiagnosticClass::Value => "value",
            DiagnosticClass::Runtime => "runtime",
            DiagnosticClass::Io => "io",
        }
    }
}

impl fmt::Display for DiagnosticClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured script failure. Every operation in the runtime that can fail
/// on behalf of a script produces one of these, with enough location data for
/// the development error page to render a source excerpt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub class: DiagnosticClass,
    pub code: String,
    pub message: String,
    pub line: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<Diagnostic>>,
}

impl Diagnostic {
    pub fn new(
        class: DiagnosticClass,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Diagnostic {
        Diagnostic {
            class,
            code: code.into(),
            message: message.into(),
            line: 0,
            column: 0,
            hints: Vec::new(),
            cause: None,
        }
    }

    pub fn parse(code: impl Into<String>, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(DiagnosticClass::Parse, code, message)
    }

    pub fn type_error(code: impl Into<String>, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(DiagnosticClass::Type, code, message)
    }

    pub fn value_error(code: impl Into<String>, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(DiagnosticClass::Value, code, message)
    }

    pub fn runtime(code: impl Into<String>, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(DiagnosticClass::Runtime, code, message)
    }

    pub fn io(code: impl Into<String>, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(DiagnosticClass::Io, code, message)
    }

    pub fn at(mut self, line: u32, column: u32) -> Diagnostic {
        self.line = line;
        self.column = column;
        self
    }

    /// Fill in a location only if the diagnostic does not already carry one.
    /// Deeply nested evaluation attaches the innermost location first.
    pub fn or_at(mut self, line: u32, column: u32) -> Diagnostic {
        if self.line == 0 {
            self.line = line;
            self.column = column;
        }
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Diagnostic {
        self.hints.push(hint.into());
        self
    }

    pub fn with_cause(mut self, cause: Diagnostic) -> Diagnostic {
        self.cause = Some(Box::new(cause));
        self
    }

    /// The message trimmed to its first line. Cascade noise from collaborator
    /// crates tends to arrive as multi-line blobs.
    pub fn first_line(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} error [{}] at {}:{}: {}",
            self.class, self.code, self.line, self.column, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_builders_set_class_and_location() {
        let d = Diagnostic::parse("P0001", "unexpected token").at(3, 14);
        assert_eq!(d.class, DiagnosticClass::Parse);
        assert_eq!((d.line, d.column), (3, 14));
    }

    #[test]
    fn or_at_keeps_existing_location() {
        let d = Diagnostic::value_error("V0001", "bad").at(2, 5).or_at(9, 9);
        assert_eq!((d.line, d.column), (2, 5));
    }

    #[test]
    fn first_line_trims_cascades() {
        let d = Diagnostic::runtime("R0001", "top\nnoise\nmore");
        assert_eq!(d.first_line(), "top");
    }

    #[test]
    fn status_codes_map_not_found() {
        assert_eq!(
            BasilError::PageNotFound.status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
