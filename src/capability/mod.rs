//! Capability adapters.
//!
//! The evaluator never imports a concrete database driver, HTTP client, or
//! filesystem API; it calls these narrow interfaces. Capabilities are
//! constructed at server start, bundled into [`Capabilities`], and are
//! immutable thereafter.

pub mod clock;
pub mod db;
pub mod fs;
pub mod http;
pub mod search;
pub mod session;
pub mod shell;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Diagnostic;
use crate::value::Value;

pub use db::{CondIr, DbExecutor, OperandIr, QueryBlockIr, StatementIr};

/// Reads the entire contents of a named source. Errors map to the `io`
/// class.
#[async_trait]
pub trait ReadableSource: Send + Sync {
    async fn read_all(&self, path: &str) -> Result<Vec<u8>, Diagnostic>;
}

/// Writes bytes to a named sink, truncating or appending. Errors map to
/// the `io` class.
#[async_trait]
pub trait WritableSink: Send + Sync {
    async fn write(&self, path: &str, bytes: &[u8], append: bool) -> Result<(), Diagnostic>;
}

/// Both halves of the file capability.
pub trait FileStore: ReadableSource + WritableSink {}
impl<T: ReadableSource + WritableSink> FileStore for T {}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

/// Outbound HTTP. Errors map to `io` with the status preserved in the
/// diagnostic when one was received.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn get(
        &self,
        url: &url::Url,
        headers: &[(String, String)],
    ) -> Result<FetchResponse, Diagnostic>;
}

/// Full-text search, consumed only through this interface. Errors map to
/// the `runtime` class.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn add(&self, id: &str, doc: Value) -> Result<(), Diagnostic>;
    async fn update(&self, id: &str, doc: Value) -> Result<(), Diagnostic>;
    async fn remove(&self, id: &str) -> Result<(), Diagnostic>;
    async fn query(&self, text: &str, limit: usize) -> Result<Vec<Value>, Diagnostic>;
    async fn reindex(&self) -> Result<(), Diagnostic>;
    async fn stats(&self) -> Result<Value, Diagnostic>;
}

/// Session persistence. The store is responsible for its own concurrency;
/// callers invoke it atomically per operation. Errors map to `runtime`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<serde_json::Value>, Diagnostic>;
    async fn save(
        &self,
        id: &str,
        data: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), Diagnostic>;
    async fn delete(&self, id: &str) -> Result<(), Diagnostic>;
}

#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

/// Subprocess execution for the `<=#=>` operator. Errors map to `io`.
#[async_trait]
pub trait ShellExec: Send + Sync {
    async fn run(&self, cmd: &str, stdin: &[u8]) -> Result<ShellOutput, Diagnostic>;
}

/// Time. Never fails.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
    fn monotonic(&self) -> std::time::Instant;
}

/// The full capability set handed to the evaluator. Set once at server
/// start.
#[derive(Clone)]
pub struct Capabilities {
    pub fs: Arc<dyn FileStore>,
    pub http: Arc<dyn HttpFetcher>,
    pub db: Arc<dyn DbExecutor>,
    pub search: Arc<dyn SearchIndex>,
    pub sessions: Arc<dyn SessionStore>,
    pub shell: Arc<dyn ShellExec>,
    pub clock: Arc<dyn Clock>,
}
