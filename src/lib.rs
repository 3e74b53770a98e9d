//! # basil
//!
//! A self-contained HTTP application server for the Parsley scripting
//! language.
//!
//! A request arriving at the server is matched to either a static asset or
//! a handler script; the script is compiled once to an AST, cached, and
//! executed against a per-request environment that exposes HTTP, session,
//! database, search, and file-system capabilities. In development mode a
//! filesystem watcher invalidates caches on edits and drives an in-browser
//! live reload, and failures render as a styled diagnostic page with a
//! highlighted source excerpt.
//!
//! ## Architecture
//!
//! The crate is organised around the scripted request runtime:
//!
//! - **[`source`]**: source unit loading with canonical identity
//! - **[`lexer`]**: the modal, restartable token stream
//! - **[`parser`]**: Pratt parsing into the cached AST
//! - **[`cache`]**: the per-path AST cache with single-flight misses and
//!   dependency-aware invalidation
//! - **[`env`]**: lexically scoped environment frames with per-request
//!   roots
//! - **[`eval`]**: the cooperative tree-walking evaluator, including the
//!   reader/writer operators and the query DSL
//! - **[`router`]**: route-table and filesystem (`index.pars`) resolution
//! - **[`pipeline`]** / **[`server`]**: the HTTP entry point
//! - **[`watch`]**: debounced filesystem invalidation + live reload
//! - **[`diagnostics`]**: the development error page
//! - **[`capability`]**: the narrow interfaces the evaluator reaches the
//!   outside world through
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use basil::{config::Config, server::Server};
//!
//! # async fn run() -> Result<(), basil::BasilError> {
//! let config = Config::load(std::path::Path::new("basil.yaml"))?;
//! let server = Server::from_config(config, ".".into(), true).await?;
//! server.serve(async { /* shutdown signal */ }).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod capability;
pub mod config;
pub mod diagnostics;
pub mod env;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod money;
pub mod parser;
pub mod pipeline;
pub mod router;
pub mod server;
pub mod source;
pub mod value;
pub mod watch;

pub use error::{BasilError, Diagnostic, DiagnosticClass};
