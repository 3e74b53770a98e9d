//! Server assembly.
//!
//! Builds the capability set from configuration, wires the axum
//! application (static routes first, the live-reload SSE endpoint in
//! development mode, then the script pipeline as the fallback), and serves
//! with graceful shutdown. The watcher runs only in development mode.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::Uri,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router as AxumRouter,
};
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tower_http::{
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

use crate::cache::ScriptCache;
use crate::capability::{
    clock::SystemClock, db::SqliteDb, fs::BaseDirFs, http::ReqwestFetcher,
    search::MemorySearchIndex, session::{MemorySessionStore, SqliteSessionStore},
    shell::HostShell, Capabilities,
};
use crate::config::{Config, SessionStoreKind};
use crate::error::BasilError;
use crate::eval::ModuleRegistry;
use crate::pipeline::{self, AppState, RequestInput};
use crate::router::Router;
use crate::source::SourceReader;
use crate::watch::{ReloadEvent, WatchService};

/// A fully assembled server, ready to serve.
pub struct Server {
    pub state: Arc<AppState>,
    addr: SocketAddr,
    /// Held for its side effect: dropping it stops the watcher.
    _watch: Option<WatchService>,
}

impl Server {
    /// Build everything from configuration. `base_dir` anchors the site,
    /// scripts, and confined file access.
    pub async fn from_config(
        config: Config,
        base_dir: PathBuf,
        dev_mode: bool,
    ) -> Result<Server, BasilError> {
        let base_dir = base_dir
            .canonicalize()
            .map_err(|e| BasilError::Config(format!("base directory: {e}")))?;

        let db = match &config.sqlite {
            Some(location) => {
                let resolved = if location == ":memory:" {
                    location.clone()
                } else {
                    base_dir.join(location).to_string_lossy().into_owned()
                };
                Arc::new(SqliteDb::connect(&resolved).await?)
            }
            None => Arc::new(SqliteDb::connect(":memory:").await?),
        };

        let sessions: Arc<dyn crate::capability::SessionStore> = match config.session.store {
            SessionStoreKind::Cookie => Arc::new(MemorySessionStore::new()),
            SessionStoreKind::Sqlite => {
                let store = Arc::new(
                    SqliteSessionStore::new(db.pool().clone(), &config.session.table)
                        .await?,
                );
                if config.session.cleanup {
                    let cleaner = store.clone();
                    tokio::spawn(async move {
                        let mut ticker =
                            tokio::time::interval(Duration::from_secs(15 * 60));
                        loop {
                            ticker.tick().await;
                            match cleaner.cleanup().await {
                                Ok(0) => {}
                                Ok(n) => {
                                    tracing::debug!("session cleanup removed {n} row(s)");
                                }
                                Err(e) => tracing::warn!("session cleanup failed: {e}"),
                            }
                        }
                    });
                }
                store
            }
        };

        let caps = Capabilities {
            fs: Arc::new(BaseDirFs::new(base_dir.clone())),
            http: Arc::new(ReqwestFetcher::new(Duration::from_secs(15))?),
            db,
            search: Arc::new(MemorySearchIndex::new()),
            sessions,
            shell: Arc::new(HostShell),
            clock: Arc::new(SystemClock),
        };

        let router = match &config.site {
            Some(site) => Router::site(base_dir.join(site))?,
            None => Router::table(config.table_routes(&base_dir)?)?,
        };

        let cache = Arc::new(ScriptCache::new(
            SourceReader::new(base_dir.clone()),
            dev_mode,
        ));
        let modules = Arc::new(ModuleRegistry::new());
        let (reload_tx, _) = broadcast::channel(64);

        let watch = if dev_mode {
            Some(WatchService::start(
                &base_dir,
                cache.clone(),
                modules.clone(),
                reload_tx.clone(),
            )?)
        } else {
            None
        };

        let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .map_err(|e| BasilError::Config(format!("server address: {e}")))?;

        let state = Arc::new(AppState::new(
            config,
            base_dir,
            dev_mode,
            cache,
            modules,
            caps,
            router,
            reload_tx,
        ));

        Ok(Server {
            state,
            addr,
            _watch: watch,
        })
    }

    /// The axum application: static entries, the dev live-reload stream,
    /// and the script pipeline fallback.
    pub fn app(&self) -> AxumRouter {
        let mut app = AxumRouter::new();

        for entry in &self.state.config.static_entries {
            if let Some(root) = &entry.root {
                let dir = self.state.base_dir.join(root);
                app = app.nest_service(&entry.path, ServeDir::new(dir));
            } else if let Some(file) = &entry.file {
                let file_path = self.state.base_dir.join(file);
                app = app.route_service(&entry.path, ServeFile::new(file_path));
            }
        }

        if let Some(public_dir) = &self.state.config.public_dir {
            let dir = self.state.base_dir.join(public_dir);
            app = app.nest_service("/public", ServeDir::new(dir));
        }

        if self.state.dev_mode {
            app = app.route("/__basil/reload", get(reload_stream));
        }

        app.fallback(script_fallback)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until the shutdown future resolves. Live-reload subscribers
    /// are told to close before the listener drains.
    pub async fn serve(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), BasilError> {
        let app = self.app();
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| BasilError::Config(format!("bind {}: {e}", self.addr)))?;
        let actual = listener.local_addr().map_err(BasilError::from)?;
        tracing::info!(
            "basil serving on http://{actual} ({} mode)",
            if self.state.dev_mode { "development" } else { "production" }
        );

        let reload_tx = self.state.reload_tx.clone();
        let wrapped_shutdown = async move {
            shutdown.await;
            let _ = reload_tx.send(ReloadEvent::Shutdown);
            tokio::time::sleep(Duration::from_millis(50)).await;
        };

        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(wrapped_shutdown)
            .await
            .map_err(|e| BasilError::Service(format!("server error: {e}")))?;
        tracing::info!("basil shut down");
        Ok(())
    }
}

/// SSE endpoint for development live reload. Streams are best-effort: a
/// lagged subscriber just gets a reload.
async fn reload_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.reload_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(ReloadEvent::Changed { .. }) => {
            Some(Ok(Event::default().event("reload").data("reload")))
        }
        Ok(ReloadEvent::Shutdown) => {
            Some(Ok(Event::default().event("close").data("server shutting down")))
        }
        Err(_) => Some(Ok(Event::default().event("reload").data("reload"))),
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Fallback handler: everything that is not a static asset goes through
/// the scripted request pipeline.
async fn script_fallback(
    State(state): State<Arc<AppState>>,
    method: axum::http::Method,
    uri: Uri,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let session_cookie = headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| extract_cookie(cookies, &state.config.session.cookie_name));

    let had_session = session_cookie.is_some();
    let session_id = session_cookie
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let input = RequestInput {
        method,
        path: uri.path().to_string(),
        query: uri.query().unwrap_or("").to_string(),
        headers,
        body,
        session_id: Some(session_id.clone()),
    };
    let mut response = pipeline::handle_request(state.clone(), input).await;

    if !had_session {
        let config = &state.config.session;
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}; SameSite={:?}",
            config.cookie_name, session_id, config.max_age, config.same_site
        );
        if config.http_only {
            cookie.push_str("; HttpOnly");
        }
        if config.secure.unwrap_or(false) {
            cookie.push_str("; Secure");
        }
        if let Ok(value) = axum::http::HeaderValue::from_str(&cookie) {
            response
                .headers_mut()
                .insert(axum::http::header::SET_COOKIE, value);
        }
    }
    response
}

fn extract_cookie(cookie_header: &str, name: &str) -> Option<String> {
    cookie_header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        if key == name {
            Some(value.to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_extraction() {
        assert_eq!(
            extract_cookie("a=1; basil_session=abc; b=2", "basil_session"),
            Some("abc".to_string())
        );
        assert_eq!(extract_cookie("a=1", "basil_session"), None);
    }
}
