//! The request pipeline: route → load → execute → render.
//!
//! Each request gets its own evaluator and request frame. Handler parsing
//! is single-flight through the AST cache, but handler execution is not:
//! concurrent requests to the same handler run independently. Failures in
//! development mode render through the diagnostic page; production gets a
//! minimal 500.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use crate::cache::{ScriptCache, TtlCache};
use crate::capability::Capabilities;
use crate::config::Config;
use crate::diagnostics;
use crate::env::{EnvRef, Frame, RequestRoots};
use crate::error::{BasilError, Diagnostic};
use crate::eval::{CancelToken, Evaluator, Interrupt, ModuleRegistry};
use crate::parser::ast::Program;
use crate::router::{AuthPolicy, RouteKind, RouteMatch, Router};
use crate::value::{OrderedMap, Value};
use crate::watch::ReloadEvent;

/// A cached, already-rendered response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

/// Per-handler module frame, pinned to the program it was built for so a
/// reparse rebuilds module state.
struct HandlerScope {
    program: Arc<Program>,
    frame: EnvRef,
}

pub struct AppState {
    pub config: Config,
    pub base_dir: PathBuf,
    pub dev_mode: bool,
    pub cache: Arc<ScriptCache>,
    pub modules: Arc<ModuleRegistry>,
    pub caps: Capabilities,
    pub router: Router,
    pub response_cache: TtlCache<CachedResponse>,
    pub fragments: Arc<TtlCache<String>>,
    pub reload_tx: broadcast::Sender<ReloadEvent>,
    pub request_timeout: Duration,
    handler_scopes: RwLock<HashMap<PathBuf, HandlerScope>>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        base_dir: PathBuf,
        dev_mode: bool,
        cache: Arc<ScriptCache>,
        modules: Arc<ModuleRegistry>,
        caps: Capabilities,
        router: Router,
        reload_tx: broadcast::Sender<ReloadEvent>,
    ) -> AppState {
        AppState {
            config,
            base_dir,
            dev_mode,
            cache,
            modules,
            caps,
            router,
            response_cache: TtlCache::new(1024),
            fragments: Arc::new(TtlCache::new(4096)),
            reload_tx,
            request_timeout: Duration::from_secs(30),
            handler_scopes: RwLock::new(HashMap::new()),
        }
    }

    /// The stable module frame for a handler, rebuilt when its program is
    /// reparsed.
    fn handler_frame(&self, path: &PathBuf, program: &Arc<Program>) -> EnvRef {
        {
            let scopes = self.handler_scopes.read();
            if let Some(scope) = scopes.get(path) {
                if Arc::ptr_eq(&scope.program, program) {
                    return scope.frame.clone();
                }
            }
        }
        let frame = Frame::module();
        self.handler_scopes.write().insert(
            path.clone(),
            HandlerScope {
                program: program.clone(),
                frame: frame.clone(),
            },
        );
        frame
    }
}

/// Everything the pipeline needs from the HTTP layer.
pub struct RequestInput {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub session_id: Option<String>,
}

/// Serve one request end to end.
pub async fn handle_request(state: Arc<AppState>, input: RequestInput) -> Response {
    let path = normalise_path(&input.path);

    let Some(route) = state.router.resolve(&path) else {
        return not_found(&state, &path);
    };

    // Auth gate. The session carries the authenticated principal under
    // `user`; policy enforcement beyond that is an external concern.
    let session_id = input
        .session_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let session_data = state
        .caps
        .sessions
        .load(&session_id)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| serde_json::json!({}));

    if route.auth == AuthPolicy::Required && session_data.get("user").is_none() {
        return match route.kind {
            RouteKind::Api => (
                StatusCode::UNAUTHORIZED,
                [(header::CONTENT_TYPE, "application/json")],
                r#"{"error":"unauthorized"}"#,
            )
                .into_response(),
            RouteKind::Page => (
                StatusCode::SEE_OTHER,
                [(header::LOCATION, "/login")],
                "",
            )
                .into_response(),
        };
    }

    // Per-route response cache.
    let cache_key = response_cache_key(input.method.as_str(), &path, &input.query);
    if route.cache_ttl > 0 && input.method == Method::GET {
        if let Some(cached) = state.response_cache.get(&cache_key) {
            return cached_response(&cached);
        }
    }

    match run_handler(&state, &input, &route, &path, &session_id, session_data).await {
        Ok(response) => {
            if route.cache_ttl > 0
                && input.method == Method::GET
                && response.status == 200
            {
                state.response_cache.put(
                    &cache_key,
                    response.clone(),
                    Duration::from_secs(route.cache_ttl),
                );
            }
            cached_response(&response)
        }
        Err(failure) => render_failure(&state, failure, &route),
    }
}

enum Failure {
    Script {
        diagnostic: Diagnostic,
        handler_path: PathBuf,
    },
    Cancelled,
    Host(BasilError),
}

async fn run_handler(
    state: &Arc<AppState>,
    input: &RequestInput,
    route: &RouteMatch,
    path: &str,
    session_id: &str,
    session_data: serde_json::Value,
) -> Result<CachedResponse, Failure> {
    let entry = state
        .cache
        .get_or_parse(&route.handler_path)
        .await
        .map_err(|e| match e {
            BasilError::Script(diagnostic) => Failure::Script {
                diagnostic,
                handler_path: route.handler_path.clone(),
            },
            other => Failure::Host(other),
        })?;

    // Request frame over the handler's stable module frame.
    let module_frame = state.handler_frame(&route.handler_path, &entry.program);
    let params = parse_params(input);
    let session_value = Value::from_json_value(&session_data);
    let response_builder = Value::dict(OrderedMap::new());
    let http_root = build_http_root(input, path, &params, &response_builder);
    let roots = RequestRoots {
        http: http_root,
        session: session_value.clone(),
        basil: build_basil_root(state),
        env: build_env_root(),
        args: Value::array(route.tail.iter().map(Value::str).collect()),
        params,
    };
    let request_frame = Frame::request(&module_frame, roots);

    let cancel = CancelToken::new();
    let evaluator = Evaluator::new(
        state.caps.clone(),
        state.cache.clone(),
        state.modules.clone(),
        state.fragments.clone(),
        cancel.clone(),
    );
    evaluator.set_entry_source(&route.handler_path);

    // Wall-clock timeout: flip the cancellation flag, then give the
    // evaluator one quantum to observe it.
    let result = {
        let run = evaluator.eval_program(&entry.program, &request_frame);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            _ = tokio::time::sleep(state.request_timeout) => {
                cancel.cancel();
                match tokio::time::timeout(Duration::from_millis(100), &mut run).await {
                    Ok(result) => result,
                    Err(_) => Err(Interrupt::Cancelled),
                }
            }
        }
    };

    let value = match result {
        Ok(v) => v,
        Err(Interrupt::Return(v)) => v,
        Err(Interrupt::Diag(diagnostic)) => {
            return Err(Failure::Script {
                diagnostic,
                handler_path: route.handler_path.clone(),
            });
        }
        Err(Interrupt::Cancelled) => return Err(Failure::Cancelled),
        Err(Interrupt::Skip) | Err(Interrupt::Stop) => {
            return Err(Failure::Script {
                diagnostic: Diagnostic::runtime(
                    "R-LOOP-SIGNAL",
                    "skip and stop are only meaningful inside a for loop",
                ),
                handler_path: route.handler_path.clone(),
            });
        }
    };

    // Persist the session if the script changed it.
    if let Ok(after) = session_value.to_json_value() {
        if after != session_data || !after.as_object().map(|o| o.is_empty()).unwrap_or(true)
        {
            let ttl = Duration::from_secs(state.config.session.max_age);
            let _ = state.caps.sessions.save(session_id, &after, ttl).await;
        }
    }

    coerce_response(value, route.kind, &response_builder)
        .map_err(|diagnostic| Failure::Script {
            diagnostic,
            handler_path: route.handler_path.clone(),
        })
}

/// Map the handler's result value onto an HTTP response.
fn coerce_response(
    value: Value,
    kind: RouteKind,
    response_builder: &Value,
) -> Result<CachedResponse, Diagnostic> {
    // Script-set status/headers through `http.response`.
    let (status_override, content_type_override) = match response_builder {
        Value::Dict(map) => {
            let map = map.read();
            let status = map.get("status").and_then(|v| match v {
                Value::Int(n) => Some(*n as u16),
                _ => None,
            });
            let content_type = map
                .get("headers")
                .and_then(|headers| match headers {
                    Value::Dict(h) => h
                        .read()
                        .get("Content-Type")
                        .map(|v| v.to_display_string()),
                    _ => None,
                });
            (status, content_type)
        }
        _ => (None, None),
    };

    let (status, content_type, body) = match (&value, kind) {
        (Value::Str(s), RouteKind::Page) => {
            (200, "text/html; charset=utf-8".to_string(), s.to_string())
        }
        (Value::Array(items), RouteKind::Page)
            if items.read().iter().all(|v| matches!(v, Value::Str(_))) =>
        {
            let joined: String = items
                .read()
                .iter()
                .map(|v| v.to_display_string())
                .collect();
            (200, "text/html; charset=utf-8".to_string(), joined)
        }
        (Value::Dict(map), _) if map.read().contains_key("body") => {
            let map = map.read();
            let status = match map.get("status") {
                Some(Value::Int(n)) => *n as u16,
                _ => 200,
            };
            let body_value = map.get("body").cloned().unwrap_or(Value::Null);
            let content_type = map
                .get("headers")
                .and_then(|headers| match headers {
                    Value::Dict(h) => h
                        .read()
                        .get("Content-Type")
                        .map(|v| v.to_display_string()),
                    _ => None,
                })
                .unwrap_or_else(|| match &body_value {
                    Value::Str(_) => "text/html; charset=utf-8".to_string(),
                    _ => "application/json".to_string(),
                });
            let body = match &body_value {
                Value::Str(s) => s.to_string(),
                other => other.to_json_value()?.to_string(),
            };
            (status, content_type, body)
        }
        (other, _) => {
            let json = other.to_json_value()?;
            (200, "application/json".to_string(), json.to_string())
        }
    };

    Ok(CachedResponse {
        status: status_override.unwrap_or(status),
        content_type: content_type_override.unwrap_or(content_type),
        body: Bytes::from(body),
    })
}

fn render_failure(state: &Arc<AppState>, failure: Failure, route: &RouteMatch) -> Response {
    match failure {
        Failure::Cancelled => (
            StatusCode::REQUEST_TIMEOUT,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "request cancelled",
        )
            .into_response(),
        Failure::Host(error) => {
            tracing::error!("handler {:?} host failure: {error}", route.handler_path);
            if state.dev_mode {
                let diagnostic = Diagnostic::runtime("R-HOST", format!("{error}"));
                script_error_response(state, &diagnostic, &route.handler_path)
            } else {
                minimal_500()
            }
        }
        Failure::Script {
            diagnostic,
            handler_path,
        } => {
            tracing::warn!(
                "handler {handler_path:?} failed: {} [{}] at {}:{}",
                diagnostic.first_line(),
                diagnostic.code,
                diagnostic.line,
                diagnostic.column
            );
            if state.dev_mode {
                script_error_response(state, &diagnostic, &handler_path)
            } else {
                minimal_500()
            }
        }
    }
}

fn script_error_response(
    state: &Arc<AppState>,
    diagnostic: &Diagnostic,
    handler_path: &PathBuf,
) -> Response {
    let source_text = std::fs::read_to_string(handler_path).ok();
    match diagnostics::render_error_page(
        diagnostic,
        handler_path,
        &state.base_dir,
        source_text.as_deref(),
    ) {
        Ok(html) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            html,
        )
            .into_response(),
        // Second-order failure: the error page itself faulted. Report
        // both failures side by side as plain text.
        Err(render_failure) => {
            tracing::error!("error page failed to render: {render_failure}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                diagnostics::render_double_fault(diagnostic, &render_failure.to_string()),
            )
                .into_response()
        }
    }
}

fn minimal_500() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        diagnostics::render_minimal_500(),
    )
        .into_response()
}

fn not_found(state: &Arc<AppState>, path: &str) -> Response {
    if state.dev_mode {
        let candidates = state.router.candidates(path);
        let html = diagnostics::render_404_page(path, &candidates, &state.base_dir);
        (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            html,
        )
            .into_response()
    } else {
        (StatusCode::NOT_FOUND, "not found").into_response()
    }
}

fn cached_response(cached: &CachedResponse) -> Response {
    let mut response = Response::new(axum::body::Body::from(cached.body.clone()));
    *response.status_mut() =
        StatusCode::from_u16(cached.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if let Ok(value) = HeaderValue::from_str(&cached.content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}

fn normalise_path(path: &str) -> String {
    let mut normalised = String::with_capacity(path.len());
    let mut last_was_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !last_was_slash {
                normalised.push('/');
            }
            last_was_slash = true;
        } else {
            normalised.push(c);
            last_was_slash = false;
        }
    }
    if normalised.is_empty() {
        normalised.push('/');
    }
    normalised
}

/// `SHA-256(method || 0x00 || path || 0x00 || canonicalised_query)`; the
/// query canonicalisation sorts pairs by name then value.
pub fn response_cache_key(method: &str, path: &str, query: &str) -> String {
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect();
    pairs.sort();
    let canonical_query = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update([0x00]);
    hasher.update(path.as_bytes());
    hasher.update([0x00]);
    hasher.update(canonical_query.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn parse_params(input: &RequestInput) -> Value {
    let mut params = OrderedMap::new();

    // Query parameters.
    for (key, value) in url::form_urlencoded::parse(input.query.as_bytes()) {
        params.insert(key.into_owned(), Value::str(value));
    }

    let content_type = input
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    // Form body.
    if content_type.starts_with("application/x-www-form-urlencoded") {
        for (key, value) in url::form_urlencoded::parse(&input.body) {
            params.insert(key.into_owned(), Value::str(value));
        }
    }

    // Top-level JSON object keys.
    if content_type.starts_with("application/json") {
        if let Ok(serde_json::Value::Object(object)) =
            serde_json::from_slice::<serde_json::Value>(&input.body)
        {
            for (key, value) in object {
                params.insert(key, Value::from_json_value(&value));
            }
        }
    }

    Value::dict(params)
}

fn build_http_root(
    input: &RequestInput,
    path: &str,
    params: &Value,
    response_builder: &Value,
) -> Value {
    let mut headers = OrderedMap::new();
    for (name, value) in input.headers.iter() {
        if let Ok(text) = value.to_str() {
            headers.insert(name.as_str().to_string(), Value::str(text));
        }
    }
    let mut request = OrderedMap::new();
    request.insert("method", Value::str(input.method.as_str()));
    request.insert("path", Value::str(path));
    request.insert("query", Value::str(&input.query));
    request.insert("headers", Value::dict(headers));
    request.insert("params", params.clone());

    let mut http = OrderedMap::new();
    http.insert("request", Value::dict(request));
    http.insert("response", response_builder.clone());
    Value::dict(http)
}

fn build_basil_root(state: &Arc<AppState>) -> Value {
    let mut basil = OrderedMap::new();
    basil.insert("version", Value::str(env!("CARGO_PKG_VERSION")));
    basil.insert(
        "mode",
        Value::str(if state.dev_mode { "development" } else { "production" }),
    );
    Value::dict(basil)
}

fn build_env_root() -> Value {
    let mut env = OrderedMap::new();
    for (key, value) in std::env::vars() {
        env.insert(key, Value::str(value));
    }
    Value::dict(env)
}
