//! End-to-end pipeline tests.
//!
//! These drive the assembled axum application directly (no sockets):
//! filesystem routing with tail segments, database-backed handlers,
//! the development error page contract, the 404 page, concurrent
//! single-flight parsing, response caching, and the auth gate.

use std::path::Path;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;

use basil::config::Config;
use basil::server::Server;

struct Site {
    dir: tempfile::TempDir,
}

impl Site {
    fn new() -> Site {
        Site {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn write(&self, relative: &str, content: &str) -> &Site {
        let path = self.dir.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
        self
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    async fn server(&self, config_yaml: &str, dev: bool) -> Server {
        let config = Config::from_str(config_yaml).unwrap();
        Server::from_config(config, self.path().to_path_buf(), dev)
            .await
            .unwrap()
    }
}

async fn get(app: &axum::Router, uri: &str) -> (StatusCode, String, axum::http::HeaderMap) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), 1_000_000)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&body).into_owned(), headers)
}

#[tokio::test]
async fn filesystem_routing_invokes_nearest_index_with_tail() {
    let site = Site::new();
    site.write(
        "site/reports/index.pars",
        r#"let segments = for s in @args { <li>{s}</li> }
"<!doctype html>" ++ <ul>{segments}</ul>"#,
    );
    let server = site.server("site: site\n", false).await;
    let app = server.app();

    let (status, body, headers) = get(&app, "/reports/2025/Q4/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("<!doctype html>"), "body: {body}");
    assert!(body.contains("<li>2025</li><li>Q4</li>"));
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/html"));
}

#[tokio::test]
async fn db_handler_returns_json_rows() {
    let site = Site::new();
    site.write(
        "site/users/index.pars",
        r#"n <=!=> "CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT, active BOOLEAN)"
c <=!=> "DELETE FROM users"
a <=!=> "INSERT INTO users (id, name, active) VALUES (1, 'A', 1), (2, 'B', 1), (3, 'C', 1), (4, 'D', 0)"
users <=??=> "SELECT id, name FROM users WHERE active = ?" [true]
users"#,
    );
    let server = site
        .server("site: site\nsqlite: \":memory:\"\n", false)
        .await;
    let app = server.app();

    let (status, body, headers) = get(&app, "/users/").await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(
        json,
        serde_json::json!([
            {"id": 1, "name": "A"},
            {"id": 2, "name": "B"},
            {"id": 3, "name": "C"}
        ])
    );
}

#[tokio::test]
async fn parse_errors_render_the_dev_diagnostic_page() {
    let site = Site::new();
    site.write("site/broken/index.pars", "let x == 5");
    let server = site.server("site: site\n", true).await;
    let app = server.app();

    let (status, body, headers) = get(&app, "/broken/").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        headers[header::CONTENT_TYPE],
        "text/html; charset=utf-8"
    );
    // Path relative to the base dir, the location, and an excerpt.
    assert!(body.contains("site/broken/index.pars"), "body: {body}");
    assert!(body.contains(":1:7"));
    assert!(body.contains("line error"));
    assert!(!body.contains(site.path().to_str().unwrap()));
}

#[tokio::test]
async fn production_mode_hides_diagnostics() {
    let site = Site::new();
    site.write("site/broken/index.pars", "let x == 5");
    let server = site.server("site: site\n", false).await;
    let app = server.app();

    let (status, body, _) = get(&app, "/broken/").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body.contains("index.pars"));
    assert!(body.contains("500"));
}

#[tokio::test]
async fn dev_404_lists_checked_candidates() {
    let site = Site::new();
    site.write("site/index.pars", "\"home\"");
    let server = site.server("site: site\n", true).await;
    let app = server.app();

    let (status, body, _) = get(&app, "/missing/page").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("/missing/page"));
    assert!(body.contains("index.pars"));
    assert!(body.to_lowercase().contains("hint"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_parse_the_handler_once() {
    let site = Site::new();
    site.write("site/h/index.pars", r#""<!doctype html>expected body""#);
    let server = site.server("site: site\n", false).await;
    let state = server.state.clone();
    let app = server.app();

    let mut joins = Vec::new();
    for _ in 0..50 {
        let app = app.clone();
        joins.push(tokio::spawn(async move {
            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/h/")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            let status = response.status();
            let body = axum::body::to_bytes(response.into_body(), 1_000_000)
                .await
                .unwrap();
            (status, String::from_utf8_lossy(&body).into_owned())
        }));
    }
    for join in joins {
        let (status, body) = join.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("expected body"));
    }
    assert_eq!(
        state.cache.stats().total_parses,
        1,
        "the parser must be entered exactly once"
    );
}

#[tokio::test]
async fn route_table_with_cache_ttl_serves_cached_responses() {
    let site = Site::new();
    site.write(
        "counter.pars",
        r#"n <=!=> "CREATE TABLE IF NOT EXISTS hits (x INTEGER)"
a <=!=> "INSERT INTO hits (x) VALUES (1)"
rows <=??=> "SELECT COUNT(*) AS hits FROM hits"
rows"#,
    );
    let config = r#"
sqlite: ":memory:"
routes:
  - path: /counter
    handler: counter.pars
    cache: 60
    type: api
"#;
    let server = site.server(config, false).await;
    let app = server.app();

    let (_, first, _) = get(&app, "/counter").await;
    let (_, second, _) = get(&app, "/counter").await;
    // The second hit is served from the response cache: the handler (and
    // its INSERT) never ran again.
    assert_eq!(first, second);
    let (_, varied, _) = get(&app, "/counter?fresh=1").await;
    assert_ne!(first, varied, "different query keys bypass the cache");
}

#[tokio::test]
async fn auth_required_pages_redirect_and_apis_get_401() {
    let site = Site::new();
    site.write("secret.pars", "\"secret\"");
    let config = r#"
routes:
  - path: /page
    handler: secret.pars
    auth: required
  - path: /api
    handler: secret.pars
    auth: required
    type: api
"#;
    let server = site.server(config, false).await;
    let app = server.app();

    let (status, _, headers) = get(&app, "/page").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers[header::LOCATION], "/login");

    let (status, body, _) = get(&app, "/api").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("unauthorized"));
}

#[tokio::test]
async fn static_entries_bypass_the_evaluator() {
    let site = Site::new();
    site.write("public/app.css", "body { color: green }");
    site.write("site/index.pars", "\"home\"");
    let config = r#"
site: site
static:
  - path: /assets
    root: public
"#;
    let server = site.server(config, false).await;
    let app = server.app();

    let (status, body, _) = get(&app, "/assets/app.css").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("color: green"));
}

#[tokio::test]
async fn handler_module_state_persists_imports_across_requests() {
    let site = Site::new();
    site.write("site/lib_counter.pars", "export let banner = \"shared\"");
    site.write(
        "site/index.pars",
        "let m = import @./lib_counter\nm.banner",
    );
    let server = site.server("site: site\n", false).await;
    let state = server.state.clone();
    let app = server.app();

    let (_, first, _) = get(&app, "/").await;
    let (_, second, _) = get(&app, "/").await;
    assert_eq!(first, "shared");
    assert_eq!(second, "shared");
    // index.pars parsed once, lib_counter.pars parsed once.
    assert_eq!(state.cache.stats().total_parses, 2);
    assert_eq!(state.modules.len(), 1);
}

#[tokio::test]
async fn sessions_round_trip_through_the_store() {
    let site = Site::new();
    site.write(
        "site/visit/index.pars",
        r#"let count = (session.visits ?? 0) + 1
session.visits = count
str(count)"#,
    );
    let server = site.server("site: site\n", false).await;
    let app = server.app();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/visit/")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let cookie = response.headers()[header::SET_COOKIE]
        .to_str()
        .unwrap()
        .to_string();
    let body = axum::body::to_bytes(response.into_body(), 1_000_000)
        .await
        .unwrap();
    assert_eq!(&body[..], b"1");

    let session_pair = cookie.split(';').next().unwrap().to_string();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/visit/")
                .header(header::COOKIE, &session_pair)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), 1_000_000)
        .await
        .unwrap();
    assert_eq!(&body[..], b"2", "the session persisted the counter");
}

#[tokio::test]
async fn query_params_reach_handlers() {
    let site = Site::new();
    site.write("site/echo/index.pars", "@params.name ?? \"anonymous\"");
    let server = site.server("site: site\n", false).await;
    let app = server.app();

    let (_, body, _) = get(&app, "/echo/?name=ada").await;
    assert_eq!(body, "ada");
    let (_, body, _) = get(&app, "/echo/").await;
    assert_eq!(body, "anonymous");
}

#[tokio::test]
async fn structured_response_dicts_control_status_and_headers() {
    let site = Site::new();
    site.write(
        "site/gone/index.pars",
        r#"{status: 410, headers: {"Content-Type": "text/plain"}, body: "long gone"}"#,
    );
    let server = site.server("site: site\n", false).await;
    let app = server.app();

    let (status, body, headers) = get(&app, "/gone/").await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
    assert_eq!(body, "long gone");
}
