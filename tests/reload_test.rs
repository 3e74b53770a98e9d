//! Development-mode reload tests: edits to a handler are observable on the
//! next request without a server restart, and the live-reload stream
//! broadcasts change events.

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::Request;
use tower::ServiceExt;

use basil::config::Config;
use basil::server::Server;
use basil::watch::ReloadEvent;

async fn body_of(app: &axum::Router, uri: &str) -> String {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), 1_000_000)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn bump_mtime(path: &std::path::Path) {
    let later = filetime::FileTime::from_unix_time(
        filetime::FileTime::now().unix_seconds() + 2,
        0,
    );
    filetime::set_file_mtime(path, later).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn edits_are_visible_within_the_reload_window() {
    let dir = tempfile::tempdir().unwrap();
    let site = dir.path().join("site");
    std::fs::create_dir_all(&site).unwrap();
    let handler = site.join("index.pars");
    std::fs::write(&handler, r#""v1""#).unwrap();

    let config = Config::from_str("site: site\n").unwrap();
    let server = Server::from_config(config, dir.path().to_path_buf(), true)
        .await
        .unwrap();
    let app = server.app();

    assert_eq!(body_of(&app, "/").await, "v1");

    std::fs::write(&handler, r#""v2""#).unwrap();
    bump_mtime(&handler);

    // The next GET must observe the edit within 500 ms of the write.
    let deadline = Instant::now() + Duration::from_millis(500);
    loop {
        let body = body_of(&app, "/").await;
        if body == "v2" {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "still serving stale body: {body}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watcher_broadcasts_reload_events_to_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let site = dir.path().join("site");
    std::fs::create_dir_all(&site).unwrap();
    let handler = site.join("index.pars");
    std::fs::write(&handler, r#""v1""#).unwrap();

    let config = Config::from_str("site: site\n").unwrap();
    let server = Server::from_config(config, dir.path().to_path_buf(), true)
        .await
        .unwrap();
    let mut reload_rx = server.state.reload_tx.subscribe();

    // Let the watcher arm, then edit.
    tokio::time::sleep(Duration::from_millis(250)).await;
    std::fs::write(&handler, r#""v2""#).unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), reload_rx.recv())
        .await
        .expect("watcher should broadcast within the debounce window")
        .unwrap();
    assert!(matches!(event, ReloadEvent::Changed { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn editing_a_dependency_invalidates_the_importer() {
    let dir = tempfile::tempdir().unwrap();
    let site = dir.path().join("site");
    std::fs::create_dir_all(&site).unwrap();
    std::fs::write(site.join("shared.pars"), "export let label = \"old\"").unwrap();
    std::fs::write(
        site.join("index.pars"),
        "let m = import @./shared\nm.label",
    )
    .unwrap();

    let config = Config::from_str("site: site\n").unwrap();
    let server = Server::from_config(config, dir.path().to_path_buf(), true)
        .await
        .unwrap();
    let app = server.app();

    assert_eq!(body_of(&app, "/").await, "old");

    tokio::time::sleep(Duration::from_millis(250)).await;
    std::fs::write(site.join("shared.pars"), "export let label = \"new\"").unwrap();
    bump_mtime(&site.join("shared.pars"));

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let body = body_of(&app, "/").await;
        if body == "new" {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "importer kept serving the stale module: {body}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
