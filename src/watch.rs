//! Filesystem watching and cache invalidation.
//!
//! Receives debounced change events for the base directory, maps each
//! changed path to its canonical cache key, purges the AST cache entry and
//! its transitive dependants (plus the module registry), and broadcasts a
//! best-effort `reload` event to any open live-reload streams. Events are
//! coalesced within a short window to tolerate editors that rewrite files
//! in several steps.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_full::{
    new_debouncer,
    notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher},
    DebounceEventResult, Debouncer, FileIdMap,
};
use tokio::sync::broadcast;

use crate::cache::ScriptCache;
use crate::error::BasilError;
use crate::eval::ModuleRegistry;

/// Debounce window for editor save patterns.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Notification sent to live-reload subscribers.
#[derive(Debug, Clone)]
pub enum ReloadEvent {
    /// Something under the base directory changed; reload the page.
    Changed { path: Option<PathBuf> },
    /// The server is shutting down; close the stream.
    Shutdown,
}

/// Holds the running watcher; dropping it stops watching.
pub struct WatchService {
    _debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
}

impl WatchService {
    /// Watch `base_dir` recursively. Script changes invalidate the cache
    /// and module registry; every change broadcasts a reload event.
    pub fn start(
        base_dir: &Path,
        cache: Arc<ScriptCache>,
        modules: Arc<ModuleRegistry>,
        reload_tx: broadcast::Sender<ReloadEvent>,
    ) -> Result<WatchService, BasilError> {
        let mut debouncer = new_debouncer(
            DEBOUNCE_WINDOW,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let mut any_change = false;
                    for event in events.iter() {
                        if !matches!(
                            event.event.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        ) {
                            continue;
                        }
                        for path in event.paths.iter().filter(|p| !is_hidden(p)) {
                            any_change = true;
                            if is_script(path) {
                                let key = path
                                    .canonicalize()
                                    .unwrap_or_else(|_| path.clone());
                                let purged = cache.invalidate(&key);
                                modules.remove_all(&purged);
                                tracing::debug!(
                                    "[watch] {:?} changed; purged {} cache entr(ies)",
                                    path,
                                    purged.len()
                                );
                            }
                        }
                    }
                    if any_change {
                        // Best-effort broadcast: a full channel or absent
                        // subscribers simply drop the event.
                        let _ = reload_tx.send(ReloadEvent::Changed { path: None });
                    }
                }
                Err(errors) => {
                    tracing::error!("[watch] notify debouncer errors: {errors:?}");
                }
            },
        )?;
        debouncer
            .watcher()
            .watch(base_dir, RecursiveMode::Recursive)?;
        tracing::info!("[watch] watching {base_dir:?}");
        Ok(WatchService {
            _debouncer: debouncer,
        })
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

fn is_script(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("pars")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceReader;

    fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        false
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn edits_invalidate_the_cache_and_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        let script = base.join("page.pars");
        std::fs::write(&script, "let v = \"v1\"").unwrap();

        let cache = Arc::new(ScriptCache::new(SourceReader::new(base.clone()), true));
        let modules = Arc::new(ModuleRegistry::new());
        let (reload_tx, mut reload_rx) = broadcast::channel(16);

        cache.get_or_parse(&script).await.unwrap();
        assert_eq!(cache.stats().entries, 1);

        let _watch =
            WatchService::start(&base, cache.clone(), modules.clone(), reload_tx).unwrap();
        // Give the watcher a moment to arm before editing.
        tokio::time::sleep(Duration::from_millis(250)).await;
        std::fs::write(&script, "let v = \"v2\"").unwrap();

        let cache_probe = cache.clone();
        let emptied = tokio::task::spawn_blocking(move || {
            wait_for(
                || cache_probe.stats().entries == 0,
                Duration::from_secs(5),
            )
        })
        .await
        .unwrap();
        assert!(emptied, "watcher should purge the edited script");

        let event = tokio::time::timeout(Duration::from_secs(5), reload_rx.recv())
            .await
            .expect("reload event within the window")
            .unwrap();
        assert!(matches!(event, ReloadEvent::Changed { .. }));
    }

    #[test]
    fn hidden_and_foreign_files_are_filtered() {
        assert!(is_hidden(Path::new("/a/.git")));
        assert!(!is_hidden(Path::new("/a/page.pars")));
        assert!(is_script(Path::new("/a/page.pars")));
        assert!(!is_script(Path::new("/a/styles.css")));
    }
}
