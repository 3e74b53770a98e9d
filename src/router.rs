//! Route resolution.
//!
//! Two modes, chosen at server start: an explicit route table (first match
//! wins, declaration order significant, terminal `*` wildcards), or
//! filesystem routing against a site root where a request path walks back
//! toward the root looking for the nearest `index.pars`. Static routes are
//! matched before either mode and never reach the evaluator.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BasilError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthPolicy {
    #[default]
    None,
    Optional,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    #[default]
    Page,
    Api,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub pattern: String,
    pub handler_path: PathBuf,
    pub auth: AuthPolicy,
    /// Response cache TTL in seconds; zero disables caching.
    pub cache_ttl: u64,
    pub kind: RouteKind,
}

#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub handler_path: PathBuf,
    /// Unconsumed path segments, handed to the handler as `@args`.
    pub tail: Vec<String>,
    pub auth: AuthPolicy,
    pub cache_ttl: u64,
    pub kind: RouteKind,
}

#[derive(Debug)]
pub enum Router {
    Table(Vec<Route>),
    Site { root: PathBuf },
}

impl Router {
    pub fn table(routes: Vec<Route>) -> Result<Router, BasilError> {
        for route in &routes {
            if !route.handler_path.is_absolute() {
                return Err(BasilError::Config(format!(
                    "route '{}' has a non-absolute handler path {:?}",
                    route.pattern, route.handler_path
                )));
            }
            if !route.handler_path.exists() {
                return Err(BasilError::Config(format!(
                    "route '{}' points at a missing handler {:?}",
                    route.pattern, route.handler_path
                )));
            }
        }
        Ok(Router::Table(routes))
    }

    pub fn site(root: PathBuf) -> Result<Router, BasilError> {
        if !root.is_dir() {
            return Err(BasilError::Config(format!(
                "site root {root:?} is not a directory"
            )));
        }
        let handlers = walkdir::WalkDir::new(&root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry.file_type().is_file()
                    && entry.path().extension().and_then(|e| e.to_str()) == Some("pars")
            })
            .count();
        if handlers == 0 {
            tracing::warn!("site root {root:?} contains no .pars handlers yet");
        } else {
            tracing::debug!("site root {root:?} holds {handlers} handler script(s)");
        }
        Ok(Router::Site { root })
    }

    /// Resolve a normalised request path to a handler, or `None` for 404.
    pub fn resolve(&self, path: &str) -> Option<RouteMatch> {
        match self {
            Router::Table(routes) => resolve_table(routes, path),
            Router::Site { root } => resolve_site(root, path),
        }
    }

    /// The filesystem locations a failed resolution checked, for the dev
    /// 404 page.
    pub fn candidates(&self, path: &str) -> Vec<PathBuf> {
        match self {
            Router::Table(_) => Vec::new(),
            Router::Site { root } => {
                let segments = split_segments(path);
                let mut checked = Vec::new();
                let exact = root.join(segments.join("/")).with_extension("pars");
                checked.push(exact);
                for i in (0..=segments.len()).rev() {
                    let mut dir = root.clone();
                    for segment in &segments[..i] {
                        dir.push(segment);
                    }
                    checked.push(dir.join("index.pars"));
                }
                checked
            }
        }
    }
}

fn resolve_table(routes: &[Route], path: &str) -> Option<RouteMatch> {
    for route in routes {
        if let Some(tail) = pattern_match(&route.pattern, path) {
            return Some(RouteMatch {
                handler_path: route.handler_path.clone(),
                tail,
                auth: route.auth,
                cache_ttl: route.cache_ttl,
                kind: route.kind,
            });
        }
    }
    None
}

/// Exact match, or a terminal `*` wildcard whose remainder becomes the
/// tail.
fn pattern_match(pattern: &str, path: &str) -> Option<Vec<String>> {
    if let Some(prefix) = pattern.strip_suffix('*') {
        let prefix = prefix.trim_end_matches('/');
        let path_trimmed = path.trim_end_matches('/');
        if path_trimmed == prefix {
            return Some(Vec::new());
        }
        if let Some(rest) = path_trimmed.strip_prefix(&format!("{prefix}/")) {
            return Some(split_segments(rest));
        }
        None
    } else if pattern.trim_end_matches('/') == path.trim_end_matches('/') {
        Some(Vec::new())
    } else {
        None
    }
}

fn resolve_site(root: &Path, path: &str) -> Option<RouteMatch> {
    let segments = split_segments(path);

    // An exact `<path>.pars` file wins over the index walk.
    if !segments.is_empty() {
        let exact = root.join(segments.join("/")).with_extension("pars");
        if exact.is_file() {
            return Some(RouteMatch {
                handler_path: exact,
                tail: Vec::new(),
                auth: AuthPolicy::None,
                cache_ttl: 0,
                kind: RouteKind::Page,
            });
        }
    }

    // Walk from the deepest directory toward the site root.
    for i in (0..=segments.len()).rev() {
        let mut dir = root.to_path_buf();
        for segment in &segments[..i] {
            dir.push(segment);
        }
        let index = dir.join("index.pars");
        if index.is_file() {
            return Some(RouteMatch {
                handler_path: index,
                tail: segments[i..].to_vec(),
                auth: AuthPolicy::None,
                cache_ttl: 0,
                kind: RouteKind::Page,
            });
        }
    }
    None
}

fn split_segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .map(|s| s.to_string())
        .collect()
}
