//! Server configuration.
//!
//! YAML, with `${VAR}` / `${VAR:-default}` interpolation applied to the
//! raw bytes before parsing. The key set is closed: unknown keys are a
//! configuration error, as is setting both `site` and `routes`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BasilError;
use crate::router::{AuthPolicy, Route, RouteKind};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub auth: AuthConfig,
    pub session: SessionConfig,
    pub git: GitConfig,
    pub dev: DevConfig,
    /// Application database location.
    pub sqlite: Option<String>,
    pub public_dir: Option<String>,
    /// Filesystem-routing site root. Mutually exclusive with `routes`.
    pub site: Option<String>,
    #[serde(rename = "static")]
    pub static_entries: Vec<StaticEntry>,
    pub routes: Vec<RouteEntry>,
    pub logging: LoggingConfig,
    pub developers: BTreeMap<String, DeveloperConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub https: HttpsConfig,
    pub proxy: ProxyConfig,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            https: HttpsConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HttpsConfig {
    pub auto: bool,
    pub email: Option<String>,
    pub cache_dir: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProxyConfig {
    pub trusted: bool,
    pub trusted_ips: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SecurityConfig {
    pub hsts: HstsConfig,
    pub content_type_options: Option<String>,
    pub frame_options: Option<String>,
    pub xss_protection: Option<String>,
    pub referrer_policy: Option<String>,
    pub csp: Option<String>,
    pub permissions_policy: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HstsConfig {
    pub enabled: bool,
    pub max_age: u64,
    pub include_subdomains: bool,
    pub preload: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub registration: Registration,
    /// Seconds.
    pub session_ttl: u64,
}

impl Default for AuthConfig {
    fn default() -> AuthConfig {
        AuthConfig {
            enabled: false,
            registration: Registration::Closed,
            session_ttl: 86_400,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Registration {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SessionConfig {
    pub store: SessionStoreKind,
    pub secret: Option<String>,
    /// Seconds.
    pub max_age: u64,
    pub cookie_name: String,
    pub secure: Option<bool>,
    pub http_only: bool,
    pub same_site: SameSite,
    pub table: String,
    pub cleanup: bool,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            store: SessionStoreKind::Cookie,
            secret: None,
            max_age: 86_400,
            cookie_name: "basil_session".to_string(),
            secure: None,
            http_only: true,
            same_site: SameSite::Lax,
            table: "sessions".to_string(),
            cleanup: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStoreKind {
    Cookie,
    Sqlite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    Lax,
    Strict,
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GitConfig {
    pub enabled: bool,
    pub require_auth: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DevConfig {
    pub log_database: Option<String>,
    pub log_max_size: u64,
    pub log_truncate_pct: u8,
}

impl Default for DevConfig {
    fn default() -> DevConfig {
        DevConfig {
            log_database: None,
            log_max_size: 10_000_000,
            log_truncate_pct: 20,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StaticEntry {
    pub path: String,
    pub root: Option<String>,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RouteEntry {
    pub path: String,
    pub handler: String,
    /// `required`, `optional`, or empty.
    pub auth: String,
    /// Response cache TTL in seconds.
    pub cache: u64,
    pub public_dir: Option<String>,
    /// `api` or empty.
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub output: Option<String>,
    pub quiet: bool,
    pub parsley: ParsleyLogging,
}

impl Default for LoggingConfig {
    fn default() -> LoggingConfig {
        LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Text,
            output: None,
            quiet: false,
            parsley: ParsleyLogging::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ParsleyLogging {
    pub output: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DeveloperConfig {
    pub port: Option<u16>,
    pub sqlite: Option<String>,
    pub handlers: Option<String>,
    #[serde(rename = "static")]
    pub static_entries: Option<Vec<StaticEntry>>,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, BasilError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BasilError::Config(format!("cannot read config {path:?}: {e}"))
        })?;
        Config::from_str(&raw)
    }

    pub fn from_str(raw: &str) -> Result<Config, BasilError> {
        let interpolated = interpolate_env(raw, &|var| std::env::var(var).ok());
        let config: Config = serde_yaml::from_str(&interpolated)
            .map_err(|e| BasilError::Config(format!("{e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BasilError> {
        if self.site.is_some() && !self.routes.is_empty() {
            return Err(BasilError::Config(
                "`site` and `routes` are mutually exclusive; configure one or the other"
                    .to_string(),
            ));
        }
        for route in &self.routes {
            if !matches!(route.auth.as_str(), "" | "required" | "optional") {
                return Err(BasilError::Config(format!(
                    "route '{}': auth must be 'required', 'optional', or empty",
                    route.path
                )));
            }
            if !matches!(route.kind.as_str(), "" | "api") {
                return Err(BasilError::Config(format!(
                    "route '{}': type must be 'api' or empty",
                    route.path
                )));
            }
        }
        if !matches!(
            self.logging.level.as_str(),
            "debug" | "info" | "warn" | "error"
        ) {
            return Err(BasilError::Config(format!(
                "logging.level '{}' is not one of debug, info, warn, error",
                self.logging.level
            )));
        }
        Ok(())
    }

    /// Apply a `developers.<name>` overlay.
    pub fn apply_developer(&mut self, name: &str) -> Result<(), BasilError> {
        let overlay = self.developers.get(name).cloned().ok_or_else(|| {
            BasilError::Config(format!("developer '{name}' is not configured"))
        })?;
        if let Some(port) = overlay.port {
            self.server.port = port;
        }
        if let Some(sqlite) = overlay.sqlite {
            self.sqlite = Some(sqlite);
        }
        if let Some(handlers) = overlay.handlers {
            self.site = Some(handlers);
            self.routes.clear();
        }
        if let Some(static_entries) = overlay.static_entries {
            self.static_entries = static_entries;
        }
        if let Some(logging) = overlay.logging {
            self.logging = logging;
        }
        Ok(())
    }

    /// Lower `routes[]` entries into router routes, resolving handler
    /// paths against the base directory.
    pub fn table_routes(&self, base_dir: &Path) -> Result<Vec<Route>, BasilError> {
        self.routes
            .iter()
            .map(|entry| {
                let handler = base_dir.join(&entry.handler);
                let handler_path = handler.canonicalize().map_err(|e| {
                    BasilError::Config(format!(
                        "route '{}': handler '{}' is not resolvable: {e}",
                        entry.path, entry.handler
                    ))
                })?;
                Ok(Route {
                    pattern: entry.path.clone(),
                    handler_path,
                    auth: match entry.auth.as_str() {
                        "required" => AuthPolicy::Required,
                        "optional" => AuthPolicy::Optional,
                        _ => AuthPolicy::None,
                    },
                    cache_ttl: entry.cache,
                    kind: if entry.kind == "api" {
                        RouteKind::Api
                    } else {
                        RouteKind::Page
                    },
                })
            })
            .collect()
    }
}

/// `${VAR}` and `${VAR:-default}` substitution over the raw config text.
/// Unset variables without a default substitute as empty.
pub fn interpolate_env(raw: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(close) = raw[i + 2..].find('}') {
                let inner = &raw[i + 2..i + 2 + close];
                let (var, default) = match inner.split_once(":-") {
                    Some((v, d)) => (v, Some(d)),
                    None => (inner, None),
                };
                match lookup(var) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(default.unwrap_or("")),
                }
                i += 2 + close + 1;
                continue;
            }
        }
        let ch_len = raw[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
        out.push_str(&raw[i..i + ch_len]);
        i += ch_len;
    }
    out
}
