use super::defaults::*;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub version: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl Config {
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MetricsConfig {
    pub listen: String,
    #[serde(default = "default_metrics_path")]
    pub path: String,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default = "default_metrics_max_concurrent_connections")]
    pub max_concurrent_connections: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub worker_threads: Option<usize>,
    #[serde(default)]
    pub max_blocking_threads: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: String,
    /// Root service every inbound request is dispatched to.
    pub service: String,
    #[serde(default = "default_header_read_timeout_ms")]
    pub header_read_timeout_ms: u64,
    /// Upper bound on concurrently served client connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub fastcgi: Option<FastCgiServiceConfig>,
    #[serde(default)]
    pub weighted: Option<WeightedServiceConfig>,
}

/// FastCGI backend descriptor. Zero timeouts fall back to the defaults.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FastCgiServiceConfig {
    pub servers: Vec<FastCgiServerConfig>,
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub dial_timeout_ms: u64,
    #[serde(default)]
    pub write_timeout_ms: u64,
    #[serde(default)]
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub acquire_conn_timeout_ms: u64,
    #[serde(default = "default_fastcgi_max_conns")]
    pub max_conns: usize,
    #[serde(default)]
    pub log_stderr: bool,
    #[serde(default)]
    pub split_path_regex: Option<String>,
    #[serde(default)]
    pub resolve_symlink: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub sticky: Option<StickyConfig>,
}

impl FastCgiServiceConfig {
    pub fn dial_timeout_ms(&self) -> u64 {
        non_zero_or(self.dial_timeout_ms, default_fastcgi_io_timeout_ms())
    }

    pub fn write_timeout_ms(&self) -> u64 {
        non_zero_or(self.write_timeout_ms, default_fastcgi_io_timeout_ms())
    }

    pub fn read_timeout_ms(&self) -> u64 {
        non_zero_or(self.read_timeout_ms, default_fastcgi_io_timeout_ms())
    }

    pub fn acquire_conn_timeout_ms(&self) -> u64 {
        non_zero_or(
            self.acquire_conn_timeout_ms,
            default_fastcgi_acquire_timeout_ms(),
        )
    }

    pub fn split_path_regex(&self) -> &str {
        self.split_path_regex
            .as_deref()
            .unwrap_or(DEFAULT_SPLIT_PATH_REGEX)
    }
}

fn non_zero_or(value: u64, fallback: u64) -> u64 {
    if value == 0 {
        fallback
    } else {
        value
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FastCgiServerConfig {
    /// `host:port` or `unix:///path/to/socket`.
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WeightedServiceConfig {
    pub services: Vec<WeightedChildConfig>,
    #[serde(default)]
    pub sticky: Option<StickyConfig>,
    #[serde(default)]
    pub canary: Option<CanaryConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WeightedChildConfig {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StickyConfig {
    pub cookie: StickyCookieConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StickyCookieConfig {
    #[serde(default = "default_sticky_cookie_name")]
    pub name: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

/// Requests carrying `header: value` are narrowed to `services`; all other
/// requests never reach them.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CanaryConfig {
    pub header: String,
    pub value: String,
    pub services: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}
