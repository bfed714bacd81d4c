//! Gateway configuration.
//!
//! Built once at startup (see `main.rs`, where each value can come from a CLI
//! flag or its environment variable) and then shared read-only.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Canonical Chat Completions path on OpenAI-compatible upstreams.
pub const DEFAULT_COMPLETION_PATH: &str = "/v1/chat/completions";

/// How `targetHost`/`path` query parameters become an upstream URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutePolicy {
    /// When true, a request without `path` is rejected; otherwise
    /// `default_path` is used.
    #[serde(default = "default_true")]
    pub path_required: bool,

    #[serde(default = "default_path")]
    pub default_path: String,

    /// `https` in production; `http` for local upstreams.
    #[serde(default = "default_scheme")]
    pub upstream_scheme: String,

    /// Optional allow-list of target hosts (with or without port).
    /// Empty means any well-formed host is accepted.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self {
            path_required: true,
            default_path: default_path(),
            upstream_scheme: default_scheme(),
            allowed_hosts: Vec::new(),
        }
    }
}

/// Relay behavior toggles.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayConfig {
    /// Emit a usage-only chunk before `[DONE]` when the upstream stream
    /// carried no usage of its own.
    #[serde(default)]
    pub stream_usage_fallback: bool,

    /// Ask OpenAI-compatible upstreams for final usage on streams by setting
    /// `stream_options.include_usage` (only if the client did not set it).
    #[serde(default)]
    pub stream_include_usage: bool,
}

/// Outbound HTTP client settings. The client owns the upstream connection pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpClientConfig {
    /// Overall per-request timeout. Unset for streaming-friendly defaults.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    #[serde(default = "default_pool_idle")]
    pub pool_max_idle_per_host: usize,

    /// Proxy for all upstream traffic.
    #[serde(default)]
    pub proxy_url: Option<String>,

    #[serde(default)]
    pub no_proxy: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: None,
            connect_timeout_seconds: default_connect_timeout(),
            pool_max_idle_per_host: default_pool_idle(),
            proxy_url: None,
            no_proxy: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub route: RoutePolicy,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub http: HttpClientConfig,

    /// Target host used by `/v1/chat/completions`, which carries no routing
    /// query parameters.
    #[serde(default)]
    pub default_target_host: Option<String>,
}

impl GatewayConfig {
    /// Load from a YAML (`.yaml`/`.yml`) or JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = if is_yaml(path) {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        Ok(config)
    }
}

pub(crate) fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn default_true() -> bool {
    true
}

fn default_path() -> String {
    DEFAULT_COMPLETION_PATH.to_string()
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_pool_idle() -> usize {
    32
}

/// Parse the usual truthy spellings used in env vars.
pub fn parse_flag(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
