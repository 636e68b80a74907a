//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, path).
    pub listener: ListenerConfig,

    /// Upstream relay and its targets.
    pub upstream: UpstreamConfig,

    /// Optional pipeline plugins.
    pub plugins: PluginsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Path serving both WebSocket upgrades and HTTP POSTs.
    pub path: String,

    /// Maximum HTTP request body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5000".to_string(),
            path: "/".to_string(),
            max_body_bytes: 2 * 1024 * 1024, // 2MB
        }
    }
}

/// Transport used to reach upstream targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    #[default]
    Websocket,
    Http,
}

/// Upstream relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub kind: UpstreamKind,

    /// How long a call waits for its upstream reply, in seconds.
    pub timeout_secs: u64,

    /// Capacity of each connection's upstream write queue.
    pub queue_capacity: usize,

    /// Pooled WebSocket links per target.
    pub max_links_per_target: usize,

    /// How long a connection waits for a pooled link, in milliseconds.
    pub acquire_timeout_ms: u64,

    /// Overall deadline for one HTTP POST call, in seconds.
    pub response_timeout_secs: u64,

    pub targets: Vec<TargetConfig>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            kind: UpstreamKind::default(),
            timeout_secs: 30,
            queue_capacity: 1000,
            max_links_per_target: 64,
            acquire_timeout_ms: 5000,
            response_timeout_secs: 60,
            targets: Vec::new(),
        }
    }
}

/// One upstream endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    /// Endpoint URL (ws:// or http(s):// depending on the upstream kind).
    pub url: String,

    /// Weight for weighted load balancing (default: 1).
    #[serde(default = "default_weight")]
    pub weight: i64,

    /// Keep the entry but never select it.
    #[serde(default)]
    pub ignore: bool,
}

fn default_weight() -> i64 {
    1
}

/// Plugin configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PluginsConfig {
    pub disable: DisableConfig,
    pub cache: Vec<CacheItemConfig>,
    pub before_cache: Vec<BeforeCacheItemConfig>,
    pub rate_limit: RateLimitConfig,
    pub statistic: StatisticConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DisableConfig {
    pub enabled: bool,
    pub methods: Vec<String>,
}

/// A cacheable method, optionally pinned to leading params.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheItemConfig {
    pub name: String,

    #[serde(default)]
    pub params_for_cache: Vec<Value>,

    /// Items with a non-positive expiry are ignored.
    #[serde(default)]
    pub expire_secs: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BeforeCacheItemConfig {
    pub method: String,

    /// Items with a non-positive count are ignored.
    #[serde(default)]
    pub fetch_cache_key_from_params_count: i64,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// New connections allowed per window.
    pub connection_rate: u64,

    /// Calls allowed per window, across all connections.
    pub rpc_rate: u64,

    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            connection_rate: 1_000_000,
            rpc_rate: 10_000_000,
            window_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatisticConfig {
    pub enabled: bool,
    pub queue_capacity: usize,
    pub dump_interval_secs: u64,
}

impl Default for StatisticConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_capacity: 10_000,
            dump_interval_secs: 60,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
