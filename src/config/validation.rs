//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, capacities > 0, weights > 0)
//! - Check upstream URLs against the configured upstream kind
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use url::Url;

use crate::config::schema::{ProxyConfig, UpstreamKind};

/// One semantic problem in a config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if !config.listener.path.starts_with('/') {
        errors.push(ValidationError::new("listener.path", "must start with '/'"));
    }
    if config.listener.max_body_bytes == 0 {
        errors.push(ValidationError::new("listener.max_body_bytes", "must be > 0"));
    }

    let upstream = &config.upstream;
    for (field, value) in [
        ("upstream.timeout_secs", upstream.timeout_secs),
        ("upstream.acquire_timeout_ms", upstream.acquire_timeout_ms),
        ("upstream.response_timeout_secs", upstream.response_timeout_secs),
        ("upstream.queue_capacity", upstream.queue_capacity as u64),
        ("upstream.max_links_per_target", upstream.max_links_per_target as u64),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be > 0"));
        }
    }

    if !upstream.targets.iter().any(|t| !t.ignore) {
        errors.push(ValidationError::new(
            "upstream.targets",
            "at least one non-ignored target is required",
        ));
    }

    let schemes: &[&str] = match upstream.kind {
        UpstreamKind::Websocket => &["ws"],
        UpstreamKind::Http => &["http", "https"],
    };
    for (i, target) in upstream.targets.iter().enumerate() {
        if target.weight <= 0 {
            errors.push(ValidationError::new(
                format!("upstream.targets[{i}].weight"),
                "must be > 0",
            ));
        }
        match Url::parse(&target.url) {
            Ok(url) if schemes.contains(&url.scheme()) => {}
            Ok(url) => errors.push(ValidationError::new(
                format!("upstream.targets[{i}].url"),
                format!("scheme '{}' does not match upstream kind {:?}", url.scheme(), upstream.kind),
            )),
            Err(e) => errors.push(ValidationError::new(
                format!("upstream.targets[{i}].url"),
                e.to_string(),
            )),
        }
    }

    let rate_limit = &config.plugins.rate_limit;
    if rate_limit.enabled {
        for (field, value) in [
            ("plugins.rate_limit.connection_rate", rate_limit.connection_rate),
            ("plugins.rate_limit.rpc_rate", rate_limit.rpc_rate),
            ("plugins.rate_limit.window_ms", rate_limit.window_ms),
        ] {
            if value == 0 {
                errors.push(ValidationError::new(field, "must be > 0"));
            }
        }
    }

    let statistic = &config.plugins.statistic;
    if statistic.enabled {
        if statistic.queue_capacity == 0 {
            errors.push(ValidationError::new("plugins.statistic.queue_capacity", "must be > 0"));
        }
        if statistic.dump_interval_secs == 0 {
            errors.push(ValidationError::new("plugins.statistic.dump_interval_secs", "must be > 0"));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "is not a socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
