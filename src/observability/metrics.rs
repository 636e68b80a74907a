//! Metrics collection and exposition.
//!
//! # Metrics
//! - `rpc_requests_total` (counter): completed calls by method, outcome
//! - `rpc_request_duration_seconds` (histogram): end-to-end call latency
//! - `proxy_active_connections` (gauge): live downstream connections
//! - `proxy_rate_limited_total` (counter): rejections by scope
//! - `rpc_cache_hits_total` (counter): cache hits by method
//! - `statistic_dropped_total` (counter): records dropped on full queues

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_rpc_request(method: &str, outcome: &'static str, started: Instant) {
    counter!("rpc_requests_total", "method" => method.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!("rpc_request_duration_seconds", "method" => method.to_string())
        .record(started.elapsed().as_secs_f64());
}

pub fn set_active_connections(count: u64) {
    gauge!("proxy_active_connections").set(count as f64);
}

pub fn record_rate_limited(scope: &'static str) {
    counter!("proxy_rate_limited_total", "scope" => scope).increment(1);
}

pub fn record_cache_hit(method: &str) {
    counter!("rpc_cache_hits_total", "method" => method.to_string()).increment(1);
}

pub fn record_statistic_dropped(queue: &'static str) {
    counter!("statistic_dropped_total", "queue" => queue).increment(1);
}
