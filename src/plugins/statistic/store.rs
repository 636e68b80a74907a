//! Metric stores fed by the statistic consumer.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use super::RequestRecord;

/// Destination for request/response records.
pub trait MetricStore: Send + Sync {
    fn record_request(&self, record: &RequestRecord);
    fn record_response(&self, record: &RequestRecord);
    fn snapshot(&self) -> StatSnapshot;
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatSnapshot {
    pub global: BTreeMap<String, u64>,
    pub global_total: u64,
    pub hourly: BTreeMap<String, u64>,
    pub hourly_total: u64,
    pub errors: BTreeMap<String, u64>,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    counts: HashMap<String, u64>,
    total: u64,
}

/// In-memory store counting calls per method, globally and per window.
#[derive(Debug)]
pub struct MemoryMetricStore {
    global: DashMap<String, u64>,
    global_total: AtomicU64,
    errors: DashMap<String, u64>,
    window_len: Duration,
    window: Mutex<Window>,
}

impl Default for MemoryMetricStore {
    fn default() -> Self {
        Self::with_window(Duration::from_secs(3600))
    }
}

impl MemoryMetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(window_len: Duration) -> Self {
        Self {
            global: DashMap::new(),
            global_total: AtomicU64::new(0),
            errors: DashMap::new(),
            window_len,
            window: Mutex::new(Window {
                started: Instant::now(),
                counts: HashMap::new(),
                total: 0,
            }),
        }
    }

    fn window(&self) -> std::sync::MutexGuard<'_, Window> {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if window.started.elapsed() > self.window_len {
            window.started = Instant::now();
            window.counts.clear();
            window.total = 0;
        }
        window
    }
}

impl MetricStore for MemoryMetricStore {
    fn record_request(&self, record: &RequestRecord) {
        *self.global.entry(record.method.clone()).or_default() += 1;
        self.global_total.fetch_add(1, Ordering::Relaxed);

        let mut window = self.window();
        *window.counts.entry(record.method.clone()).or_default() += 1;
        window.total += 1;
    }

    fn record_response(&self, record: &RequestRecord) {
        if record.response.as_ref().is_some_and(|r| r.is_error()) {
            *self.errors.entry(record.method.clone()).or_default() += 1;
        }
    }

    fn snapshot(&self) -> StatSnapshot {
        let window = self.window();
        StatSnapshot {
            global: self.global.iter().map(|e| (e.key().clone(), *e.value())).collect(),
            global_total: self.global_total.load(Ordering::Relaxed),
            hourly: window.counts.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            hourly_total: window.total,
            errors: self.errors.iter().map(|e| (e.key().clone(), *e.value())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{codes, RpcError, RpcResponse};
    use serde_json::Value;

    fn record(method: &str, response: Option<RpcResponse>) -> RequestRecord {
        RequestRecord {
            trace_id: uuid::Uuid::new_v4(),
            connection_id: 1,
            request_id: 1,
            method: method.into(),
            params: Value::Null,
            target: None,
            response,
            from_cache: false,
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn counts_per_method() {
        let store = MemoryMetricStore::new();
        store.record_request(&record("a", None));
        store.record_request(&record("a", None));
        store.record_request(&record("b", None));

        let snap = store.snapshot();
        assert_eq!(snap.global["a"], 2);
        assert_eq!(snap.global_total, 3);
        assert_eq!(snap.hourly["b"], 1);
        assert_eq!(snap.hourly_total, 3);
    }

    #[test]
    fn window_rolls_over() {
        let store = MemoryMetricStore::with_window(Duration::from_millis(1));
        store.record_request(&record("a", None));
        std::thread::sleep(Duration::from_millis(5));

        let snap = store.snapshot();
        assert_eq!(snap.global_total, 1);
        assert_eq!(snap.hourly_total, 0);
    }

    #[test]
    fn counts_errors() {
        let store = MemoryMetricStore::new();
        let failed = RpcResponse::failure(1, RpcError::new(codes::UPSTREAM_TIMEOUT, "t"));
        store.record_response(&record("a", Some(failed)));
        store.record_response(&record("a", Some(RpcResponse::success(1, Value::Null))));
        assert_eq!(store.snapshot().errors["a"], 1);
    }
}
