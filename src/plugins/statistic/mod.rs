//! Request statistics.
//!
//! # Data Flow
//! ```text
//! on_rpc_request  ──try_send──▶ requests queue  ──┐
//! on_rpc_response ──try_send──▶ responses queue ──┼──▶ consumer task ──▶ MetricStore
//!                                                 │                      │
//!                                   dump ticker ──┘                      └──▶ snapshot log
//! ```
//!
//! # Design Decisions
//! - Queues are bounded; when full the record is dropped and logged, the
//!   pipeline never waits on statistics
//! - The store is injected, so tests and alternative backends swap it freely

pub mod store;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::error::ProxyResult;
use crate::middleware::{Middleware, Next};
use crate::observability::metrics;
use crate::rpc::{RequestSession, RpcResponse};

pub use store::{MemoryMetricStore, MetricStore, StatSnapshot};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_DUMP_INTERVAL: Duration = Duration::from_secs(60);

/// Snapshot of one call handed to the statistics consumer.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub trace_id: Uuid,
    pub connection_id: u64,
    pub request_id: u64,
    pub method: String,
    pub params: Value,
    pub target: Option<String>,
    pub response: Option<RpcResponse>,
    pub from_cache: bool,
    pub elapsed: Duration,
}

impl RequestRecord {
    fn capture(session: &RequestSession) -> ProxyResult<Self> {
        let request = session.request()?;
        Ok(Self {
            trace_id: session.trace_id,
            connection_id: session.connection_id().as_u64(),
            request_id: request.id,
            method: request.method.clone(),
            params: request.params.clone(),
            target: session
                .connection()
                .ok()
                .and_then(|c| c.selected_target())
                .map(|t| t.to_string()),
            response: session.response().cloned(),
            from_cache: session.response_set_by_cache,
            elapsed: session.received_at.elapsed(),
        })
    }
}

type Receivers = (mpsc::Receiver<RequestRecord>, mpsc::Receiver<RequestRecord>);

/// Feeds every call into a [`MetricStore`] without blocking the pipeline.
pub struct StatisticMiddleware {
    requests: mpsc::Sender<RequestRecord>,
    responses: mpsc::Sender<RequestRecord>,
    receivers: Mutex<Option<Receivers>>,
    store: Arc<dyn MetricStore>,
    dump_interval: Duration,
}

impl std::fmt::Debug for StatisticMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticMiddleware")
            .field("dump_interval", &self.dump_interval)
            .finish()
    }
}

impl StatisticMiddleware {
    pub fn new(store: Arc<dyn MetricStore>, queue_capacity: usize, dump_interval: Duration) -> Self {
        let (requests, requests_rx) = mpsc::channel(queue_capacity.max(1));
        let (responses, responses_rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            requests,
            responses,
            receivers: Mutex::new(Some((requests_rx, responses_rx))),
            store,
            dump_interval,
        }
    }

    pub fn store(&self) -> &Arc<dyn MetricStore> {
        &self.store
    }

    fn enqueue(queue: &mpsc::Sender<RequestRecord>, label: &'static str, record: RequestRecord) {
        match queue.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                metrics::record_statistic_dropped(label);
                tracing::warn!(queue = label, method = %record.method, request_id = record.request_id, "Statistic queue full, record dropped");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(queue = label, "Statistic consumer stopped");
            }
        }
    }
}

async fn consume(
    store: Arc<dyn MetricStore>,
    (mut requests, mut responses): Receivers,
    dump_interval: Duration,
) {
    let mut ticker = tokio::time::interval(dump_interval);
    ticker.tick().await;
    let (mut requests_open, mut responses_open) = (true, true);

    while requests_open || responses_open {
        tokio::select! {
            record = requests.recv(), if requests_open => match record {
                Some(record) => store.record_request(&record),
                None => requests_open = false,
            },
            record = responses.recv(), if responses_open => match record {
                Some(record) => store.record_response(&record),
                None => responses_open = false,
            },
            _ = ticker.tick() => {
                let snapshot = store.snapshot();
                match serde_json::to_string(&snapshot) {
                    Ok(json) => tracing::info!(stats = %json, "Rpc statistics"),
                    Err(e) => tracing::warn!(error = %e, "Failed to encode statistics"),
                }
            }
        }
    }
    tracing::debug!("Statistic consumer finished");
}

#[async_trait]
impl Middleware for StatisticMiddleware {
    fn name(&self) -> &'static str {
        "statistic"
    }

    async fn on_start(&self) -> ProxyResult<()> {
        let receivers = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match receivers {
            Some(receivers) => {
                tokio::spawn(consume(Arc::clone(&self.store), receivers, self.dump_interval));
            }
            None => tracing::warn!("Statistic consumer already started"),
        }
        Ok(())
    }

    async fn on_rpc_request(&self, session: &mut RequestSession, next: Next<'_>) -> ProxyResult<()> {
        if let Ok(record) = RequestRecord::capture(session) {
            Self::enqueue(&self.requests, "requests", record);
        }
        next.on_rpc_request(session).await
    }

    async fn on_rpc_response(&self, session: &mut RequestSession, next: Next<'_>) -> ProxyResult<()> {
        next.on_rpc_response(session).await?;

        let record = RequestRecord::capture(session)?;
        let outcome = match &record.response {
            _ if record.from_cache => "cache",
            Some(r) if r.is_error() => "error",
            _ => "ok",
        };
        metrics::record_rpc_request(&record.method, outcome, session.received_at);
        Self::enqueue(&self.responses, "responses", record);
        Ok(())
    }
}
