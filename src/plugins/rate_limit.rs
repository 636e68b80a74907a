//! Connection and call admission control.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{ProxyError, ProxyResult};
use crate::middleware::{Flow, Stage};
use crate::observability::metrics;
use crate::rpc::{ConnectionSession, RequestSession, RpcResponse};
use crate::security::rate_limit::{Limiter, TokenBucketLimiter};

pub const DEFAULT_CONNECTION_RATE: u64 = 1_000_000;
pub const DEFAULT_RPC_RATE: u64 = 10_000_000;

/// Rejects connections and calls once their token buckets run dry.
pub struct RateLimitStage {
    connection_limiter: Arc<dyn Limiter>,
    rpc_limiter: Option<Arc<dyn Limiter>>,
}

impl std::fmt::Debug for RateLimitStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitStage")
            .field("rpc_limited", &self.rpc_limiter.is_some())
            .finish()
    }
}

impl RateLimitStage {
    /// Limit new connections to `connection_rate` per `window`.
    pub fn new(connection_rate: u64, window: Duration) -> Self {
        Self::with_limiter(Arc::new(TokenBucketLimiter::new(connection_rate, window)))
    }

    pub fn with_limiter(connection_limiter: Arc<dyn Limiter>) -> Self {
        Self {
            connection_limiter,
            rpc_limiter: None,
        }
    }

    /// Also limit calls, across all connections.
    pub fn with_rpc_limiter(mut self, limiter: Arc<dyn Limiter>) -> Self {
        self.rpc_limiter = Some(limiter);
        self
    }
}

impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn on_connection(&self, conn: &Arc<ConnectionSession>) -> ProxyResult<Flow> {
        if self.connection_limiter.take() {
            return Ok(Flow::Continue);
        }
        metrics::record_rate_limited("connection");
        tracing::warn!(connection_id = %conn.id(), peer = ?conn.peer(), "Connection rate limit exceeded");
        Err(ProxyError::RateLimited)
    }

    fn on_rpc_request(&self, session: &mut RequestSession) -> ProxyResult<Flow> {
        let Some(limiter) = &self.rpc_limiter else {
            return Ok(Flow::Continue);
        };
        if limiter.take() {
            return Ok(Flow::Continue);
        }

        let id = session.request()?.id;
        metrics::record_rate_limited("rpc");
        tracing::debug!(connection_id = %session.connection_id(), request_id = id, "Rpc rate limit exceeded");
        session.fill_response(RpcResponse::failure(id, ProxyError::RateLimited.to_rpc_error()))?;
        Ok(Flow::Stop)
    }
}
