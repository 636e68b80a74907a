//! Crate-wide error type.
//!
//! Every stage of the pipeline reports failures through [`ProxyError`]. A
//! failing stage never leaves the caller without an answer: the provider maps
//! the error onto a structured JSON-RPC error with [`ProxyError::to_rpc_error`].

use std::time::Duration;

use thiserror::Error;

use crate::pool::PoolError;
use crate::rpc::envelope::{codes, RpcError};

/// Errors raised by the middleware pipeline and its collaborators.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("rate limit exceeded")]
    RateLimited,

    #[error("rpc method {0} is disabled")]
    MethodDisabled(String),

    #[error("upstream connection closed")]
    UpstreamClosed,

    #[error("malformed upstream envelope: {0}")]
    MalformedEnvelope(String),

    #[error("upstream call timed out after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("response not produced within {0:?}")]
    ResponseTimeout(Duration),

    #[error("no upstream target available")]
    NoUpstreamTarget,

    #[error("upstream link already attached to connection")]
    UpstreamAlreadyAttached,

    #[error("no reply future registered for request {0}")]
    MissingReplyFuture(u64),

    #[error("response already set for request {0}")]
    ResponseAlreadySet(u64),

    #[error("request session has no decoded rpc request")]
    MissingRequest,

    #[error("connection is gone")]
    ConnectionGone,

    #[error("selector pool is empty")]
    EmptySelector,

    #[error("invalid weight {0} for upstream item")]
    InvalidWeight(i64),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("http upstream error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result alias used across the pipeline.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Reserved JSON-RPC error code for this failure.
    pub fn rpc_code(&self) -> i32 {
        match self {
            ProxyError::RateLimited => codes::RATE_LIMITED,
            ProxyError::MethodDisabled(_) => codes::DISABLED_METHOD,
            ProxyError::Pool(PoolError::Exhausted | PoolError::AcquireTimeout(_)) => {
                codes::UPSTREAM_BUSY
            }
            ProxyError::UpstreamClosed
            | ProxyError::MalformedEnvelope(_)
            | ProxyError::Pool(_)
            | ProxyError::Http(_) => codes::UPSTREAM_CONNECTION_CLOSED,
            ProxyError::UpstreamTimeout(_) => codes::UPSTREAM_TIMEOUT,
            ProxyError::ResponseTimeout(_) => codes::RESPONSE_TIMEOUT,
            _ => codes::INTERNAL_ERROR,
        }
    }

    /// Structured error object to send back to the caller.
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError::new(self.rpc_code(), self.to_string())
    }
}
