//! Reusable backend connection pool.
//!
//! # Data Flow
//! ```text
//! get() ──▶ idle queue has a live conn? ──yes──▶ Pooled<C>
//!              │ no
//!              ▼
//!          reserve slot (CAS, accounted < max) ──ok──▶ factory.create() ──▶ Pooled<C>
//!              │ full
//!              ▼
//!          PoolError::Exhausted   (get_or_wait: park until a slot or conn frees)
//!
//! Pooled<C>::close() / drop ──▶ give_back ──▶ idle queue (or physical close when shrunk)
//! Pooled<C>::remove()       ──▶ slot released, caller owns the raw conn
//! ```
//!
//! # Design Decisions
//! - Accounting covers idle and borrowed connections; it never goes below zero
//!   and never above `max`
//! - Borrowed connections are wrapped so that closing the wrapper releases it
//!   back to the pool rather than destroying it
//! - Exhaustion and acquire timeouts are distinct error variants so callers can
//!   layer their own retry policy

pub mod conn;

use std::time::Duration;

use thiserror::Error;

pub use conn::{ConnFactory, ConnPool, Poolable, Pooled};

/// Errors surfaced by [`ConnPool`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("connection pool exhausted")]
    Exhausted,

    #[error("timed out after {0:?} waiting for a pooled connection")]
    AcquireTimeout(Duration),

    #[error("connection pool is closed")]
    Closed,

    #[error("failed to create connection: {0}")]
    Factory(String),
}
