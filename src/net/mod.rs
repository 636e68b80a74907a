//! Downstream connection bookkeeping.
//!
//! # Data Flow
//! ```text
//! accepted socket / upgraded websocket
//!     → connection.rs (ConnectionId, ConnectionGuard)
//!     → ConnectionSession keyed by the same id
//!     → guard dropped on disconnect → active count decremented
//! ```
//!
//! # Design Decisions
//! - Ids are process-unique and cheap (atomic counter)
//! - Active count drives both the connections gauge and shutdown draining

pub mod connection;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
