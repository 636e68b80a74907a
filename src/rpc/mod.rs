//! JSON-RPC envelopes and the session model threaded through the pipeline.
//!
//! # Data Flow
//! ```text
//! downstream frame (Frame)
//!     → RequestSession (raw bytes, decoded RpcRequest)
//!     → middleware chain
//!     → reply future filled by an upstream pump
//!     → RequestSession.response (set exactly once)
//!     → encoded RpcResponse → ConnectionSession downstream queue
//! ```
//!
//! # Design Decisions
//! - `ConnectionSession` is shared (`Arc`); its queues and signals are the
//!   synchronization boundary between tasks
//! - `RequestSession` is owned by one task at a time and passed `&mut` down
//!   the chain; it only holds a `Weak` back to its connection
//! - The correlation table is keyed by request id and dropped with the
//!   connection

pub mod envelope;
pub mod frame;
pub mod session;
pub mod signal;

pub use envelope::{codes, RpcError, RpcRequest, RpcResponse};
pub use frame::Frame;
pub use session::{ConnectionSession, LinkState, RequestSession};
pub use signal::DoneSignal;
