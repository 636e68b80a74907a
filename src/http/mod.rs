//! HTTP and WebSocket providers.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum router, tracing, body limit)
//!     → GET  → websocket.rs (persistent connection session, many calls)
//!     → POST → server.rs http_handler (one-shot connection session, one call)
//!     → MiddlewareChain
//! ```

pub mod server;
pub mod websocket;

pub use server::{AppState, ProxyServer};
pub use websocket::serve_connection;
