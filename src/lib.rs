//! JSON-RPC reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                         ┌──────────────────────────────────────────────────────┐
//!                         │                   JSONRPC PROXY                      │
//!                         │                                                      │
//!   WebSocket / HTTP      │  ┌──────────┐    ┌──────────────────────────────┐    │
//!   ──────────────────────┼─▶│   http   │───▶│      middleware chain        │    │
//!                         │  │ provider │    │ statistic → rate_limit →     │    │
//!                         │  └────┬─────┘    │ before_cache → cache →       │    │
//!                         │       │          │ disable → load_balance →     │    │
//!                         │       │          │ upstream relay               │    │
//!                         │       │          └──────────────┬───────────────┘    │
//!                         │       ▼                         ▼                    │    Upstream
//!                         │  ┌──────────┐           ┌──────────────┐             │    JSON-RPC
//!   ◀─────────────────────┼──│ session  │◀──reply───│ pool + pumps │◀────────────┼──── node
//!                         │  │  (rpc)   │           └──────────────┘             │
//!                         │  └──────────┘                                        │
//!                         │                                                      │
//!                         │  config · observability · lifecycle · security       │
//!                         └──────────────────────────────────────────────────────┘
//! ```

// Core
pub mod error;
pub mod middleware;
pub mod rpc;

// Plugins and their building blocks
pub mod load_balancer;
pub mod plugins;
pub mod pool;
pub mod security;

// Front end
pub mod http;
pub mod net;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;

pub use config::schema::ProxyConfig;
pub use error::{ProxyError, ProxyResult};
pub use http::ProxyServer;
pub use lifecycle::Shutdown;
pub use middleware::{Middleware, MiddlewareChain};
