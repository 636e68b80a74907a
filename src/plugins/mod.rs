//! Pipeline plugins.
//!
//! # Chain Order
//! ```text
//! transport ──▶ statistic ──▶ rate_limit ──▶ before_cache ──▶ cache ──▶ disable
//!                                                                        │
//!                               upstream (ws_upstream | http_upstream) ◀── load_balance
//! ```
//!
//! Admission plugins (disable, cache, before_cache, rate_limit) are linear
//! [`Stage`](crate::middleware::Stage)s; the rest implement
//! [`Middleware`](crate::middleware::Middleware) directly.

pub mod before_cache;
pub mod cache;
pub mod disable;
pub mod http_upstream;
pub mod load_balance;
pub mod loader;
pub mod rate_limit;
pub mod statistic;
pub mod ws_upstream;

pub use before_cache::{BeforeCacheConfigItem, BeforeCacheStage};
pub use cache::{make_method_name_for_cache, CacheConfigItem, CacheStage};
pub use disable::DisableStage;
pub use http_upstream::{HttpUpstreamMiddleware, HttpUpstreamOptions};
pub use load_balance::{LoadBalanceMiddleware, UpstreamItem};
pub use loader::build_chain;
pub use rate_limit::RateLimitStage;
pub use statistic::{MemoryMetricStore, MetricStore, StatisticMiddleware};
pub use ws_upstream::{WsUpstreamMiddleware, WsUpstreamOptions};
