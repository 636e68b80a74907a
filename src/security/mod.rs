//! Admission primitives.
//!
//! # Data Flow
//! ```text
//! new connection / inbound call
//!     → plugins::rate_limit (RateLimitStage)
//!     → rate_limit.rs (Limiter::take on a shared token bucket)
//!     → admitted, or answered with a rate-limited error
//! ```
//!
//! # Design Decisions
//! - Limiters are lock-free; a rejected take has no side effects
//! - Time is injected through [`rate_limit::Clock`] so tests run without sleeping

pub mod rate_limit;

pub use rate_limit::{Clock, Limiter, MonotonicClock, TokenBucketLimiter};
