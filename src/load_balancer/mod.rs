//! Weighted upstream selection.
//!
//! # Data Flow
//! ```text
//! add_node(weight, value)  ──▶ node list (static weight, dynamic current weight)
//! next()                   ──▶ every node: current += weight
//!                              winner = max current (first registered on ties)
//!                              winner.current -= total weight
//!                              ──▶ winner value
//! ```
//!
//! # Design Decisions
//! - Deterministic: no randomness, so a fixed call sequence yields a fixed order
//! - Over `k * total_weight` calls each node is picked exactly `k * weight` times
//! - The lock is held only for the duration of one selection

pub mod wrr;

pub use wrr::WeightedSelector;
