//! Lock-free token bucket rate limiter.
//!
//! The mutable `{allowance, last_check}` pair lives behind an [`ArcSwap`] and is
//! replaced as a unit with compare-and-swap. A losing writer re-reads and
//! retries; nobody blocks.
//!
//! Allowance is measured in nanosecond units: one token costs `window` worth of
//! nanoseconds, and the bucket accrues `rate` units per elapsed nanosecond up
//! to `rate * window`. That product overflows `u64` for large rates over long
//! windows, so allowance is held in `u128`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;

/// Source of monotonic time, injectable for tests.
pub trait Clock: Send + Sync {
    /// Nanoseconds since an arbitrary fixed origin.
    fn now_nanos(&self) -> u64;
}

/// Wall clock backed by [`Instant`].
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Admission primitive shared by the rate limit plugin.
pub trait Limiter: Send + Sync {
    /// Try to consume one unit.
    fn take(&self) -> bool;

    /// Refund one unit, capped at the bucket maximum.
    fn undo(&self);

    /// Change the rate without resetting the accumulated allowance.
    fn update_rate(&self, rate: u64, window: Duration);
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    allowance: u128,
    last_check: u64,
}

/// Token bucket granting `rate` units per `window`.
pub struct TokenBucketLimiter {
    state: ArcSwap<BucketState>,
    rate: AtomicU64,
    /// Window length in nanoseconds, the cost of one unit.
    unit: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("rate", &self.rate.load(Ordering::Relaxed))
            .field("unit", &self.unit.load(Ordering::Relaxed))
            .field("state", &**self.state.load())
            .finish()
    }
}

fn normalize(rate: u64, window: Duration) -> (u64, u64) {
    let rate = rate.max(1);
    let unit = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX);
    let unit = if unit < 1 { Duration::from_secs(1).as_nanos() as u64 } else { unit };
    (rate, unit)
}

impl TokenBucketLimiter {
    /// Create a full bucket. A rate below 1 becomes 1, a zero window becomes one second.
    pub fn new(rate: u64, window: Duration) -> Self {
        Self::with_clock(rate, window, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(rate: u64, window: Duration, clock: Arc<dyn Clock>) -> Self {
        let (rate, unit) = normalize(rate, window);
        let now = clock.now_nanos();
        Self {
            state: ArcSwap::from_pointee(BucketState {
                allowance: u128::from(rate) * u128::from(unit),
                last_check: now,
            }),
            rate: AtomicU64::new(rate),
            unit: AtomicU64::new(unit),
            clock,
        }
    }

    fn max(&self) -> u128 {
        u128::from(self.rate.load(Ordering::Acquire)) * u128::from(self.unit.load(Ordering::Acquire))
    }

    /// Read, compute, commit-if-unchanged. `step` returns `None` to abort
    /// without touching the state.
    fn commit(&self, step: impl Fn(BucketState, u64, u64, u64) -> Option<BucketState>) -> bool {
        loop {
            let current = self.state.load_full();
            let now = self.clock.now_nanos();
            let rate = self.rate.load(Ordering::Acquire);
            let unit = self.unit.load(Ordering::Acquire);

            let Some(next) = step(*current, now, rate, unit) else {
                return false;
            };

            let prev = self.state.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&prev, &current) {
                return true;
            }
        }
    }

    /// Units currently available, after accounting for elapsed time.
    pub fn available(&self) -> u64 {
        let state = self.state.load();
        let unit = u128::from(self.unit.load(Ordering::Acquire));
        let passed = self.clock.now_nanos().saturating_sub(state.last_check);
        let accrued = u128::from(passed) * u128::from(self.rate.load(Ordering::Acquire));
        let units = state.allowance.saturating_add(accrued).min(self.max()) / unit;
        u64::try_from(units).unwrap_or(u64::MAX)
    }
}

impl Limiter for TokenBucketLimiter {
    fn take(&self) -> bool {
        let max = self.max();
        self.commit(|state, now, rate, unit| {
            let unit = u128::from(unit);
            let passed = u128::from(now.saturating_sub(state.last_check));
            let allowance = state
                .allowance
                .saturating_add(passed * u128::from(rate))
                .min(max);
            if allowance < unit {
                return None;
            }
            Some(BucketState {
                allowance: allowance - unit,
                last_check: now,
            })
        })
    }

    fn undo(&self) {
        let max = self.max();
        self.commit(|state, _now, _rate, unit| {
            Some(BucketState {
                allowance: state.allowance.saturating_add(u128::from(unit)).min(max),
                last_check: state.last_check,
            })
        });
    }

    fn update_rate(&self, rate: u64, window: Duration) {
        let (rate, unit) = normalize(rate, window);
        self.rate.store(rate, Ordering::Release);
        self.unit.store(unit, Ordering::Release);
        tracing::debug!(rate, window_nanos = unit, "Token bucket rate updated");
    }
}
