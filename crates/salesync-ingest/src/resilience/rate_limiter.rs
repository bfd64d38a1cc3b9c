//! Token bucket limiter for outbound calls to one upstream host
//!
//! Refill is computed lazily from elapsed time on every call. A caller that
//! finds the bucket short debits anyway (the balance goes negative) and sleeps
//! for `deficit / rate` while holding the lock, so concurrent callers form a
//! single FIFO queue per host and each waits its own share.

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::Result;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    rate_per_second: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Create a full bucket; fails on a non-positive rate or a capacity
    /// below one token
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    pub(crate) fn from_validated(config: RateLimitConfig) -> Self {
        Self {
            capacity: config.capacity,
            rate_per_second: config.rate_per_second,
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_second).min(self.capacity);
        state.last_refill = now;
    }

    /// Wait until `n` tokens are available, then debit them.
    ///
    /// Never fails. Returns how long the caller was delayed by the bucket
    /// itself (time spent queued behind other callers is not included).
    pub async fn acquire(&self, n: u32) -> Duration {
        let needed = f64::from(n);
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());

        state.tokens -= needed;
        if state.tokens >= 0.0 {
            return Duration::ZERO;
        }

        let wait = Duration::try_from_secs_f64(-state.tokens / self.rate_per_second)
            .unwrap_or(Duration::MAX);
        debug!(
            wait_ms = wait.as_millis() as u64,
            requested = n,
            "Rate limiter delaying caller"
        );
        sleep(wait).await;
        wait
    }

    /// Debit `n` tokens only if they are available right now
    pub async fn try_acquire(&self, n: u32) -> bool {
        let needed = f64::from(n);
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());

        if state.tokens >= needed {
            state.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Tokens currently in the bucket (negative while callers are queued)
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn rate_per_second(&self) -> f64 {
        self.rate_per_second
    }
}
