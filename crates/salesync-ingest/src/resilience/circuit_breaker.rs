//! Per-host circuit breaker
//!
//! State is process-local and starts `Closed`. In `HalfOpen` exactly one
//! trial caller is let through; its outcome decides between `Closed` and a
//! fresh `Open` period.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker shared by every worker calling one upstream host
#[derive(Debug)]
pub struct CircuitBreaker {
    host: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(host: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            host: host.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a call may proceed now
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|opened| opened.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(host = %self.host, "Circuit half-open, admitting trial request");
                    true
                } else {
                    false
                }
            },
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            },
        }
    }

    /// Record a successful call.
    ///
    /// Ignored while `Open`: a request admitted before the breaker opened
    /// may still finish afterwards, and only the half-open trial may close it.
    pub fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Open => {
                debug!(host = %self.host, "Late success while open, ignored");
                return;
            },
            CircuitState::HalfOpen => {
                info!(host = %self.host, "Trial request succeeded, circuit closed");
            },
            CircuitState::Closed => {},
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.fail_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        host = %self.host,
                        failures = inner.failure_count,
                        reset_timeout_secs = self.config.reset_timeout.as_secs(),
                        "Circuit opened"
                    );
                }
            },
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                warn!(host = %self.host, "Trial request failed, circuit re-opened");
            },
            CircuitState::Open => {},
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}
