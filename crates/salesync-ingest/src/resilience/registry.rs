//! Shared breaker and limiter instances keyed by upstream host

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{CircuitBreakerConfig, RateLimitConfig};
use crate::error::Result;

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::rate_limiter::RateLimiter;

/// Constructed once per process and handed to every client that talks to
/// the same hosts, so all chunk workers share one breaker and one bucket per
/// host.
#[derive(Debug)]
pub struct UpstreamRegistry {
    breaker_config: CircuitBreakerConfig,
    default_rate: RateLimitConfig,
    rate_overrides: HashMap<String, RateLimitConfig>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl UpstreamRegistry {
    pub fn new(breaker_config: CircuitBreakerConfig, default_rate: RateLimitConfig) -> Result<Self> {
        default_rate.validate()?;
        Ok(Self {
            breaker_config,
            default_rate,
            rate_overrides: HashMap::new(),
            breakers: Mutex::new(HashMap::new()),
            limiters: Mutex::new(HashMap::new()),
        })
    }

    /// Use a dedicated rate budget for one host
    pub fn with_rate_limit(mut self, host: impl Into<String>, config: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        self.rate_overrides.insert(host.into(), config);
        Ok(self)
    }

    pub fn breaker(&self, host: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(host, self.breaker_config)))
            .clone()
    }

    pub fn limiter(&self, host: &str) -> Arc<RateLimiter> {
        let config = self
            .rate_overrides
            .get(host)
            .copied()
            .unwrap_or(self.default_rate);

        let mut limiters = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
        limiters
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::from_validated(config)))
            .clone()
    }

    /// Current breaker state of every host seen so far, sorted by host
    pub fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut states: Vec<_> = breakers
            .iter()
            .map(|(host, breaker)| (host.clone(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
