//! Upstream protection: token bucket rate limiting and circuit breaking
//!
//! Both are transient and process-local. [`UpstreamRegistry`] hands out one
//! shared instance of each per upstream host.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod registry;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use rate_limiter::RateLimiter;
pub use registry::UpstreamRegistry;
