//! Resilient request execution
//!
//! One call to [`ResilientHttpClient::execute`] is one logical request:
//! breaker check, then per attempt a rate limiter token, the transport call
//! and, for retryable outcomes, a jittered exponential backoff. The breaker
//! only hears about the terminal outcome.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::HttpConfig;
use crate::error::{IngestError, Result};
use crate::resilience::UpstreamRegistry;

use super::{HttpRequest, HttpResponse, HttpTransport};

/// `min(base * 2^(attempt-1), max)` without jitter
pub fn exponential_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Delay before the next attempt.
///
/// A server-provided `Retry-After` wins over the computed delay, but is
/// still capped at `backoff_max`.
pub fn backoff_delay(config: &HttpConfig, attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(hint) = retry_after {
        return hint.min(config.backoff_max);
    }

    let delay = exponential_delay(config.backoff_base, config.backoff_max, attempt);
    let jitter = if config.jitter_min < config.jitter_max {
        rand::thread_rng().gen_range(config.jitter_min..config.jitter_max)
    } else {
        config.jitter_min
    };
    delay.mul_f64(jitter.max(0.0))
}

/// HTTP client wrapping a transport with breaker, limiter and retries
pub struct ResilientHttpClient {
    transport: Arc<dyn HttpTransport>,
    upstreams: Arc<UpstreamRegistry>,
    config: HttpConfig,
}

impl ResilientHttpClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        upstreams: Arc<UpstreamRegistry>,
        config: HttpConfig,
    ) -> Self {
        Self {
            transport,
            upstreams,
            config,
        }
    }

    pub fn upstreams(&self) -> &Arc<UpstreamRegistry> {
        &self.upstreams
    }

    /// Execute a request with full resilience wrapping.
    ///
    /// Fails with [`IngestError::CircuitOpen`] without touching the network
    /// when the host's breaker refuses the call.
    pub async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let host = request.host();
        let breaker = self.upstreams.breaker(&host);

        if !breaker.allow() {
            warn!(host = %host, url = %request.url, "Circuit open, request rejected");
            return Err(IngestError::CircuitOpen { host });
        }

        let limiter = self.upstreams.limiter(&host);
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let throttled = limiter.acquire(1).await;
            if !throttled.is_zero() {
                debug!(host = %host, throttled_ms = throttled.as_millis() as u64, "Request throttled");
            }

            let started = Instant::now();
            let outcome = self.transport.send(request).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let (status, message, retry_after) = match outcome {
                Ok(response) if response.is_success() => {
                    info!(
                        method = %request.method,
                        host = %host,
                        status = response.status,
                        elapsed_ms,
                        attempt,
                        "HTTP request succeeded"
                    );
                    breaker.on_success();
                    return Ok(response);
                },
                Ok(response) if self.config.is_retryable_status(response.status) => {
                    warn!(
                        method = %request.method,
                        host = %host,
                        status = response.status,
                        elapsed_ms,
                        attempt,
                        "HTTP request returned retryable status"
                    );
                    let retry_after = response.retry_after();
                    let message = format!("HTTP {}: {}", response.status, response.text());
                    (Some(response.status), message, retry_after)
                },
                Ok(response) => {
                    warn!(
                        method = %request.method,
                        host = %host,
                        status = response.status,
                        elapsed_ms,
                        attempt,
                        "HTTP request failed with non-retryable status"
                    );
                    breaker.on_failure();
                    return Err(IngestError::UpstreamStatus {
                        host,
                        status: response.status,
                        body: truncate(&response.text(), 512),
                    });
                },
                Err(error) if error.is_retryable() => {
                    warn!(
                        method = %request.method,
                        host = %host,
                        elapsed_ms,
                        attempt,
                        error = %error,
                        "HTTP transport error"
                    );
                    (None, error.message, None)
                },
                Err(error) => {
                    warn!(
                        method = %request.method,
                        host = %host,
                        elapsed_ms,
                        attempt,
                        error = %error,
                        "HTTP transport error (not retryable)"
                    );
                    breaker.on_failure();
                    return Err(IngestError::Transport {
                        host,
                        message: error.message,
                    });
                },
            };

            if attempt >= max_attempts {
                breaker.on_failure();
                return Err(IngestError::TransientUpstream {
                    host,
                    attempts: attempt,
                    status,
                    message: truncate(&message, 512),
                });
            }

            let delay = backoff_delay(&self.config, attempt, retry_after);
            debug!(host = %host, attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
            sleep(delay).await;
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
