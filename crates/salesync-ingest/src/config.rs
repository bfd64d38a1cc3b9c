//! Configuration management

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use salesync_common::SourceId;

use crate::error::{IngestError, Result};

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL (file-backed SQLite, created when missing).
pub const DEFAULT_DATABASE_URL: &str = "sqlite://salesync.db?mode=rwc";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

// ============================================================================
// HTTP Resilience Constants
// ============================================================================

/// Default per-request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default number of attempts per logical request (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Default base backoff in milliseconds.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;

/// Default backoff ceiling in milliseconds.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Default lower jitter multiplier.
pub const DEFAULT_JITTER_MIN: f64 = 0.7;

/// Default upper jitter multiplier.
pub const DEFAULT_JITTER_MAX: f64 = 1.3;

/// Statuses retried by default.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Default consecutive failures before the breaker opens.
pub const DEFAULT_FAIL_THRESHOLD: u32 = 5;

/// Default open-state cooldown in seconds.
pub const DEFAULT_RESET_TIMEOUT_SECS: u64 = 60;

/// Default refill rate per upstream host (tokens per second).
pub const DEFAULT_RATE_PER_SECOND: f64 = 1.0;

/// Default bucket capacity per upstream host.
pub const DEFAULT_RATE_CAPACITY: f64 = 3.0;

// ============================================================================
// Pipeline Constants
// ============================================================================

/// Default chunk cache TTL in seconds (24 hours).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 86_400;

/// Default concurrent chunk workers per source stage.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default pause after each chunk task in milliseconds.
pub const DEFAULT_INTER_CHUNK_DELAY_MS: u64 = 250;

/// Default age after which a `Processing` chunk is considered abandoned.
pub const DEFAULT_LIVENESS_TIMEOUT_SECS: u64 = 600;

/// Default poll interval while a job waits on chunks claimed elsewhere.
pub const DEFAULT_SETTLE_INTERVAL_MS: u64 = 1_000;

/// Default minimum share of successful chunks for a source to count as ingested.
pub const DEFAULT_MIN_SUCCESS_RATIO: f64 = 0.0;

/// Default job retention in days.
pub const DEFAULT_JOB_RETENTION_DAYS: i64 = 7;

/// Largest span any upstream accepts in one query.
pub const DEFAULT_MAX_SPAN_DAYS: u32 = 31;

/// Default Wildberries window length in days.
pub const DEFAULT_WILDBERRIES_WINDOW_DAYS: u32 = 31;

/// Environment variable prefix for ingestion settings.
pub const ENV_PREFIX: &str = "SALESYNC_";

/// Full ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub processor: ProcessorConfig,
    pub retention: RetentionConfig,
    pub windows: BTreeMap<SourceId, WindowPolicy>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Retry and timeout settings for [`crate::http::ResilientHttpClient`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub jitter_min: f64,
    pub jitter_max: f64,
    pub retryable_statuses: Vec<u16>,
}

impl HttpConfig {
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub fail_threshold: u32,
    pub reset_timeout: Duration,
}

/// Token bucket settings for one upstream host
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub rate_per_second: f64,
    pub capacity: f64,
}

impl RateLimitConfig {
    /// Rate must be positive and finite, capacity at least one token
    pub fn validate(&self) -> Result<()> {
        if !(self.rate_per_second.is_finite() && self.rate_per_second > 0.0) {
            return Err(IngestError::config(format!(
                "Rate limit rate_per_second must be positive, got {}",
                self.rate_per_second
            )));
        }
        if !(self.capacity.is_finite() && self.capacity >= 1.0) {
            return Err(IngestError::config(format!(
                "Rate limit capacity must be at least 1, got {}",
                self.capacity
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheConfig {
    pub default_ttl: Duration,
}

/// Staged processor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub worker_count: usize,
    pub inter_chunk_delay: Duration,
    pub liveness_timeout: Duration,
    /// How often a job re-checks chunks still `Processing` before aggregating
    pub settle_interval: Duration,
    pub failure_policy: SourceFailurePolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub job_retention_days: i64,
}

/// Decides when a source counts as failed for the whole job.
///
/// A source with zero successful chunks always fails. With a positive
/// `min_success_ratio`, a source whose share of successful chunks is below
/// the ratio fails as well.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceFailurePolicy {
    pub min_success_ratio: f64,
}

impl SourceFailurePolicy {
    pub fn is_failed(&self, succeeded: usize, total: usize) -> bool {
        if total == 0 {
            return false;
        }
        if succeeded == 0 {
            return true;
        }
        (succeeded as f64 / total as f64) < self.min_success_ratio
    }
}

impl Default for SourceFailurePolicy {
    fn default() -> Self {
        Self {
            min_success_ratio: DEFAULT_MIN_SUCCESS_RATIO,
        }
    }
}

/// How a source's date range is cut into windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowSize {
    /// Fixed number of days per window
    FixedDays { days: u32 },
    /// One calendar month per window (partial at the range edges)
    CalendarMonth,
}

impl FromStr for WindowSize {
    type Err = IngestError;

    /// Accepts `month`, `30`, or `30d`
    fn from_str(s: &str) -> Result<Self> {
        let value = s.trim().to_lowercase();
        if value == "month" || value == "calendar_month" {
            return Ok(WindowSize::CalendarMonth);
        }
        let digits = value.strip_suffix('d').unwrap_or(&value);
        match digits.parse::<u32>() {
            Ok(days) if days > 0 => Ok(WindowSize::FixedDays { days }),
            _ => Err(IngestError::config(format!("Invalid window size: {}", s))),
        }
    }
}

/// Per-source windowing rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowPolicy {
    pub size: WindowSize,
    /// Upper bound on any window, whatever `size` says
    pub max_span_days: u32,
}

impl WindowPolicy {
    pub fn fixed_days(days: u32) -> Self {
        Self {
            size: WindowSize::FixedDays { days },
            max_span_days: DEFAULT_MAX_SPAN_DAYS,
        }
    }

    pub fn calendar_month() -> Self {
        Self {
            size: WindowSize::CalendarMonth,
            max_span_days: DEFAULT_MAX_SPAN_DAYS,
        }
    }

    /// Default policy for a source
    pub fn default_for(source: SourceId) -> Self {
        match source {
            SourceId::Wildberries => Self::fixed_days(DEFAULT_WILDBERRIES_WINDOW_DAYS),
            SourceId::Ozon => Self::calendar_month(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            jitter_min: DEFAULT_JITTER_MIN,
            jitter_max: DEFAULT_JITTER_MAX,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            fail_threshold: DEFAULT_FAIL_THRESHOLD,
            reset_timeout: Duration::from_secs(DEFAULT_RESET_TIMEOUT_SECS),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate_per_second: DEFAULT_RATE_PER_SECOND,
            capacity: DEFAULT_RATE_CAPACITY,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            inter_chunk_delay: Duration::from_millis(DEFAULT_INTER_CHUNK_DELAY_MS),
            liveness_timeout: Duration::from_secs(DEFAULT_LIVENESS_TIMEOUT_SECS),
            settle_interval: Duration::from_millis(DEFAULT_SETTLE_INTERVAL_MS),
            failure_policy: SourceFailurePolicy::default(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            job_retention_days: DEFAULT_JOB_RETENTION_DAYS,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            http: HttpConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            processor: ProcessorConfig::default(),
            retention: RetentionConfig::default(),
            windows: SourceId::ALL
                .iter()
                .map(|source| (*source, WindowPolicy::default_for(*source)))
                .collect(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env_var(name).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

impl IngestConfig {
    /// Load configuration from `.env`, `SALESYNC_*` variables and defaults
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = IngestConfig::default();

        let retryable_statuses = match env_var("HTTP_RETRYABLE_STATUSES") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<u16>()
                        .map_err(|_| IngestError::config(format!("Invalid HTTP status: {}", s)))
                })
                .collect::<Result<Vec<_>>>()?,
            None => defaults.http.retryable_statuses.clone(),
        };

        let mut windows = BTreeMap::new();
        for source in SourceId::ALL {
            let key = source.as_str().to_uppercase();
            let mut policy = WindowPolicy::default_for(source);
            if let Some(size) = env_var(&format!("{}_WINDOW", key)) {
                policy.size = size.parse()?;
            }
            policy.max_span_days = env_or(&format!("{}_MAX_SPAN_DAYS", key), policy.max_span_days);
            windows.insert(source, policy);
        }

        let config = IngestConfig {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .ok()
                    .or_else(|| env_var("DATABASE_URL"))
                    .unwrap_or(defaults.database.url),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                ),
            },
            http: HttpConfig {
                request_timeout: Duration::from_secs(env_or(
                    "HTTP_TIMEOUT_SECS",
                    DEFAULT_REQUEST_TIMEOUT_SECS,
                )),
                max_attempts: env_or("HTTP_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
                backoff_base: Duration::from_millis(env_or(
                    "HTTP_BACKOFF_BASE_MS",
                    DEFAULT_BACKOFF_BASE_MS,
                )),
                backoff_max: Duration::from_millis(env_or(
                    "HTTP_BACKOFF_MAX_MS",
                    DEFAULT_BACKOFF_MAX_MS,
                )),
                jitter_min: env_or("HTTP_JITTER_MIN", DEFAULT_JITTER_MIN),
                jitter_max: env_or("HTTP_JITTER_MAX", DEFAULT_JITTER_MAX),
                retryable_statuses,
            },
            circuit_breaker: CircuitBreakerConfig {
                fail_threshold: env_or("BREAKER_FAIL_THRESHOLD", DEFAULT_FAIL_THRESHOLD),
                reset_timeout: Duration::from_secs(env_or(
                    "BREAKER_RESET_TIMEOUT_SECS",
                    DEFAULT_RESET_TIMEOUT_SECS,
                )),
            },
            rate_limit: RateLimitConfig {
                rate_per_second: env_or("RATE_LIMIT_PER_SECOND", DEFAULT_RATE_PER_SECOND),
                capacity: env_or("RATE_LIMIT_CAPACITY", DEFAULT_RATE_CAPACITY),
            },
            cache: CacheConfig {
                default_ttl: Duration::from_secs(env_or("CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS)),
            },
            processor: ProcessorConfig {
                worker_count: env_or("WORKER_COUNT", DEFAULT_WORKER_COUNT),
                inter_chunk_delay: Duration::from_millis(env_or(
                    "INTER_CHUNK_DELAY_MS",
                    DEFAULT_INTER_CHUNK_DELAY_MS,
                )),
                liveness_timeout: Duration::from_secs(env_or(
                    "LIVENESS_TIMEOUT_SECS",
                    DEFAULT_LIVENESS_TIMEOUT_SECS,
                )),
                settle_interval: Duration::from_millis(env_or(
                    "SETTLE_INTERVAL_MS",
                    DEFAULT_SETTLE_INTERVAL_MS,
                )),
                failure_policy: SourceFailurePolicy {
                    min_success_ratio: env_or("MIN_SUCCESS_RATIO", DEFAULT_MIN_SUCCESS_RATIO),
                },
            },
            retention: RetentionConfig {
                job_retention_days: env_or("JOB_RETENTION_DAYS", DEFAULT_JOB_RETENTION_DAYS),
            },
            windows,
        };

        config.validate()?;

        Ok(config)
    }

    /// Window policy for a source, falling back to its default
    pub fn window_policy(&self, source: SourceId) -> WindowPolicy {
        self.windows
            .get(&source)
            .copied()
            .unwrap_or_else(|| WindowPolicy::default_for(source))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(IngestError::config("Database URL cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(IngestError::config("Database max_connections must be greater than 0"));
        }

        if self.http.max_attempts == 0 {
            return Err(IngestError::config("HTTP max_attempts must be at least 1"));
        }

        if self.http.backoff_base > self.http.backoff_max {
            return Err(IngestError::config("HTTP backoff_base cannot exceed backoff_max"));
        }

        if !(self.http.jitter_min > 0.0 && self.http.jitter_min <= self.http.jitter_max) {
            return Err(IngestError::config(
                "HTTP jitter bounds must satisfy 0 < jitter_min <= jitter_max",
            ));
        }

        if self.circuit_breaker.fail_threshold == 0 {
            return Err(IngestError::config("Breaker fail_threshold must be greater than 0"));
        }

        self.rate_limit.validate()?;

        if self.processor.worker_count == 0 {
            return Err(IngestError::config("Processor worker_count must be greater than 0"));
        }

        if self.processor.settle_interval.is_zero() {
            return Err(IngestError::config("Processor settle_interval must be greater than 0"));
        }

        let ratio = self.processor.failure_policy.min_success_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(IngestError::config("min_success_ratio must be within [0, 1]"));
        }

        if self.retention.job_retention_days <= 0 {
            return Err(IngestError::config("Job retention must be at least one day"));
        }

        for (source, policy) in &self.windows {
            if policy.max_span_days == 0 {
                return Err(IngestError::config(format!(
                    "max_span_days for {} must be greater than 0",
                    source
                )));
            }
            if let WindowSize::FixedDays { days: 0 } = policy.size {
                return Err(IngestError::config(format!(
                    "Window length for {} must be greater than 0",
                    source
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.default_ttl, Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.retention.job_retention_days, 7);
        assert_eq!(
            config.window_policy(SourceId::Wildberries).size,
            WindowSize::FixedDays { days: 31 }
        );
        assert_eq!(config.window_policy(SourceId::Ozon).size, WindowSize::CalendarMonth);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = IngestConfig::default();
        config.http.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = IngestConfig::default();
        config.http.jitter_min = 1.5;
        assert!(config.validate().is_err());

        let mut config = IngestConfig::default();
        config.processor.failure_policy.min_success_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = IngestConfig::default();
        config.rate_limit.rate_per_second = 0.0;
        assert!(config.validate().is_err());

        let mut config = IngestConfig::default();
        config.processor.settle_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_window_size_parsing() {
        assert_eq!("month".parse::<WindowSize>().unwrap(), WindowSize::CalendarMonth);
        assert_eq!("14d".parse::<WindowSize>().unwrap(), WindowSize::FixedDays { days: 14 });
        assert_eq!("7".parse::<WindowSize>().unwrap(), WindowSize::FixedDays { days: 7 });
        assert!("0".parse::<WindowSize>().is_err());
        assert!("weekly".parse::<WindowSize>().is_err());
    }

    #[test]
    fn test_failure_policy() {
        let zero_rule = SourceFailurePolicy::default();
        assert!(zero_rule.is_failed(0, 3));
        assert!(!zero_rule.is_failed(1, 3));
        assert!(!zero_rule.is_failed(0, 0));

        let strict = SourceFailurePolicy {
            min_success_ratio: 0.5,
        };
        assert!(strict.is_failed(1, 3));
        assert!(!strict.is_failed(2, 3));
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("SALESYNC_WORKER_COUNT", "6");
        std::env::set_var("SALESYNC_OZON_WINDOW", "10d");
        std::env::set_var("SALESYNC_HTTP_RETRYABLE_STATUSES", "429, 503");

        let config = IngestConfig::from_env().unwrap();
        assert_eq!(config.processor.worker_count, 6);
        assert_eq!(
            config.window_policy(SourceId::Ozon).size,
            WindowSize::FixedDays { days: 10 }
        );
        assert_eq!(config.http.retryable_statuses, vec![429, 503]);

        std::env::remove_var("SALESYNC_WORKER_COUNT");
        std::env::remove_var("SALESYNC_OZON_WINDOW");
        std::env::remove_var("SALESYNC_HTTP_RETRYABLE_STATUSES");
    }
}
