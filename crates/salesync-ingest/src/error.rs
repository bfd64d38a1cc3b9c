//! Error types for the ingestion core
//!
//! Only `TransientUpstream`, `UpstreamStatus`, `Transport` and `CircuitOpen`
//! originate from the network. Per-chunk failures are contained by the
//! processor and never abort sibling chunks.

use chrono::NaiveDate;
use thiserror::Error;
use uuid::Uuid;

use salesync_common::{CommonError, SourceId};

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Ingestion error taxonomy
#[derive(Error, Debug)]
pub enum IngestError {
    /// Retryable status or timeout that outlived the retry budget
    #[error("Transient upstream error from {host} after {attempts} attempt(s): {message}")]
    TransientUpstream {
        host: String,
        attempts: u32,
        status: Option<u16>,
        message: String,
    },

    /// Status the retry policy does not consider retryable (e.g. 400, 401, 404)
    #[error("Upstream {host} returned status {status}: {body}")]
    UpstreamStatus { host: String, status: u16, body: String },

    /// Non-retryable transport failure (invalid URL, TLS, body decoding)
    #[error("Transport error for {host}: {message}")]
    Transport { host: String, message: String },

    /// Breaker refused the call; no network I/O was attempted
    #[error("Circuit open for upstream {host}")]
    CircuitOpen { host: String },

    #[error("Invalid date range: {from} is after {to}")]
    InvalidRange { from: NaiveDate, to: NaiveDate },

    /// Stored content hash changed between read and write
    #[error("Write conflict for {key}: {message}")]
    WriteConflict { key: String, message: String },

    /// Rejected state-machine move for a job or chunk
    #[error("Invalid status transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("Failed to normalize {source_id} payload for {window}: {message}")]
    Normalize {
        source_id: SourceId,
        window: String,
        message: String,
    },

    #[error("No connector registered for source {0}")]
    ConnectorMissing(SourceId),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Corrupt stored state or a poisoned in-memory store
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl IngestError {
    /// Create a write conflict error
    pub fn write_conflict(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WriteConflict {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn invalid_transition(
        entity: impl ToString,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            entity: entity.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a normalization error
    pub fn normalize(source_id: SourceId, window: impl ToString, message: impl Into<String>) -> Self {
        Self::Normalize {
            source_id,
            window: window.to_string(),
            message: message.into(),
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether a later attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientUpstream { .. } | Self::CircuitOpen { .. } | Self::WriteConflict { .. }
        )
    }
}
