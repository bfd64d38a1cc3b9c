//! Core types for the chunked ingestion pipeline

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use salesync_common::checksum::short_digest;
use salesync_common::{DateWindow, SourceId};

use crate::error::IngestError;

use super::results::{ChunkResult, FinalReport, FinalResult};

/// Length of the parameter digest embedded in cache keys
const PARAMS_HASH_LEN: usize = 16;

/// Identity of one unit of ingestion work, independent of any job.
///
/// Two jobs asking the same source for the same window with the same extra
/// parameters share a key, which is what lets a resumed or repeated job hit
/// the chunk cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    pub source: SourceId,
    pub window: DateWindow,
    pub params_hash: String,
}

impl ChunkKey {
    pub fn new(source: SourceId, window: DateWindow, params: &BTreeMap<String, String>) -> Self {
        let pairs: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        Self {
            source,
            window,
            params_hash: short_digest(pairs.iter().map(String::as_str), PARAMS_HASH_LEN),
        }
    }

    /// Storage key, `{source}:{from}:{to}:{params_hash}`.
    ///
    /// The readable prefix is what `invalidate` patterns such as
    /// `ozon:2024-03-*` match against.
    pub fn cache_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.source, self.window.from, self.window.to, self.params_hash
        )
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

/// `{job_id}:{source}:{index}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(job_id: Uuid, source: SourceId, index: u32) -> Self {
        Self(format!("{}:{}:{}", job_id, source, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ChunkId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job-level state, driven only by the staged processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "source", rename_all = "snake_case")]
pub enum JobStatus {
    Initialized,
    StageRunning(SourceId),
    Aggregating,
    Completed,
    Failed,
    /// Stopped between chunks on request; can be resumed
    Cancelled,
}

impl JobStatus {
    /// Completed and Failed jobs never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether a crash-recovery pass should pick the job up again
    pub fn is_unfinished(&self) -> bool {
        matches!(
            self,
            JobStatus::Initialized | JobStatus::StageRunning(_) | JobStatus::Aggregating
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next != JobStatus::Initialized
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Initialized => f.write_str("initialized"),
            JobStatus::StageRunning(source) => write!(f, "stage_running:{}", source),
            JobStatus::Aggregating => f.write_str("aggregating"),
            JobStatus::Completed => f.write_str("completed"),
            JobStatus::Failed => f.write_str("failed"),
            JobStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(source) = s.strip_prefix("stage_running:") {
            return Ok(JobStatus::StageRunning(source.parse()?));
        }
        match s {
            "initialized" => Ok(JobStatus::Initialized),
            "aggregating" => Ok(JobStatus::Aggregating),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(IngestError::storage(format!("Unknown job status: {}", other))),
        }
    }
}

/// Chunk status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    /// Satisfied from the chunk cache without a network call
    Cached,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Processing => "processing",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
            ChunkStatus::Cached => "cached",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChunkStatus::Completed | ChunkStatus::Failed | ChunkStatus::Cached
        )
    }

    /// Completed or Cached
    pub fn is_success(&self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::Cached)
    }

    /// `Processing -> Pending` is deliberately absent: only the stale-chunk
    /// reset performs it.
    pub fn can_transition_to(&self, next: ChunkStatus) -> bool {
        matches!(
            (self, next),
            (ChunkStatus::Pending, ChunkStatus::Processing)
                | (ChunkStatus::Pending, ChunkStatus::Cached)
                | (ChunkStatus::Processing, ChunkStatus::Completed)
                | (ChunkStatus::Processing, ChunkStatus::Failed)
        )
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChunkStatus::Pending),
            "processing" => Ok(ChunkStatus::Processing),
            "completed" => Ok(ChunkStatus::Completed),
            "failed" => Ok(ChunkStatus::Failed),
            "cached" => Ok(ChunkStatus::Cached),
            other => Err(IngestError::storage(format!("Unknown chunk status: {}", other))),
        }
    }
}

/// Ingestion job (maps to ingestion_jobs table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub period: DateWindow,
    /// Ingestion order
    pub sources: Vec<SourceId>,
    pub status: JobStatus,
    pub notify_target: Option<String>,
    pub chunk_counts: BTreeMap<SourceId, u32>,
    pub final_result: Option<FinalReport>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Result view of the job as a poller sees it
    pub fn final_result(&self) -> FinalResult {
        match self.status {
            JobStatus::Completed => match &self.final_result {
                Some(report) => FinalResult::Completed {
                    report: report.clone(),
                },
                None => FinalResult::Failed {
                    report: None,
                    error: Some("job completed without a report".to_string()),
                },
            },
            JobStatus::Failed => FinalResult::Failed {
                report: self.final_result.clone(),
                error: self.error.clone(),
            },
            status => FinalResult::Pending { status },
        }
    }
}

/// Parameters for creating a job record
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: Uuid,
    pub period: DateWindow,
    pub sources: Vec<SourceId>,
    pub notify_target: Option<String>,
}

/// Per-chunk progress (maps to ingestion_chunks table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkProgress {
    pub chunk_id: ChunkId,
    pub job_id: Uuid,
    pub source: SourceId,
    pub index: u32,
    pub window: DateWindow,
    pub status: ChunkStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Cache key of the payload this chunk's result was built from
    pub result_ref: Option<String>,
    pub result: Option<ChunkResult>,
}

impl ChunkProgress {
    /// Apply one transition in place, stamping start and finish times
    pub fn apply(&mut self, update: ChunkUpdate, now: DateTime<Utc>) -> Result<(), IngestError> {
        if !self.status.can_transition_to(update.status) {
            return Err(IngestError::invalid_transition(
                &self.chunk_id,
                self.status,
                update.status,
            ));
        }

        match update.status {
            ChunkStatus::Processing => {
                self.started_at = Some(now);
                self.completed_at = None;
            },
            ChunkStatus::Cached => {
                self.started_at.get_or_insert(now);
                self.completed_at = Some(now);
            },
            _ => self.completed_at = Some(now),
        }

        self.status = update.status;
        if update.result.is_some() {
            self.result = update.result;
        }
        if update.error.is_some() {
            self.error_message = update.error;
        }
        if update.result_ref.is_some() {
            self.result_ref = update.result_ref;
        }
        Ok(())
    }

    /// Stale-chunk reset, the one way back to `Pending`
    pub fn reset_to_pending(&mut self) {
        self.status = ChunkStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
    }
}

/// One status transition for a chunk
#[derive(Debug, Clone)]
pub struct ChunkUpdate {
    pub status: ChunkStatus,
    pub result: Option<ChunkResult>,
    pub error: Option<String>,
    pub result_ref: Option<String>,
}

impl ChunkUpdate {
    pub fn processing() -> Self {
        Self {
            status: ChunkStatus::Processing,
            result: None,
            error: None,
            result_ref: None,
        }
    }

    pub fn completed(result: ChunkResult, result_ref: impl Into<String>) -> Self {
        Self {
            status: ChunkStatus::Completed,
            result: Some(result),
            error: None,
            result_ref: Some(result_ref.into()),
        }
    }

    pub fn cached(result: ChunkResult, result_ref: impl Into<String>) -> Self {
        Self {
            status: ChunkStatus::Cached,
            result: Some(result),
            error: None,
            result_ref: Some(result_ref.into()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ChunkStatus::Failed,
            result: None,
            error: Some(error.into()),
            result_ref: None,
        }
    }
}

/// Key of one normalized business record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub date: NaiveDate,
    pub source: SourceId,
    /// Upstream-specific identity, e.g. a sale id or operation id
    pub business_key: String,
}

impl EntityKey {
    pub fn new(date: NaiveDate, source: SourceId, business_key: impl Into<String>) -> Self {
        Self {
            date,
            source,
            business_key: business_key.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.date, self.source, self.business_key)
    }
}

/// Output of a source normalizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub key: EntityKey,
    pub fields: Value,
}

/// Stored record with its content hash (maps to content_records table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub key: EntityKey,
    pub fields: Value,
    pub content_hash: String,
    pub updated_at: DateTime<Utc>,
}

/// Cached raw payload for one chunk key (maps to chunk_cache table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedChunk {
    pub cache_key: String,
    pub source: SourceId,
    pub window: DateWindow,
    pub payload: Value,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedChunk {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn window() -> DateWindow {
        DateWindow::parse("2024-01-01", "2024-01-31").unwrap()
    }

    #[test]
    fn test_chunk_key_is_deterministic() {
        let mut params = BTreeMap::new();
        params.insert("flag".to_string(), "0".to_string());

        let a = ChunkKey::new(SourceId::Wildberries, window(), &params);
        let b = ChunkKey::new(SourceId::Wildberries, window(), &params);
        assert_eq!(a.cache_key(), b.cache_key());
        assert!(a.cache_key().starts_with("wildberries:2024-01-01:2024-01-31:"));

        params.insert("flag".to_string(), "1".to_string());
        let c = ChunkKey::new(SourceId::Wildberries, window(), &params);
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn test_job_status_string_round_trip() {
        let statuses = [
            JobStatus::Initialized,
            JobStatus::StageRunning(SourceId::Ozon),
            JobStatus::Aggregating,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ];
        for status in statuses {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!(
            JobStatus::StageRunning(SourceId::Wildberries).to_string(),
            "stage_running:wildberries"
        );
        assert!("stage_running:amazon".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_chunk_transitions() {
        use ChunkStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cached));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Cached.can_transition_to(Completed));
    }

    #[test]
    fn test_job_transitions() {
        let running = JobStatus::StageRunning(SourceId::Wildberries);
        assert!(JobStatus::Initialized.can_transition_to(running));
        assert!(running.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Cancelled.can_transition_to(running));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!running.can_transition_to(JobStatus::Initialized));
    }

    #[test]
    fn test_apply_stamps_times_and_rejects_bad_moves() {
        let job_id = Uuid::new_v4();
        let mut chunk = ChunkProgress {
            chunk_id: ChunkId::new(job_id, SourceId::Wildberries, 0),
            job_id,
            source: SourceId::Wildberries,
            index: 0,
            window: window(),
            status: ChunkStatus::Pending,
            started_at: None,
            completed_at: None,
            error_message: None,
            result_ref: None,
            result: None,
        };

        let now = Utc::now();
        assert!(chunk.apply(ChunkUpdate::failed("nope"), now).is_err());

        chunk.apply(ChunkUpdate::processing(), now).unwrap();
        assert_eq!(chunk.started_at, Some(now));

        chunk.apply(ChunkUpdate::failed("HTTP 502"), now).unwrap();
        assert_eq!(chunk.status, ChunkStatus::Failed);
        assert_eq!(chunk.error_message.as_deref(), Some("HTTP 502"));
        assert!(chunk.apply(ChunkUpdate::processing(), now).is_err());
    }

    #[test]
    fn test_chunk_id_format() {
        let job_id = Uuid::nil();
        let id = ChunkId::new(job_id, SourceId::Ozon, 2);
        assert_eq!(id.as_str(), "00000000-0000-0000-0000-000000000000:ozon:2");
    }
}
