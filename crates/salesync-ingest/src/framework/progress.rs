//! Durable job and chunk state
//!
//! Every transition is persisted, so after a restart the chunk table alone
//! says which windows still need work. The tracker validates transitions
//! but never changes a job's status on its own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use salesync_common::{DateWindow, SourceId};

use crate::error::Result;

use super::results::FinalReport;
use super::types::{ChunkId, ChunkProgress, ChunkStatus, ChunkUpdate, JobRecord, JobStatus, NewJob};

/// Job and chunk store
#[async_trait]
pub trait ProgressTracker: Send + Sync {
    /// Create the job record in `Initialized`
    async fn init_job(&self, job: NewJob) -> Result<JobRecord>;

    /// Create one `Pending` chunk per window and record per-source counts
    async fn plan_chunks(
        &self,
        job_id: Uuid,
        windows: &BTreeMap<SourceId, Vec<DateWindow>>,
    ) -> Result<Vec<ChunkProgress>>;

    /// Apply one status transition; rejects transitions the chunk state
    /// machine does not allow with `InvalidTransition`
    async fn update_chunk(&self, chunk_id: &ChunkId, update: ChunkUpdate) -> Result<()>;

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()>;

    /// Final transition with the aggregated report and/or an error message
    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        report: Option<&FinalReport>,
        error: Option<&str>,
    ) -> Result<()>;

    /// Fails with `JobNotFound`
    async fn get_job(&self, job_id: Uuid) -> Result<JobRecord>;

    /// Chunks ordered by source then window index
    async fn list_chunks(
        &self,
        job_id: Uuid,
        source: Option<SourceId>,
        status: Option<ChunkStatus>,
    ) -> Result<Vec<ChunkProgress>>;

    /// Jobs in `Initialized`, `StageRunning` or `Aggregating`
    async fn list_unfinished_jobs(&self) -> Result<Vec<JobRecord>>;

    /// Put `Processing` chunks started before `started_before` back to `Pending`
    async fn reset_stale_chunks(&self, job_id: Uuid, started_before: DateTime<Utc>) -> Result<u64>;

    /// Delete finished or cancelled jobs (and their chunks) last updated
    /// before `updated_before`
    async fn purge_jobs(&self, updated_before: DateTime<Utc>) -> Result<u64>;
}

/// Snapshot for progress display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub chunks_total: usize,
    pub chunks_pending: usize,
    pub chunks_processing: usize,
    pub chunks_completed: usize,
    pub chunks_cached: usize,
    pub chunks_failed: usize,
    pub per_source: BTreeMap<SourceId, SourceProgress>,
    pub percent_complete: f64,
    /// Estimated from the mean duration of fetched chunks
    pub eta: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProgress {
    pub total: usize,
    pub finished: usize,
}

impl JobProgress {
    pub fn from_chunks(job: &JobRecord, chunks: &[ChunkProgress], worker_count: usize) -> Self {
        let mut progress = JobProgress {
            job_id: job.job_id,
            status: job.status,
            chunks_total: chunks.len(),
            chunks_pending: 0,
            chunks_processing: 0,
            chunks_completed: 0,
            chunks_cached: 0,
            chunks_failed: 0,
            per_source: BTreeMap::new(),
            percent_complete: 0.0,
            eta: None,
        };

        let mut fetch_millis: i64 = 0;
        let mut fetched: i64 = 0;

        for chunk in chunks {
            match chunk.status {
                ChunkStatus::Pending => progress.chunks_pending += 1,
                ChunkStatus::Processing => progress.chunks_processing += 1,
                ChunkStatus::Completed => progress.chunks_completed += 1,
                ChunkStatus::Cached => progress.chunks_cached += 1,
                ChunkStatus::Failed => progress.chunks_failed += 1,
            }

            let entry = progress.per_source.entry(chunk.source).or_default();
            entry.total += 1;
            if chunk.status.is_terminal() {
                entry.finished += 1;
            }

            if matches!(chunk.status, ChunkStatus::Completed | ChunkStatus::Failed) {
                if let (Some(started), Some(completed)) = (chunk.started_at, chunk.completed_at) {
                    fetch_millis += (completed - started).num_milliseconds().max(0);
                    fetched += 1;
                }
            }
        }

        let finished = progress.chunks_completed + progress.chunks_cached + progress.chunks_failed;
        progress.percent_complete = if progress.chunks_total == 0 {
            if job.status.is_terminal() {
                100.0
            } else {
                0.0
            }
        } else {
            (finished as f64 / progress.chunks_total as f64) * 100.0
        };

        let remaining = progress.chunks_pending + progress.chunks_processing;
        if remaining == 0 {
            progress.eta = Some(Duration::ZERO);
        } else if fetched > 0 {
            let mean_ms = (fetch_millis / fetched) as u64;
            let rounds = remaining.div_ceil(worker_count.max(1)) as u64;
            progress.eta = Some(Duration::from_millis(mean_ms.saturating_mul(rounds)));
        }

        progress
    }
}
