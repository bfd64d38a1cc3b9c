//! The ingestion surface exposed to collaborators
//!
//! Submitting a job runs stage 1 inline (so a bad period is reported to the
//! caller straight away) and the remaining stages on a background task.
//! Each running job owns a cancellation token; cancelling stops new chunk
//! tasks from being scheduled while in-flight requests finish.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use salesync_common::{DateWindow, SourceId};

use crate::config::RetentionConfig;
use crate::error::Result;

use super::cache::ChunkCache;
use super::processor::StagedProcessor;
use super::progress::{JobProgress, ProgressTracker};
use super::results::FinalResult;
use super::types::{JobRecord, NewJob};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Counts from one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub cache_entries_removed: u64,
    pub jobs_purged: u64,
}

type RunningJobs = Arc<Mutex<HashMap<Uuid, CancellationToken>>>;

pub struct IngestionService {
    processor: Arc<StagedProcessor>,
    tracker: Arc<dyn ProgressTracker>,
    cache: Arc<dyn ChunkCache>,
    retention: RetentionConfig,
    running: RunningJobs,
    poll_interval: Duration,
}

impl IngestionService {
    pub fn new(
        processor: Arc<StagedProcessor>,
        tracker: Arc<dyn ProgressTracker>,
        cache: Arc<dyn ChunkCache>,
        retention: RetentionConfig,
    ) -> Self {
        Self {
            processor,
            tracker,
            cache,
            retention,
            running: Arc::new(Mutex::new(HashMap::new())),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How often `wait_for_job` polls the tracker
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.running().contains_key(&job_id)
    }

    /// Create a job and start it in the background.
    ///
    /// An empty `sources` list means every source in default priority order;
    /// duplicates are dropped keeping the first occurrence. If stage 1 fails
    /// (e.g. `from > to`) the job is recorded as `Failed` and the error is
    /// returned.
    pub async fn submit_job(
        &self,
        period: DateWindow,
        sources: &[SourceId],
        notify_target: Option<String>,
    ) -> Result<Uuid> {
        let mut ordered: Vec<SourceId> = Vec::new();
        let requested: &[SourceId] = if sources.is_empty() { &SourceId::ALL } else { sources };
        for source in requested {
            if !ordered.contains(source) {
                ordered.push(*source);
            }
        }

        let job = self
            .tracker
            .init_job(NewJob {
                job_id: Uuid::new_v4(),
                period,
                sources: ordered,
                notify_target,
            })
            .await?;
        info!(job_id = %job.job_id, period = %job.period, sources = ?job.sources, "Job submitted");

        self.processor.initialize(job.job_id).await?;
        self.spawn(job.job_id);
        Ok(job.job_id)
    }

    fn spawn(&self, job_id: Uuid) -> bool {
        let token = {
            let mut running = self.running();
            if running.contains_key(&job_id) {
                return false;
            }
            let token = CancellationToken::new();
            running.insert(job_id, token.clone());
            token
        };

        let processor = self.processor.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            if let Err(e) = processor.run(job_id, &token).await {
                error!(job_id = %job_id, error = %e, "Job run aborted");
                if let Err(fe) = processor.abort(job_id, &e).await {
                    error!(job_id = %job_id, error = %fe, "Failed to record job failure");
                }
            }
            running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&job_id);
        });
        true
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> Result<JobRecord> {
        self.tracker.get_job(job_id).await
    }

    pub async fn get_job_progress(&self, job_id: Uuid) -> Result<JobProgress> {
        let job = self.tracker.get_job(job_id).await?;
        let chunks = self.tracker.list_chunks(job_id, None, None).await?;
        Ok(JobProgress::from_chunks(
            &job,
            &chunks,
            self.processor.config().worker_count,
        ))
    }

    pub async fn get_final_result(&self, job_id: Uuid) -> Result<FinalResult> {
        Ok(self.tracker.get_job(job_id).await?.final_result())
    }

    /// Request cancellation; returns false when the job is not running here
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        self.tracker.get_job(job_id).await?;
        match self.running().get(&job_id) {
            Some(token) => {
                token.cancel();
                info!(job_id = %job_id, "Cancellation requested");
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// Resume a cancelled or interrupted job.
    ///
    /// Chunks left `Processing` longer than the liveness timeout are retried;
    /// younger ones are waited on before the job is aggregated.
    /// Returns false for finished jobs and jobs already running.
    pub async fn resume_job(&self, job_id: Uuid) -> Result<bool> {
        let job = self.tracker.get_job(job_id).await?;
        if job.status.is_terminal() || self.is_running(job_id) {
            return Ok(false);
        }

        self.processor
            .reset_stale_chunks(job_id, self.processor.config().liveness_timeout)
            .await?;
        info!(job_id = %job_id, status = %job.status, "Resuming job");
        Ok(self.spawn(job_id))
    }

    /// Startup recovery: restart every unfinished job.
    ///
    /// Nothing can be in flight in a fresh process, so every `Processing`
    /// chunk is reset regardless of age. Cancelled jobs stay cancelled.
    pub async fn resume_unfinished_jobs(&self) -> Result<Vec<Uuid>> {
        let mut resumed = Vec::new();
        for job in self.tracker.list_unfinished_jobs().await? {
            if self.is_running(job.job_id) {
                continue;
            }
            self.processor
                .reset_stale_chunks(job.job_id, Duration::ZERO)
                .await?;
            if self.spawn(job.job_id) {
                resumed.push(job.job_id);
            }
        }

        if !resumed.is_empty() {
            warn!(jobs = resumed.len(), "Resumed unfinished jobs after restart");
        }
        Ok(resumed)
    }

    /// Poll until the job stops running and leaves its working states, or
    /// until `timeout`; returns the latest record either way
    pub async fn wait_for_job(&self, job_id: Uuid, timeout: Duration) -> Result<JobRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.tracker.get_job(job_id).await?;
            let settled = !self.is_running(job_id) && !job.status.is_unfinished();
            if settled || Instant::now() >= deadline {
                return Ok(job);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Sweep expired cache entries and purge jobs past retention
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let cache_entries_removed = self.cache.cleanup_expired().await?;
        let cutoff = Utc::now() - chrono::Duration::days(self.retention.job_retention_days);
        let jobs_purged = self.tracker.purge_jobs(cutoff).await?;

        info!(
            cache_entries_removed,
            jobs_purged,
            retention_days = self.retention.job_retention_days,
            "Maintenance finished"
        );
        Ok(MaintenanceReport {
            cache_entries_removed,
            jobs_purged,
        })
    }
}
