//! Staged job execution
//!
//! A job runs initialization, then one ingestion stage per source in the
//! job's priority order, then aggregation. Sources run one at a time so the
//! combined request rate stays predictable; chunks within a stage run
//! concurrently up to `worker_count`. A failed chunk never aborts its
//! siblings or the stage.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use salesync_common::{DateWindow, SourceId};

use crate::config::ProcessorConfig;
use crate::error::{IngestError, Result};
use crate::http::ResilientHttpClient;

use super::cache::ChunkCache;
use super::chunker::Chunker;
use super::connector::{ConnectorSet, SourceConnector};
use super::notifier::{JobNotifier, LogNotifier};
use super::progress::ProgressTracker;
use super::results::{aggregate, ChunkResult, FinalReport};
use super::types::{ChunkKey, ChunkProgress, ChunkStatus, ChunkUpdate, JobRecord, JobStatus, NormalizedRecord};
use super::upsert::{IdempotentUpsertWriter, RecordStore, UpsertStats};

/// Counters for one source stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub completed: u64,
    pub cached: u64,
    pub failed: u64,
    /// Not started because cancellation was observed
    pub skipped: u64,
    pub records_written: u64,
    pub records_unchanged: u64,
}

impl StageStats {
    pub fn merge(&mut self, other: &StageStats) {
        self.completed += other.completed;
        self.cached += other.cached;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.records_written += other.records_written;
        self.records_unchanged += other.records_unchanged;
    }

    fn record(&mut self, outcome: &ChunkOutcome) {
        match outcome {
            ChunkOutcome::Completed(upserts) => {
                self.completed += 1;
                self.records_written += upserts.written;
                self.records_unchanged += upserts.unchanged;
            },
            ChunkOutcome::Cached => self.cached += 1,
            ChunkOutcome::Failed => self.failed += 1,
            ChunkOutcome::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug)]
enum ChunkOutcome {
    Completed(UpsertStats),
    Cached,
    Failed,
    Skipped,
}

impl ChunkOutcome {
    /// Whether the chunk went to the network
    fn fetched(&self) -> bool {
        matches!(self, ChunkOutcome::Completed(_) | ChunkOutcome::Failed)
    }
}

/// Chunks that keep a job from being aggregated
enum OpenChunks {
    None,
    Pending(usize),
    InFlight(usize),
}

/// Drives jobs end to end over injected stores and an HTTP client
pub struct StagedProcessor {
    tracker: Arc<dyn ProgressTracker>,
    cache: Arc<dyn ChunkCache>,
    writer: IdempotentUpsertWriter,
    client: Arc<ResilientHttpClient>,
    connectors: ConnectorSet,
    chunker: Chunker,
    notifier: Arc<dyn JobNotifier>,
    config: ProcessorConfig,
    cache_ttl: Option<Duration>,
}

impl StagedProcessor {
    pub fn new(
        tracker: Arc<dyn ProgressTracker>,
        cache: Arc<dyn ChunkCache>,
        records: Arc<dyn RecordStore>,
        client: Arc<ResilientHttpClient>,
        connectors: ConnectorSet,
        chunker: Chunker,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            tracker,
            cache,
            writer: IdempotentUpsertWriter::new(records),
            client,
            connectors,
            chunker,
            notifier: Arc::new(LogNotifier),
            config,
            cache_ttl: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn JobNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// TTL for cache writes; `None` leaves it to the cache's default
    pub fn with_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Stage 1: validate the period, plan chunks, enter the first stage.
    ///
    /// On an invalid range or missing connector the job is finished as
    /// `Failed` with no chunks planned and the error is returned. Calling
    /// this on an already planned job is a no-op.
    pub async fn initialize(&self, job_id: Uuid) -> Result<()> {
        let job = self.tracker.get_job(job_id).await?;
        if job.status != JobStatus::Initialized {
            return Ok(());
        }

        let existing = self.tracker.list_chunks(job_id, None, None).await?;
        if existing.is_empty() {
            let plan = match self.plan(&job) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(job_id = %job_id, period = %job.period, error = %e, "Job rejected at initialization");
                    self.finish(job_id, JobStatus::Failed, None, Some(e.to_string())).await?;
                    return Err(e);
                },
            };

            let chunks = self.tracker.plan_chunks(job_id, &plan).await?;
            info!(
                job_id = %job_id,
                period = %job.period,
                chunks = chunks.len(),
                sources = ?job.sources,
                "Job planned"
            );
        }

        if let Some(first) = job.sources.first() {
            self.tracker
                .update_job_status(job_id, JobStatus::StageRunning(*first))
                .await?;
        }
        Ok(())
    }

    fn plan(&self, job: &JobRecord) -> Result<BTreeMap<SourceId, Vec<DateWindow>>> {
        for source in &job.sources {
            if !self.connectors.contains(*source) {
                return Err(IngestError::ConnectorMissing(*source));
            }
        }
        self.chunker.plan(&job.sources, job.period)
    }

    /// Put chunks stuck in `Processing` for longer than `older_than` back
    /// to `Pending`
    pub async fn reset_stale_chunks(&self, job_id: Uuid, older_than: Duration) -> Result<u64> {
        let age = chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let reset = self.tracker.reset_stale_chunks(job_id, Utc::now() - age).await?;
        if reset > 0 {
            warn!(job_id = %job_id, chunks = reset, "Reset stale processing chunks to pending");
        }
        Ok(reset)
    }

    /// Run (or resume) a job until it is finished or cancellation is seen.
    ///
    /// Only `Pending` chunks are executed; `Completed` and `Cached` chunks
    /// are reused as they are. The job is aggregated only once every chunk
    /// is terminal: chunks another worker still holds are waited on until
    /// they settle or pass the liveness timeout and are requeued. If
    /// `Pending` chunks remain after a pass (a claim could not be recorded)
    /// the job is left in its running state for a later resume.
    pub async fn run(&self, job_id: Uuid, cancel: &CancellationToken) -> Result<JobStatus> {
        let job = self.tracker.get_job(job_id).await?;
        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "Job already finished");
            return Ok(job.status);
        }

        if job.status == JobStatus::Initialized {
            self.initialize(job_id).await?;
        }

        let started = Instant::now();
        let mut totals = StageStats::default();

        loop {
            for source in &job.sources {
                if cancel.is_cancelled() {
                    return self.mark_cancelled(job_id).await;
                }

                self.tracker
                    .update_job_status(job_id, JobStatus::StageRunning(*source))
                    .await?;

                let stats = self.run_stage(job_id, *source, cancel).await?;
                info!(
                    job_id = %job_id,
                    source = %source,
                    completed = stats.completed,
                    cached = stats.cached,
                    failed = stats.failed,
                    skipped = stats.skipped,
                    records_written = stats.records_written,
                    records_unchanged = stats.records_unchanged,
                    "Source stage finished"
                );
                totals.merge(&stats);
            }

            if cancel.is_cancelled() {
                return self.mark_cancelled(job_id).await;
            }

            match self.open_chunks(job_id).await? {
                OpenChunks::None => break,
                OpenChunks::Pending(count) => {
                    warn!(
                        job_id = %job_id,
                        chunks = count,
                        "Pending chunks left after stages, job stays resumable"
                    );
                    return Ok(self.tracker.get_job(job_id).await?.status);
                },
                OpenChunks::InFlight(count) => {
                    debug!(job_id = %job_id, chunks = count, "Waiting for in-flight chunks");
                    tokio::select! {
                        _ = cancel.cancelled() => return self.mark_cancelled(job_id).await,
                        _ = tokio::time::sleep(self.config.settle_interval) => {},
                    }
                    self.reset_stale_chunks(job_id, self.config.liveness_timeout)
                        .await?;
                },
            }
        }

        self.tracker
            .update_job_status(job_id, JobStatus::Aggregating)
            .await?;
        let status = self.aggregate(&job).await?;

        info!(
            job_id = %job_id,
            status = %status,
            chunks_fetched = totals.completed,
            chunks_cached = totals.cached,
            chunks_failed = totals.failed,
            records_written = totals.records_written,
            duration_ms = started.elapsed().as_millis() as u64,
            "Job finished"
        );
        Ok(status)
    }

    async fn open_chunks(&self, job_id: Uuid) -> Result<OpenChunks> {
        let chunks = self.tracker.list_chunks(job_id, None, None).await?;
        let pending = chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Pending)
            .count();
        let processing = chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Processing)
            .count();

        Ok(if pending > 0 {
            OpenChunks::Pending(pending)
        } else if processing > 0 {
            OpenChunks::InFlight(processing)
        } else {
            OpenChunks::None
        })
    }

    /// Record a run that ended in an error as `Failed`
    pub async fn abort(&self, job_id: Uuid, error: &IngestError) -> Result<()> {
        let job = self.tracker.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(());
        }
        self.finish(job_id, JobStatus::Failed, None, Some(error.to_string()))
            .await
    }

    async fn mark_cancelled(&self, job_id: Uuid) -> Result<JobStatus> {
        self.tracker
            .update_job_status(job_id, JobStatus::Cancelled)
            .await?;
        info!(job_id = %job_id, "Job cancelled; finished chunks are kept for resume");
        Ok(JobStatus::Cancelled)
    }

    /// Final stage: sum chunk results, record gaps, decide the outcome
    async fn aggregate(&self, job: &JobRecord) -> Result<JobStatus> {
        let chunks = self.tracker.list_chunks(job.job_id, None, None).await?;
        let report = aggregate(
            job.job_id,
            job.period,
            &job.sources,
            &chunks,
            &self.config.failure_policy,
        );

        for gap in &report.coverage_gaps {
            warn!(
                job_id = %job.job_id,
                source = %gap.source,
                window = %gap.window,
                reason = %gap.reason,
                "Coverage gap"
            );
        }

        let (status, error) = if report.failed_sources.is_empty() {
            (JobStatus::Completed, None)
        } else {
            let names: Vec<&str> = report.failed_sources.iter().map(SourceId::as_str).collect();
            (
                JobStatus::Failed,
                Some(format!("No usable data from source(s): {}", names.join(", "))),
            )
        };

        self.finish(job.job_id, status, Some(&report), error).await?;
        Ok(status)
    }

    async fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        report: Option<&FinalReport>,
        error: Option<String>,
    ) -> Result<()> {
        self.tracker
            .finish_job(job_id, status, report, error.as_deref())
            .await?;

        let job = self.tracker.get_job(job_id).await?;
        let result = job.final_result();
        if let Err(e) = self.notifier.notify(&job, &result).await {
            warn!(job_id = %job_id, error = %e, "Job notification failed");
        }
        Ok(())
    }

    /// One source stage over its `Pending` chunks
    pub async fn run_stage(
        &self,
        job_id: Uuid,
        source: SourceId,
        cancel: &CancellationToken,
    ) -> Result<StageStats> {
        let connector = self.connectors.get(source)?;
        let pending = self
            .tracker
            .list_chunks(job_id, Some(source), Some(ChunkStatus::Pending))
            .await?;

        if pending.is_empty() {
            debug!(job_id = %job_id, source = %source, "No pending chunks");
            return Ok(StageStats::default());
        }

        let workers = self.config.worker_count.max(1);
        let params = connector.request_params();
        info!(
            job_id = %job_id,
            source = %source,
            chunks = pending.len(),
            workers,
            "Starting source stage"
        );

        let outcomes: Vec<ChunkOutcome> = stream::iter(pending)
            .map(|chunk| {
                let connector = connector.clone();
                let params = &params;
                async move {
                    if cancel.is_cancelled() {
                        return ChunkOutcome::Skipped;
                    }
                    let outcome = self.process_chunk(connector.as_ref(), &chunk, params).await;
                    if outcome.fetched() && !self.config.inter_chunk_delay.is_zero() {
                        tokio::time::sleep(self.config.inter_chunk_delay).await;
                    }
                    outcome
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut stats = StageStats::default();
        for outcome in &outcomes {
            stats.record(outcome);
        }
        Ok(stats)
    }

    async fn process_chunk(
        &self,
        connector: &dyn SourceConnector,
        chunk: &ChunkProgress,
        params: &BTreeMap<String, String>,
    ) -> ChunkOutcome {
        let key = ChunkKey::new(chunk.source, chunk.window, params);
        let cache_key = key.cache_key();

        match self.cache.get(&key).await {
            Ok(Some(cached)) => match summarize(connector, &chunk.window, &cached.payload) {
                Ok((result, _)) => {
                    return match self
                        .tracker
                        .update_chunk(&chunk.chunk_id, ChunkUpdate::cached(result, &cache_key))
                        .await
                    {
                        Ok(()) => {
                            info!(
                                job_id = %chunk.job_id,
                                source = %chunk.source,
                                window = %chunk.window,
                                status = %ChunkStatus::Cached,
                                "Chunk satisfied from cache"
                            );
                            ChunkOutcome::Cached
                        },
                        Err(e) => {
                            error!(chunk_id = %chunk.chunk_id, error = %e, "Failed to record cached chunk");
                            ChunkOutcome::Skipped
                        },
                    };
                },
                Err(e) => {
                    warn!(
                        chunk_id = %chunk.chunk_id,
                        error = %e,
                        "Cached payload unusable, fetching again"
                    );
                },
            },
            Ok(None) => debug!(chunk_id = %chunk.chunk_id, cache_key = %cache_key, "Cache miss"),
            Err(e) => warn!(chunk_id = %chunk.chunk_id, error = %e, "Cache read failed"),
        }

        if let Err(e) = self
            .tracker
            .update_chunk(&chunk.chunk_id, ChunkUpdate::processing())
            .await
        {
            error!(chunk_id = %chunk.chunk_id, error = %e, "Failed to claim chunk");
            return ChunkOutcome::Skipped;
        }

        match self.fetch_chunk(connector, chunk, &key).await {
            Ok((result, upserts)) => {
                match self
                    .tracker
                    .update_chunk(&chunk.chunk_id, ChunkUpdate::completed(result, &cache_key))
                    .await
                {
                    Ok(()) => {
                        info!(
                            job_id = %chunk.job_id,
                            source = %chunk.source,
                            window = %chunk.window,
                            status = %ChunkStatus::Completed,
                            records_written = upserts.written,
                            records_unchanged = upserts.unchanged,
                            "Chunk ingested"
                        );
                        ChunkOutcome::Completed(upserts)
                    },
                    Err(e) => {
                        error!(chunk_id = %chunk.chunk_id, error = %e, "Failed to record completed chunk");
                        ChunkOutcome::Failed
                    },
                }
            },
            Err(e) => {
                warn!(
                    job_id = %chunk.job_id,
                    source = %chunk.source,
                    window = %chunk.window,
                    status = %ChunkStatus::Failed,
                    circuit_open = e.is_circuit_open(),
                    error = %e,
                    "Chunk failed"
                );
                if let Err(te) = self
                    .tracker
                    .update_chunk(&chunk.chunk_id, ChunkUpdate::failed(e.to_string()))
                    .await
                {
                    error!(chunk_id = %chunk.chunk_id, error = %te, "Failed to record chunk failure");
                }
                ChunkOutcome::Failed
            },
        }
    }

    /// Fetch, normalize, write through the upsert writer, then cache
    async fn fetch_chunk(
        &self,
        connector: &dyn SourceConnector,
        chunk: &ChunkProgress,
        key: &ChunkKey,
    ) -> Result<(ChunkResult, UpsertStats)> {
        let request = connector.build_request(&chunk.window)?;
        let response = self.client.execute(&request).await?;
        let payload = connector.parse_payload(&response)?;

        let (result, records) = summarize(connector, &chunk.window, &payload)?;
        let upserts = self.writer.upsert_batch(&records).await?;

        if let Err(e) = self.cache.put(key, &payload, self.cache_ttl).await {
            warn!(chunk_id = %chunk.chunk_id, error = %e, "Failed to cache chunk payload");
        }

        Ok((result, upserts))
    }
}

/// Normalize a payload and build its typed partial result
fn summarize(
    connector: &dyn SourceConnector,
    window: &DateWindow,
    payload: &Value,
) -> Result<(ChunkResult, Vec<NormalizedRecord>)> {
    let records = connector.normalize(window, payload)?;
    let result = connector.summarize(window, &records);
    if result.source() != connector.source_id() {
        return Err(IngestError::normalize(
            connector.source_id(),
            window,
            format!("connector produced a {} result", result.source()),
        ));
    }
    Ok((result, records))
}
