//! SQLite-backed durable storage
//!
//! Job and chunk state survive restarts, which is what makes resumption work.
//! Status changes are compare-and-set updates (`WHERE status = ?`) so two
//! writers can never both move a chunk out of the same state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use salesync_common::{DateWindow, SourceId};

use crate::config::{DatabaseConfig, DEFAULT_CACHE_TTL_SECS};
use crate::error::{IngestError, Result};
use crate::framework::{
    CacheStats, CachedChunk, ChunkCache, ChunkId, ChunkKey, ChunkProgress, ChunkStatus,
    ChunkUpdate, ContentRecord, EntityKey, FinalReport, JobRecord, JobStatus, NewJob,
    ProgressTracker, RecordStore,
};

use super::expires_at;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "job_id, period_from, period_to, sources, status, notify_target, \
     chunk_counts, final_result, error, created_at, updated_at";

const CHUNK_COLUMNS: &str = "chunk_id, job_id, source, chunk_index, window_from, window_to, \
     status, started_at, completed_at, error_message, result_ref, result";

/// Statuses a retention purge may remove
const PURGEABLE_STATUSES: &str = "('completed', 'failed', 'cancelled')";

pub struct SqliteStore {
    pool: SqlitePool,
    default_ttl: Duration,
}

impl SqliteStore {
    /// Open (creating if needed) the database named by `config.url`.
    ///
    /// Migrations are not applied; call [`SqliteStore::migrate`].
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        info!(url = %config.url, max_connections = config.max_connections, "Connected to SQLite");
        Ok(Self::from_pool(pool))
    }

    /// Private in-memory database with migrations applied
    pub async fn in_memory() -> Result<Self> {
        // One connection that never idles out, or the database vanishes
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        debug!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_chunk(&self, chunk_id: &ChunkId) -> Result<Option<ChunkProgress>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ingestion_chunks WHERE chunk_id = ?1",
            CHUNK_COLUMNS
        ))
        .bind(chunk_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(chunk_from_row).transpose()
    }

    /// Move a job from its current status to `next`, optionally recording the
    /// final report and error in the same statement
    async fn transition_job(
        &self,
        job_id: Uuid,
        next: JobStatus,
        report: Option<&FinalReport>,
        error: Option<&str>,
        finishing: bool,
    ) -> Result<()> {
        let current = self.get_job(job_id).await?.status;
        if !current.can_transition_to(next) {
            return Err(IngestError::invalid_transition(
                format!("job {}", job_id),
                current,
                next,
            ));
        }

        let result = if finishing {
            let report = report.map(serde_json::to_string).transpose()?;
            sqlx::query(
                r#"
                UPDATE ingestion_jobs
                SET status = ?1, final_result = ?2, error = ?3, updated_at = ?4
                WHERE job_id = ?5 AND status = ?6
                "#,
            )
            .bind(next.to_string())
            .bind(report)
            .bind(error)
            .bind(Utc::now().timestamp_millis())
            .bind(job_id.to_string())
            .bind(current.to_string())
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE ingestion_jobs
                SET status = ?1, updated_at = ?2
                WHERE job_id = ?3 AND status = ?4
                "#,
            )
            .bind(next.to_string())
            .bind(Utc::now().timestamp_millis())
            .bind(job_id.to_string())
            .bind(current.to_string())
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(IngestError::invalid_transition(
                format!("job {}", job_id),
                current,
                next,
            ));
        }
        Ok(())
    }
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| IngestError::storage(format!("Timestamp out of range: {}", millis)))
}

fn optional_timestamp(millis: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    millis.map(timestamp).transpose()
}

fn job_from_row(row: &SqliteRow) -> Result<JobRecord> {
    let job_id: String = row.get("job_id");
    let period_from: String = row.get("period_from");
    let period_to: String = row.get("period_to");
    let sources: String = row.get("sources");
    let status: String = row.get("status");
    let chunk_counts: String = row.get("chunk_counts");
    let final_result: Option<String> = row.get("final_result");

    Ok(JobRecord {
        job_id: Uuid::parse_str(&job_id)
            .map_err(|e| IngestError::storage(format!("Invalid job id {}: {}", job_id, e)))?,
        period: DateWindow::parse(&period_from, &period_to)?,
        sources: serde_json::from_str(&sources)?,
        status: status.parse()?,
        notify_target: row.get("notify_target"),
        chunk_counts: serde_json::from_str(&chunk_counts)?,
        final_result: final_result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        error: row.get("error"),
        created_at: timestamp(row.get("created_at"))?,
        updated_at: timestamp(row.get("updated_at"))?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<ChunkProgress> {
    let chunk_id: String = row.get("chunk_id");
    let job_id: String = row.get("job_id");
    let source: String = row.get("source");
    let index: i64 = row.get("chunk_index");
    let window_from: String = row.get("window_from");
    let window_to: String = row.get("window_to");
    let status: String = row.get("status");
    let result: Option<String> = row.get("result");

    Ok(ChunkProgress {
        chunk_id: ChunkId::from(chunk_id),
        job_id: Uuid::parse_str(&job_id)
            .map_err(|e| IngestError::storage(format!("Invalid job id {}: {}", job_id, e)))?,
        source: source.parse()?,
        index: u32::try_from(index)
            .map_err(|_| IngestError::storage(format!("Invalid chunk index: {}", index)))?,
        window: DateWindow::parse(&window_from, &window_to)?,
        status: status.parse()?,
        started_at: optional_timestamp(row.get("started_at"))?,
        completed_at: optional_timestamp(row.get("completed_at"))?,
        error_message: row.get("error_message"),
        result_ref: row.get("result_ref"),
        result: result.as_deref().map(serde_json::from_str).transpose()?,
    })
}

fn cached_from_row(row: &SqliteRow) -> Result<CachedChunk> {
    let source: String = row.get("source");
    let window_from: String = row.get("window_from");
    let window_to: String = row.get("window_to");
    let payload: String = row.get("payload");

    Ok(CachedChunk {
        cache_key: row.get("cache_key"),
        source: source.parse()?,
        window: DateWindow::parse(&window_from, &window_to)?,
        payload: serde_json::from_str(&payload)?,
        cached_at: timestamp(row.get("cached_at"))?,
        expires_at: timestamp(row.get("expires_at"))?,
    })
}

#[async_trait]
impl ProgressTracker for SqliteStore {
    async fn init_job(&self, job: NewJob) -> Result<JobRecord> {
        let now = Utc::now();
        let record = JobRecord {
            job_id: job.job_id,
            period: job.period,
            sources: job.sources,
            status: JobStatus::Initialized,
            notify_target: job.notify_target,
            chunk_counts: BTreeMap::new(),
            final_result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO ingestion_jobs
                (job_id, period_from, period_to, sources, status, notify_target,
                 chunk_counts, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, '{}', ?7, ?7)
            "#,
        )
        .bind(record.job_id.to_string())
        .bind(record.period.from.to_string())
        .bind(record.period.to.to_string())
        .bind(serde_json::to_string(&record.sources)?)
        .bind(record.status.to_string())
        .bind(record.notify_target.as_deref())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    async fn plan_chunks(
        &self,
        job_id: Uuid,
        windows: &BTreeMap<SourceId, Vec<DateWindow>>,
    ) -> Result<Vec<ChunkProgress>> {
        let mut tx = self.pool.begin().await?;

        let jobs: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) as count FROM ingestion_jobs WHERE job_id = ?1
            "#,
        )
        .bind(job_id.to_string())
        .fetch_one(&mut *tx)
        .await?
        .get("count");
        if jobs == 0 {
            return Err(IngestError::JobNotFound(job_id));
        }

        let existing: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) as count FROM ingestion_chunks WHERE job_id = ?1
            "#,
        )
        .bind(job_id.to_string())
        .fetch_one(&mut *tx)
        .await?
        .get("count");
        if existing > 0 {
            return Err(IngestError::storage(format!("Job {} already has a chunk plan", job_id)));
        }

        let mut planned = Vec::new();
        let mut counts: BTreeMap<SourceId, u32> = BTreeMap::new();
        for (source, source_windows) in windows {
            for (index, window) in source_windows.iter().enumerate() {
                let index = index as u32;
                let chunk_id = ChunkId::new(job_id, *source, index);
                sqlx::query(
                    r#"
                    INSERT INTO ingestion_chunks
                        (chunk_id, job_id, source, chunk_index, window_from, window_to, status)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                )
                .bind(chunk_id.as_str())
                .bind(job_id.to_string())
                .bind(source.as_str())
                .bind(i64::from(index))
                .bind(window.from.to_string())
                .bind(window.to.to_string())
                .bind(ChunkStatus::Pending.as_str())
                .execute(&mut *tx)
                .await?;

                planned.push(ChunkProgress {
                    chunk_id,
                    job_id,
                    source: *source,
                    index,
                    window: *window,
                    status: ChunkStatus::Pending,
                    started_at: None,
                    completed_at: None,
                    error_message: None,
                    result_ref: None,
                    result: None,
                });
            }
            counts.insert(*source, source_windows.len() as u32);
        }

        sqlx::query(
            r#"
            UPDATE ingestion_jobs SET chunk_counts = ?1, updated_at = ?2 WHERE job_id = ?3
            "#,
        )
        .bind(serde_json::to_string(&counts)?)
        .bind(Utc::now().timestamp_millis())
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(job_id = %job_id, chunks = planned.len(), "Chunk plan stored");
        Ok(planned)
    }

    async fn update_chunk(&self, chunk_id: &ChunkId, update: ChunkUpdate) -> Result<()> {
        let mut chunk = self
            .fetch_chunk(chunk_id)
            .await?
            .ok_or_else(|| IngestError::ChunkNotFound(chunk_id.to_string()))?;
        let previous = chunk.status;
        chunk.apply(update, Utc::now())?;

        let result = chunk.result.as_ref().map(serde_json::to_string).transpose()?;
        let written = sqlx::query(
            r#"
            UPDATE ingestion_chunks
            SET status = ?1, started_at = ?2, completed_at = ?3,
                error_message = ?4, result_ref = ?5, result = ?6
            WHERE chunk_id = ?7 AND status = ?8
            "#,
        )
        .bind(chunk.status.as_str())
        .bind(chunk.started_at.map(|t| t.timestamp_millis()))
        .bind(chunk.completed_at.map(|t| t.timestamp_millis()))
        .bind(chunk.error_message.as_deref())
        .bind(chunk.result_ref.as_deref())
        .bind(result)
        .bind(chunk_id.as_str())
        .bind(previous.as_str())
        .execute(&self.pool)
        .await?;

        if written.rows_affected() == 0 {
            // Another writer moved the chunk first
            return Err(IngestError::invalid_transition(chunk_id, previous, chunk.status));
        }
        Ok(())
    }

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        self.transition_job(job_id, status, None, None, false).await
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        report: Option<&FinalReport>,
        error: Option<&str>,
    ) -> Result<()> {
        self.transition_job(job_id, status, report, error, true).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<JobRecord> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ingestion_jobs WHERE job_id = ?1",
            JOB_COLUMNS
        ))
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(IngestError::JobNotFound(job_id)),
        }
    }

    async fn list_chunks(
        &self,
        job_id: Uuid,
        source: Option<SourceId>,
        status: Option<ChunkStatus>,
    ) -> Result<Vec<ChunkProgress>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ingestion_chunks \
             WHERE job_id = ?1 AND (?2 IS NULL OR source = ?2) AND (?3 IS NULL OR status = ?3)",
            CHUNK_COLUMNS
        ))
        .bind(job_id.to_string())
        .bind(source.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        let mut chunks = rows.iter().map(chunk_from_row).collect::<Result<Vec<_>>>()?;
        // Source priority order is not alphabetical
        chunks.sort_by_key(|c| (c.source, c.index));
        Ok(chunks)
    }

    async fn list_unfinished_jobs(&self) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ingestion_jobs \
             WHERE status IN ('initialized', 'aggregating') OR status LIKE 'stage_running:%' \
             ORDER BY created_at",
            JOB_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn reset_stale_chunks(&self, job_id: Uuid, started_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_chunks
            SET status = 'pending', started_at = NULL, completed_at = NULL
            WHERE job_id = ?1
              AND status = 'processing'
              AND (started_at IS NULL OR started_at <= ?2)
            "#,
        )
        .bind(job_id.to_string())
        .bind(started_before.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn purge_jobs(&self, updated_before: DateTime<Utc>) -> Result<u64> {
        let cutoff = updated_before.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "DELETE FROM ingestion_chunks WHERE job_id IN \
             (SELECT job_id FROM ingestion_jobs WHERE status IN {} AND updated_at < ?1)",
            PURGEABLE_STATUSES
        ))
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let purged = sqlx::query(&format!(
            "DELETE FROM ingestion_jobs WHERE status IN {} AND updated_at < ?1",
            PURGEABLE_STATUSES
        ))
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(purged)
    }
}

#[async_trait]
impl ChunkCache for SqliteStore {
    async fn get(&self, key: &ChunkKey) -> Result<Option<CachedChunk>> {
        let cache_key = key.cache_key();
        let row = sqlx::query(
            r#"
            SELECT cache_key, source, window_from, window_to, payload, cached_at, expires_at
            FROM chunk_cache WHERE cache_key = ?1
            "#,
        )
        .bind(&cache_key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let entry = cached_from_row(&row)?;
        if entry.is_expired(Utc::now()) {
            sqlx::query("DELETE FROM chunk_cache WHERE cache_key = ?1")
                .bind(&cache_key)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn put(&self, key: &ChunkKey, payload: &Value, ttl: Option<Duration>) -> Result<()> {
        let now = Utc::now();
        let expires = expires_at(now, ttl.unwrap_or(self.default_ttl));

        sqlx::query(
            r#"
            INSERT INTO chunk_cache
                (cache_key, source, window_from, window_to, payload, cached_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(cache_key) DO UPDATE SET
                payload = excluded.payload,
                cached_at = excluded.cached_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key.cache_key())
        .bind(key.source.as_str())
        .bind(key.window.from.to_string())
        .bind(key.window.to.to_string())
        .bind(serde_json::to_string(payload)?)
        .bind(now.timestamp_millis())
        .bind(expires.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn invalidate(&self, pattern: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunk_cache WHERE cache_key GLOB ?1")
            .bind(pattern)
            .execute(&self.pool)
            .await?;

        info!(pattern, removed = result.rows_affected(), "Cache entries invalidated");
        Ok(result.rows_affected())
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunk_cache WHERE expires_at <= ?1")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<CacheStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as total,
                COALESCE(SUM(CASE WHEN expires_at <= ?1 THEN 1 ELSE 0 END), 0) as expired
            FROM chunk_cache
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total");
        let expired: i64 = row.get("expired");
        Ok(CacheStats {
            total_entries: total as u64,
            expired_entries: expired as u64,
            valid_entries: (total - expired) as u64,
        })
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get_hash(&self, key: &EntityKey) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT content_hash FROM content_records
            WHERE record_date = ?1 AND source = ?2 AND business_key = ?3
            "#,
        )
        .bind(key.date.to_string())
        .bind(key.source.as_str())
        .bind(&key.business_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.get("content_hash")))
    }

    async fn get_record(&self, key: &EntityKey) -> Result<Option<ContentRecord>> {
        let row = sqlx::query(
            r#"
            SELECT fields, content_hash, updated_at FROM content_records
            WHERE record_date = ?1 AND source = ?2 AND business_key = ?3
            "#,
        )
        .bind(key.date.to_string())
        .bind(key.source.as_str())
        .bind(&key.business_key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let fields: String = row.get("fields");
        Ok(Some(ContentRecord {
            key: key.clone(),
            fields: serde_json::from_str(&fields)?,
            content_hash: row.get("content_hash"),
            updated_at: timestamp(row.get("updated_at"))?,
        }))
    }

    async fn write_record(
        &self,
        key: &EntityKey,
        fields: &Value,
        new_hash: &str,
        expected_hash: Option<&str>,
    ) -> Result<()> {
        let fields = serde_json::to_string(fields)?;
        let now = Utc::now().timestamp_millis();

        let result = match expected_hash {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO content_records
                        (record_date, source, business_key, fields, content_hash, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT(record_date, source, business_key) DO NOTHING
                    "#,
                )
                .bind(key.date.to_string())
                .bind(key.source.as_str())
                .bind(&key.business_key)
                .bind(&fields)
                .bind(new_hash)
                .bind(now)
                .execute(&self.pool)
                .await?
            },
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE content_records
                    SET fields = ?1, content_hash = ?2, updated_at = ?3
                    WHERE record_date = ?4 AND source = ?5 AND business_key = ?6
                      AND content_hash = ?7
                    "#,
                )
                .bind(&fields)
                .bind(new_hash)
                .bind(now)
                .bind(key.date.to_string())
                .bind(key.source.as_str())
                .bind(&key.business_key)
                .bind(expected)
                .execute(&self.pool)
                .await?
            },
        };

        if result.rows_affected() == 0 {
            return Err(IngestError::write_conflict(
                key.to_string(),
                format!("stored hash no longer matches {:?}", expected_hash),
            ));
        }
        Ok(())
    }

    async fn count_records(&self, source: Option<SourceId>) -> Result<u64> {
        let count: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) as count FROM content_records WHERE (?1 IS NULL OR source = ?1)
            "#,
        )
        .bind(source.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await?
        .get("count");

        Ok(count as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        assert_eq!(store.count_records(None).await.unwrap(), 0);
    }

    #[test]
    fn test_timestamp_round_trip_keeps_millis() {
        let now = Utc::now();
        let back = timestamp(now.timestamp_millis()).unwrap();
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
        assert!(timestamp(i64::MAX).is_err());
    }
}
