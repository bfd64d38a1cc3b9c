//! Process-local implementation of every storage seam
//!
//! All state sits behind one mutex that is never held across an await, which
//! gives the same per-key atomicity as the SQLite store. Nothing survives a
//! restart; use it for tests and one-shot runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use salesync_common::{DateWindow, SourceId};

use crate::config::DEFAULT_CACHE_TTL_SECS;
use crate::error::{IngestError, Result};
use crate::framework::cache::glob_match;
use crate::framework::{
    CacheStats, CachedChunk, ChunkCache, ChunkId, ChunkKey, ChunkProgress, ChunkStatus,
    ChunkUpdate, ContentRecord, EntityKey, FinalReport, JobRecord, JobStatus, NewJob,
    ProgressTracker, RecordStore,
};

use super::expires_at;

type ChunkSlot = (Uuid, SourceId, u32);

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, JobRecord>,
    chunks: BTreeMap<ChunkSlot, ChunkProgress>,
    chunk_slots: HashMap<ChunkId, ChunkSlot>,
    cache: HashMap<String, CachedChunk>,
    records: HashMap<EntityKey, ContentRecord>,
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    default_ttl: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| IngestError::storage(format!("Memory store lock poisoned: {}", e)))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressTracker for MemoryStore {
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

        let mut state = self.lock()?;
        if state.jobs.contains_key(&job.job_id) {
            return Err(IngestError::storage(format!("Job {} already exists", job.job_id)));
        }
        state.jobs.insert(job.job_id, record.clone());
        Ok(record)
    }

    async fn plan_chunks(
        &self,
        job_id: Uuid,
        windows: &BTreeMap<SourceId, Vec<DateWindow>>,
    ) -> Result<Vec<ChunkProgress>> {
        let mut state = self.lock()?;
        if !state.jobs.contains_key(&job_id) {
            return Err(IngestError::JobNotFound(job_id));
        }
        if state.chunks.keys().any(|(id, _, _)| *id == job_id) {
            return Err(IngestError::storage(format!("Job {} already has a chunk plan", job_id)));
        }

        let mut planned = Vec::new();
        let mut counts = BTreeMap::new();
        for (source, source_windows) in windows {
            for (index, window) in source_windows.iter().enumerate() {
                let index = index as u32;
                let chunk = ChunkProgress {
                    chunk_id: ChunkId::new(job_id, *source, index),
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
                };
                let slot = (job_id, *source, index);
                state.chunk_slots.insert(chunk.chunk_id.clone(), slot);
                state.chunks.insert(slot, chunk.clone());
                planned.push(chunk);
            }
            counts.insert(*source, source_windows.len() as u32);
        }

        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.chunk_counts = counts;
            job.updated_at = Utc::now();
        }
        Ok(planned)
    }

    async fn update_chunk(&self, chunk_id: &ChunkId, update: ChunkUpdate) -> Result<()> {
        let mut state = self.lock()?;
        let slot = *state
            .chunk_slots
            .get(chunk_id)
            .ok_or_else(|| IngestError::ChunkNotFound(chunk_id.to_string()))?;
        let chunk = state
            .chunks
            .get_mut(&slot)
            .ok_or_else(|| IngestError::ChunkNotFound(chunk_id.to_string()))?;
        chunk.apply(update, Utc::now())
    }

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(IngestError::JobNotFound(job_id))?;
        if !job.status.can_transition_to(status) {
            return Err(IngestError::invalid_transition(
                format!("job {}", job_id),
                job.status,
                status,
            ));
        }
        job.status = status;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        report: Option<&FinalReport>,
        error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(IngestError::JobNotFound(job_id))?;
        if !job.status.can_transition_to(status) {
            return Err(IngestError::invalid_transition(
                format!("job {}", job_id),
                job.status,
                status,
            ));
        }
        job.status = status;
        job.final_result = report.cloned();
        job.error = error.map(str::to_string);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<JobRecord> {
        self.lock()?
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(IngestError::JobNotFound(job_id))
    }

    async fn list_chunks(
        &self,
        job_id: Uuid,
        source: Option<SourceId>,
        status: Option<ChunkStatus>,
    ) -> Result<Vec<ChunkProgress>> {
        let state = self.lock()?;
        Ok(state
            .chunks
            .values()
            .filter(|c| c.job_id == job_id)
            .filter(|c| source.map_or(true, |s| c.source == s))
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect())
    }

    async fn list_unfinished_jobs(&self) -> Result<Vec<JobRecord>> {
        let state = self.lock()?;
        let mut jobs: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|job| job.status.is_unfinished())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn reset_stale_chunks(&self, job_id: Uuid, started_before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock()?;
        let mut reset = 0;
        for chunk in state.chunks.values_mut().filter(|c| c.job_id == job_id) {
            let stale = chunk.status == ChunkStatus::Processing
                && chunk.started_at.map_or(true, |started| started <= started_before);
            if stale {
                chunk.reset_to_pending();
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn purge_jobs(&self, updated_before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock()?;
        let expired: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|job| !job.status.is_unfinished() && job.updated_at < updated_before)
            .map(|job| job.job_id)
            .collect();

        for job_id in &expired {
            state.jobs.remove(job_id);
            state.chunks.retain(|(id, _, _), _| id != job_id);
            state.chunk_slots.retain(|_, (id, _, _)| id != job_id);
        }
        Ok(expired.len() as u64)
    }
}

#[async_trait]
impl ChunkCache for MemoryStore {
    async fn get(&self, key: &ChunkKey) -> Result<Option<CachedChunk>> {
        let cache_key = key.cache_key();
        let mut state = self.lock()?;
        let now = Utc::now();

        match state.cache.get(&cache_key) {
            Some(entry) if entry.is_expired(now) => {
                state.cache.remove(&cache_key);
                Ok(None)
            },
            Some(entry) => Ok(Some(entry.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &ChunkKey, payload: &Value, ttl: Option<Duration>) -> Result<()> {
        let now = Utc::now();
        let entry = CachedChunk {
            cache_key: key.cache_key(),
            source: key.source,
            window: key.window,
            payload: payload.clone(),
            cached_at: now,
            expires_at: expires_at(now, ttl.unwrap_or(self.default_ttl)),
        };
        self.lock()?.cache.insert(entry.cache_key.clone(), entry);
        Ok(())
    }

    async fn invalidate(&self, pattern: &str) -> Result<u64> {
        let mut state = self.lock()?;
        let before = state.cache.len();
        state.cache.retain(|key, _| !glob_match(pattern, key));
        Ok((before - state.cache.len()) as u64)
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let before = state.cache.len();
        state.cache.retain(|_, entry| !entry.is_expired(now));
        Ok((before - state.cache.len()) as u64)
    }

    async fn stats(&self) -> Result<CacheStats> {
        let state = self.lock()?;
        let now = Utc::now();
        let total = state.cache.len() as u64;
        let expired = state.cache.values().filter(|e| e.is_expired(now)).count() as u64;
        Ok(CacheStats {
            total_entries: total,
            expired_entries: expired,
            valid_entries: total - expired,
        })
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_hash(&self, key: &EntityKey) -> Result<Option<String>> {
        Ok(self
            .lock()?
            .records
            .get(key)
            .map(|record| record.content_hash.clone()))
    }

    async fn get_record(&self, key: &EntityKey) -> Result<Option<ContentRecord>> {
        Ok(self.lock()?.records.get(key).cloned())
    }

    async fn write_record(
        &self,
        key: &EntityKey,
        fields: &Value,
        new_hash: &str,
        expected_hash: Option<&str>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let current = state.records.get(key).map(|r| r.content_hash.as_str());
        if current != expected_hash {
            return Err(IngestError::write_conflict(
                key.to_string(),
                format!(
                    "expected hash {:?}, found {:?}",
                    expected_hash,
                    current
                ),
            ));
        }

        state.records.insert(
            key.clone(),
            ContentRecord {
                key: key.clone(),
                fields: fields.clone(),
                content_hash: new_hash.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn count_records(&self, source: Option<SourceId>) -> Result<u64> {
        let state = self.lock()?;
        Ok(state
            .records
            .keys()
            .filter(|key| source.map_or(true, |s| key.source == s))
            .count() as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(source: SourceId, from: &str, to: &str) -> ChunkKey {
        ChunkKey::new(source, DateWindow::parse(from, to).unwrap(), &BTreeMap::new())
    }

    #[tokio::test]
    async fn test_cache_put_get_and_expiry() {
        let store = MemoryStore::new();
        let k = key(SourceId::Ozon, "2024-01-01", "2024-01-31");

        store.put(&k, &json!({"rows": [1, 2]}), None).await.unwrap();
        let hit = store.get(&k).await.unwrap().unwrap();
        assert_eq!(hit.payload, json!({"rows": [1, 2]}));

        store.put(&k, &json!({"rows": []}), Some(Duration::ZERO)).await.unwrap();
        assert!(store.get(&k).await.unwrap().is_none());
        assert_eq!(store.stats().await.unwrap().total_entries, 0);
    }

    #[tokio::test]
    async fn test_cache_invalidate_by_pattern() {
        let store = MemoryStore::new();
        store.put(&key(SourceId::Ozon, "2024-03-01", "2024-03-31"), &json!(1), None).await.unwrap();
        store.put(&key(SourceId::Ozon, "2024-04-01", "2024-04-30"), &json!(2), None).await.unwrap();
        store
            .put(&key(SourceId::Wildberries, "2024-03-01", "2024-03-31"), &json!(3), None)
            .await
            .unwrap();

        assert_eq!(store.invalidate("ozon:2024-03-*").await.unwrap(), 1);
        assert_eq!(store.invalidate("*:2024-03-*").await.unwrap(), 1);
        assert_eq!(store.stats().await.unwrap().total_entries, 1);
    }

    #[tokio::test]
    async fn test_cleanup_expired_counts() {
        let store = MemoryStore::new().with_cache_ttl(Duration::ZERO);
        store.put(&key(SourceId::Ozon, "2024-01-01", "2024-01-31"), &json!(1), None).await.unwrap();
        store
            .put(&key(SourceId::Ozon, "2024-02-01", "2024-02-29"), &json!(2), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.expired_entries, 1);
        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        assert_eq!(store.stats().await.unwrap().valid_entries, 1);
    }
}
