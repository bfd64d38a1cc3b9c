//! Idempotent record writes keyed by content hash
//!
//! A record is written only when its canonical content hash differs from the
//! stored one. Re-ingesting an unchanged period therefore performs zero
//! effective writes, while corrected upstream data lands exactly once.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use salesync_common::checksum::content_hash;
use salesync_common::SourceId;

use crate::error::Result;

use super::types::{ContentRecord, EntityKey, NormalizedRecord};

/// Persistence seam for content records
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_hash(&self, key: &EntityKey) -> Result<Option<String>>;

    async fn get_record(&self, key: &EntityKey) -> Result<Option<ContentRecord>>;

    /// Compare-and-swap write.
    ///
    /// Succeeds only if the stored hash still equals `expected_hash`
    /// (`None` meaning "no record yet"); otherwise fails with `WriteConflict`.
    async fn write_record(
        &self,
        key: &EntityKey,
        fields: &Value,
        new_hash: &str,
        expected_hash: Option<&str>,
    ) -> Result<()>;

    async fn count_records(&self, source: Option<SourceId>) -> Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub written: bool,
    pub content_hash: String,
}

/// Batch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertStats {
    pub written: u64,
    pub unchanged: u64,
}

impl UpsertStats {
    pub fn merge(&mut self, other: &UpsertStats) {
        self.written += other.written;
        self.unchanged += other.unchanged;
    }
}

#[derive(Clone)]
pub struct IdempotentUpsertWriter {
    store: Arc<dyn RecordStore>,
}

impl IdempotentUpsertWriter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, key: &EntityKey, fields: &Value) -> Result<UpsertOutcome> {
        let new_hash = content_hash(fields);
        let stored = self.store.get_hash(key).await?;

        if stored.as_deref() == Some(new_hash.as_str()) {
            debug!(key = %key, "Record unchanged, skipping write");
            return Ok(UpsertOutcome {
                written: false,
                content_hash: new_hash,
            });
        }

        self.store
            .write_record(key, fields, &new_hash, stored.as_deref())
            .await
            .inspect_err(|e| warn!(key = %key, error = %e, "Record write failed"))?;

        Ok(UpsertOutcome {
            written: true,
            content_hash: new_hash,
        })
    }

    /// Upsert every record in order; the first error aborts the batch
    pub async fn upsert_batch(&self, records: &[NormalizedRecord]) -> Result<UpsertStats> {
        let mut stats = UpsertStats::default();
        for record in records {
            if self.upsert(&record.key, &record.fields).await?.written {
                stats.written += 1;
            } else {
                stats.unchanged += 1;
            }
        }
        Ok(stats)
    }
}
