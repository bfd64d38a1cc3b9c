//! Storage backends for progress tracking, the chunk cache and records
//!
//! Both stores implement `ProgressTracker`, `ChunkCache` and `RecordStore`,
//! so one instance can back every seam of the processor.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Expiry instant for an entry cached at `now`, saturating on overflow
pub(crate) fn expires_at(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
