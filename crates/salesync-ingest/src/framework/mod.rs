//! Resilient chunked ingestion framework
//!
//! Splits a period into per-source windows, fetches each window through the
//! resilient HTTP client (consulting the chunk cache first), writes
//! normalized records idempotently and tracks every chunk durably so jobs
//! can be resumed after a crash.

pub mod cache;
pub mod chunker;
pub mod connector;
pub mod notifier;
pub mod processor;
pub mod progress;
pub mod results;
pub mod service;
pub mod types;
pub mod upsert;

// Re-export commonly used types
pub use cache::{CacheStats, ChunkCache};
pub use chunker::{split_period, Chunker};
pub use connector::{ConnectorSet, SourceConnector};
pub use notifier::{JobNotifier, LogNotifier};
pub use processor::{StageStats, StagedProcessor};
pub use progress::{JobProgress, ProgressTracker, SourceProgress};
pub use results::{
    ChunkResult, CombinedTotals, CoverageGap, FinalReport, FinalResult, OzonChunkResult,
    SourceTotals, WbChunkResult,
};
pub use service::{IngestionService, MaintenanceReport};
pub use types::{
    CachedChunk, ChunkId, ChunkKey, ChunkProgress, ChunkStatus, ChunkUpdate, ContentRecord,
    EntityKey, JobRecord, JobStatus, NewJob, NormalizedRecord,
};
pub use upsert::{IdempotentUpsertWriter, RecordStore, UpsertOutcome, UpsertStats};
