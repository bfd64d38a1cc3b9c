//! Typed per-chunk results and the aggregated job report
//!
//! Money is carried in minor currency units (kopecks) so that summing
//! chunk results is exact and order-independent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use salesync_common::{DateWindow, SourceId};

use crate::config::SourceFailurePolicy;

use super::types::{ChunkProgress, ChunkStatus, JobStatus};

/// Partial totals from one Wildberries sales-report window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WbChunkResult {
    pub records: u64,
    pub sales_count: u64,
    pub returns_count: u64,
    pub revenue_minor: i64,
    pub returns_minor: i64,
    pub commission_minor: i64,
    pub logistics_minor: i64,
    pub payout_minor: i64,
}

impl WbChunkResult {
    pub fn merge(&mut self, other: &WbChunkResult) {
        self.records += other.records;
        self.sales_count += other.sales_count;
        self.returns_count += other.returns_count;
        self.revenue_minor += other.revenue_minor;
        self.returns_minor += other.returns_minor;
        self.commission_minor += other.commission_minor;
        self.logistics_minor += other.logistics_minor;
        self.payout_minor += other.payout_minor;
    }
}

/// Partial totals from one Ozon finance-transactions window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OzonChunkResult {
    pub records: u64,
    pub operations: u64,
    pub orders_count: u64,
    pub returns_count: u64,
    pub revenue_minor: i64,
    pub commission_minor: i64,
    pub services_minor: i64,
    pub payout_minor: i64,
}

impl OzonChunkResult {
    pub fn merge(&mut self, other: &OzonChunkResult) {
        self.records += other.records;
        self.operations += other.operations;
        self.orders_count += other.orders_count;
        self.returns_count += other.returns_count;
        self.revenue_minor += other.revenue_minor;
        self.commission_minor += other.commission_minor;
        self.services_minor += other.services_minor;
        self.payout_minor += other.payout_minor;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ChunkResult {
    Wildberries(WbChunkResult),
    Ozon(OzonChunkResult),
}

impl ChunkResult {
    /// Zero totals of the variant belonging to `source`
    pub fn empty(source: SourceId) -> Self {
        match source {
            SourceId::Wildberries => ChunkResult::Wildberries(WbChunkResult::default()),
            SourceId::Ozon => ChunkResult::Ozon(OzonChunkResult::default()),
        }
    }

    pub fn source(&self) -> SourceId {
        match self {
            ChunkResult::Wildberries(_) => SourceId::Wildberries,
            ChunkResult::Ozon(_) => SourceId::Ozon,
        }
    }

    pub fn records(&self) -> u64 {
        match self {
            ChunkResult::Wildberries(r) => r.records,
            ChunkResult::Ozon(r) => r.records,
        }
    }

    /// Add `other` into `self`. Returns false and leaves `self` untouched
    /// when the variants belong to different sources.
    pub fn merge(&mut self, other: &ChunkResult) -> bool {
        match (self, other) {
            (ChunkResult::Wildberries(a), ChunkResult::Wildberries(b)) => {
                a.merge(b);
                true
            },
            (ChunkResult::Ozon(a), ChunkResult::Ozon(b)) => {
                a.merge(b);
                true
            },
            _ => false,
        }
    }

    /// Cross-source view of these totals
    pub fn combined(&self) -> CombinedTotals {
        match self {
            ChunkResult::Wildberries(r) => CombinedTotals {
                records: r.records,
                orders_count: r.sales_count,
                returns_count: r.returns_count,
                revenue_minor: r.revenue_minor - r.returns_minor,
                commission_minor: r.commission_minor,
                fees_minor: r.logistics_minor,
                payout_minor: r.payout_minor,
            },
            ChunkResult::Ozon(r) => CombinedTotals {
                records: r.records,
                orders_count: r.orders_count,
                returns_count: r.returns_count,
                revenue_minor: r.revenue_minor,
                commission_minor: r.commission_minor,
                fees_minor: r.services_minor,
                payout_minor: r.payout_minor,
            },
        }
    }
}

/// Totals comparable across marketplaces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedTotals {
    pub records: u64,
    pub orders_count: u64,
    pub returns_count: u64,
    /// Net of returns
    pub revenue_minor: i64,
    pub commission_minor: i64,
    /// Logistics and marketplace services
    pub fees_minor: i64,
    pub payout_minor: i64,
}

impl CombinedTotals {
    pub fn add(&mut self, other: &CombinedTotals) {
        self.records += other.records;
        self.orders_count += other.orders_count;
        self.returns_count += other.returns_count;
        self.revenue_minor += other.revenue_minor;
        self.commission_minor += other.commission_minor;
        self.fees_minor += other.fees_minor;
        self.payout_minor += other.payout_minor;
    }
}

/// Source-level rollup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTotals {
    pub source: SourceId,
    pub chunks_total: usize,
    pub chunks_succeeded: usize,
    pub chunks_cached: usize,
    pub chunks_failed: usize,
    pub failed: bool,
    pub totals: ChunkResult,
}

/// A window with no successful data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageGap {
    pub source: SourceId,
    pub window: DateWindow,
    pub chunk_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub job_id: Uuid,
    pub period: DateWindow,
    pub sources: Vec<SourceTotals>,
    pub combined: CombinedTotals,
    pub coverage_gaps: Vec<CoverageGap>,
    pub failed_sources: Vec<SourceId>,
    pub generated_at: DateTime<Utc>,
}

impl FinalReport {
    pub fn is_complete(&self) -> bool {
        self.coverage_gaps.is_empty() && self.failed_sources.is_empty()
    }

    pub fn source_totals(&self, source: SourceId) -> Option<&SourceTotals> {
        self.sources.iter().find(|s| s.source == source)
    }
}

/// What a caller polling for the result gets back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FinalResult {
    /// Still running, cancelled, or waiting to be resumed
    Pending { status: JobStatus },
    /// Finished, possibly with coverage gaps
    Completed { report: FinalReport },
    /// A whole source failed, or the job never got past initialization
    Failed {
        report: Option<FinalReport>,
        error: Option<String>,
    },
}

/// Fold chunk progress into the job's report.
///
/// Expects every chunk to be terminal; the processor waits for that before
/// calling it. Chunks that are not `Completed`/`Cached` become coverage
/// gaps. A source is marked failed according to `policy`.
pub fn aggregate(
    job_id: Uuid,
    period: DateWindow,
    sources: &[SourceId],
    chunks: &[ChunkProgress],
    policy: &SourceFailurePolicy,
) -> FinalReport {
    let mut source_totals = Vec::with_capacity(sources.len());
    let mut combined = CombinedTotals::default();
    let mut coverage_gaps = Vec::new();
    let mut failed_sources = Vec::new();

    for source in sources {
        let mut totals = ChunkResult::empty(*source);
        let mut chunks_total = 0;
        let mut chunks_succeeded = 0;
        let mut chunks_cached = 0;
        let mut chunks_failed = 0;

        for chunk in chunks.iter().filter(|c| c.source == *source) {
            chunks_total += 1;

            let merged = match (&chunk.status, &chunk.result) {
                (status, Some(result)) if status.is_success() => totals.merge(result),
                _ => false,
            };

            if merged {
                chunks_succeeded += 1;
                if chunk.status == ChunkStatus::Cached {
                    chunks_cached += 1;
                }
                continue;
            }

            if chunk.status == ChunkStatus::Failed {
                chunks_failed += 1;
            }
            let reason = match chunk.status {
                ChunkStatus::Failed => chunk
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "chunk failed".to_string()),
                status if status.is_success() => "chunk result missing or mismatched".to_string(),
                status => format!("chunk not ingested ({})", status),
            };
            coverage_gaps.push(CoverageGap {
                source: *source,
                window: chunk.window,
                chunk_id: chunk.chunk_id.to_string(),
                reason,
            });
        }

        let failed = policy.is_failed(chunks_succeeded, chunks_total);
        if failed {
            failed_sources.push(*source);
        }
        combined.add(&totals.combined());

        source_totals.push(SourceTotals {
            source: *source,
            chunks_total,
            chunks_succeeded,
            chunks_cached,
            chunks_failed,
            failed,
            totals,
        });
    }

    coverage_gaps.sort_by(|a, b| (a.source, a.window).cmp(&(b.source, b.window)));

    FinalReport {
        job_id,
        period,
        sources: source_totals,
        combined,
        coverage_gaps,
        failed_sources,
        generated_at: Utc::now(),
    }
}
