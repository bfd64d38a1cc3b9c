//! Terminal-state notification hook

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;

use super::results::FinalResult;
use super::types::JobRecord;

/// Called once when a job reaches `Completed` or `Failed`
#[async_trait]
pub trait JobNotifier: Send + Sync {
    async fn notify(&self, job: &JobRecord, result: &FinalResult) -> Result<()>;
}

/// Emits one structured log line per finished job
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl JobNotifier for LogNotifier {
    async fn notify(&self, job: &JobRecord, result: &FinalResult) -> Result<()> {
        let (gaps, failed_sources) = match result {
            FinalResult::Completed { report } => (report.coverage_gaps.len(), report.failed_sources.len()),
            FinalResult::Failed { report: Some(report), .. } => {
                (report.coverage_gaps.len(), report.failed_sources.len())
            },
            _ => (0, 0),
        };

        info!(
            job_id = %job.job_id,
            status = %job.status,
            notify_target = job.notify_target.as_deref().unwrap_or("-"),
            period = %job.period,
            coverage_gaps = gaps,
            failed_sources,
            "Ingestion job finished"
        );
        Ok(())
    }
}
