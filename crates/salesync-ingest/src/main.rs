//! Salesync Ingest - operations tool for the ingestion database

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use salesync_common::logging::{init_logging, LogConfig, LogLevel};
use salesync_ingest::config::IngestConfig;
use salesync_ingest::framework::{ChunkCache, JobProgress, ProgressTracker};
use salesync_ingest::storage::SqliteStore;
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "salesync-ingest")]
#[command(author, version, about = "Salesync ingestion operations tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Override the database URL from configuration
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending schema migrations
    Migrate,

    /// Show a job's status, progress and result as JSON
    Status {
        #[arg(long)]
        job_id: Uuid,
    },

    /// Chunk cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Delete finished jobs older than the retention period
    Purge {
        /// Retention in days (defaults to configuration)
        #[arg(long)]
        days: Option<i64>,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Remove expired entries
    Cleanup,

    /// Remove entries whose key matches a glob pattern, e.g. "ozon:2024-03-*"
    Invalidate {
        #[arg(long)]
        pattern: String,
    },

    /// Print entry counts
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("salesync-ingest")
        .build()
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    let mut config = IngestConfig::from_env().context("Failed to load configuration")?;
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }

    let store = SqliteStore::connect(&config.database)
        .await
        .with_context(|| format!("Failed to open database {}", config.database.url))?;
    store.migrate().await.context("Migration failed")?;

    match cli.command {
        Command::Migrate => {
            info!(url = %config.database.url, "Database schema is up to date");
        },
        Command::Status { job_id } => {
            let job = store.get_job(job_id).await?;
            let chunks = store.list_chunks(job_id, None, None).await?;
            let progress = JobProgress::from_chunks(&job, &chunks, config.processor.worker_count);

            let output = serde_json::json!({
                "job": job,
                "progress": progress,
                "result": job.final_result(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        },
        Command::Cache { action } => match action {
            CacheAction::Cleanup => {
                let removed = store.cleanup_expired().await?;
                info!(removed, "Expired cache entries removed");
            },
            CacheAction::Invalidate { pattern } => {
                let removed = store.invalidate(&pattern).await?;
                info!(pattern = %pattern, removed, "Cache entries invalidated");
            },
            CacheAction::Stats => {
                let stats = store.stats().await?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            },
        },
        Command::Purge { days } => {
            let days = days.unwrap_or(config.retention.job_retention_days);
            let cutoff = Utc::now() - chrono::Duration::days(days);
            let purged = store.purge_jobs(cutoff).await?;
            info!(purged, retention_days = days, "Old jobs purged");
        },
    }

    Ok(())
}
