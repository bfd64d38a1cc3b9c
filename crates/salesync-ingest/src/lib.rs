//! Salesync Ingest Library
//!
//! Resilient, resumable ingestion of marketplace financial data over long
//! date ranges.
//!
//! # Sources
//!
//! - **Wildberries**: sales and returns reports, fetched in fixed-size windows
//! - **Ozon**: transaction operations, fetched per calendar month
//!
//! A job is split into per-source chunks, each chunk is fetched through a
//! rate-limited, circuit-broken HTTP client (or served from the chunk cache),
//! normalized records are written idempotently and every chunk's progress is
//! stored so an interrupted job picks up where it stopped.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use salesync_common::{DateWindow, SourceId};
//! use salesync_ingest::config::IngestConfig;
//! use salesync_ingest::framework::{Chunker, ConnectorSet, IngestionService, StagedProcessor};
//! use salesync_ingest::http::{ReqwestTransport, ResilientHttpClient};
//! use salesync_ingest::resilience::UpstreamRegistry;
//! use salesync_ingest::storage::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let store = Arc::new(SqliteStore::connect(&config.database).await?);
//!     store.migrate().await?;
//!
//!     let upstreams = Arc::new(UpstreamRegistry::new(config.circuit_breaker, config.rate_limit)?);
//!     let transport = Arc::new(ReqwestTransport::new(config.http.request_timeout)?);
//!     let client = Arc::new(ResilientHttpClient::new(transport, upstreams, config.http.clone()));
//!
//!     // Connectors for real upstreams are supplied by the embedding application
//!     let connectors = ConnectorSet::new();
//!
//!     let processor = Arc::new(StagedProcessor::new(
//!         store.clone(),
//!         store.clone(),
//!         store.clone(),
//!         client,
//!         connectors,
//!         Chunker::new(config.windows.clone()),
//!         config.processor.clone(),
//!     ));
//!     let service = IngestionService::new(processor, store.clone(), store, config.retention);
//!
//!     let period = DateWindow::parse("2024-01-01", "2024-03-31")?;
//!     let job_id = service.submit_job(period, &[SourceId::Wildberries, SourceId::Ozon], None).await?;
//!     println!("submitted {}", job_id);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod error;
pub mod framework;
pub mod http;
pub mod resilience;
pub mod storage;

pub use config::IngestConfig;
pub use error::{IngestError, Result};
