//! Shared fixtures for salesync-ingest integration tests
//!
//! - `FakeMarketplace`: an in-process `HttpTransport` serving one row per day
//!   for any requested window, with per-window failure injection
//! - `TestConnector`: a `SourceConnector` for the fake marketplace payloads
//! - `Harness`: processor and service wired over any store
//! - `exercise_tracker_contract`: the behavior every `ProgressTracker` must show

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use salesync_common::{DateWindow, SourceId};
use salesync_ingest::config::{
    CircuitBreakerConfig, HttpConfig, ProcessorConfig, RateLimitConfig, RetentionConfig,
};
use salesync_ingest::error::{IngestError, Result};
use salesync_ingest::framework::{
    ChunkCache, ChunkResult, ChunkStatus, ChunkUpdate, Chunker, ConnectorSet, EntityKey,
    IngestionService, JobStatus, NewJob, NormalizedRecord, OzonChunkResult, ProgressTracker,
    RecordStore, SourceConnector, StagedProcessor, WbChunkResult,
};
use salesync_ingest::http::{HttpRequest, HttpResponse, HttpTransport, ResilientHttpClient, TransportError};
use salesync_ingest::resilience::UpstreamRegistry;

pub const MARKETPLACE_URL: &str = "http://marketplace.test/";

/// Amount every generated row carries, in minor units
pub const ROW_AMOUNT_MINOR: i64 = 1_000;

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn window(from: &str, to: &str) -> DateWindow {
    DateWindow::parse(from, to).unwrap()
}

/// Upstream double keyed by `(source, window start)`
#[derive(Default)]
pub struct FakeMarketplace {
    failing: Mutex<HashSet<(SourceId, NaiveDate)>>,
    calls: Mutex<Vec<(SourceId, DateWindow)>>,
    latency: Duration,
}

impl FakeMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Answer 503 for every request of `source` whose window starts at `from`
    pub fn fail_window(&self, source: SourceId, from: NaiveDate) {
        self.failing.lock().unwrap().insert((source, from));
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Every request received, in arrival order
    pub fn calls(&self) -> Vec<(SourceId, DateWindow)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn distinct_windows(&self) -> HashSet<(SourceId, DateWindow)> {
        self.calls().into_iter().collect()
    }

    /// The payload served for one window: a row per day
    pub fn payload(source: SourceId, window: &DateWindow) -> Value {
        let mut rows = Vec::new();
        let mut day = window.from;
        while day <= window.to {
            rows.push(json!({
                "id": format!("{}-{}", source, day),
                "date": day.to_string(),
                "amount_minor": ROW_AMOUNT_MINOR,
            }));
            day = day.checked_add_days(Days::new(1)).unwrap();
        }
        json!({ "rows": rows })
    }
}

fn query_param<'a>(request: &'a HttpRequest, name: &str) -> Option<&'a str> {
    request
        .query
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

#[async_trait]
impl HttpTransport for FakeMarketplace {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let source: SourceId = request
            .url
            .path_segments()
            .and_then(|mut segments| segments.next())
            .and_then(|segment| segment.parse().ok())
            .ok_or_else(|| TransportError::other("unknown source path"))?;
        let from = query_param(request, "dateFrom").map(date).unwrap();
        let to = query_param(request, "dateTo").map(date).unwrap();
        let requested = DateWindow::new(from, to);

        self.calls.lock().unwrap().push((source, requested));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.failing.lock().unwrap().contains(&(source, from)) {
            return Ok(HttpResponse::new(503, "upstream unavailable"));
        }

        let body = serde_json::to_vec(&Self::payload(source, &requested)).unwrap();
        Ok(HttpResponse::new(200, body).with_header("Content-Type", "application/json"))
    }
}

/// Connector for the fake marketplace's `{"rows": [...]}` payloads
pub struct TestConnector {
    source: SourceId,
    base: Url,
}

impl TestConnector {
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            base: Url::parse(MARKETPLACE_URL).unwrap(),
        }
    }
}

impl SourceConnector for TestConnector {
    fn source_id(&self) -> SourceId {
        self.source
    }

    fn build_request(&self, window: &DateWindow) -> Result<HttpRequest> {
        let url = self
            .base
            .join(&format!("{}/report", self.source))
            .map_err(|e| IngestError::config(e.to_string()))?;
        Ok(HttpRequest::get(url)
            .query("dateFrom", window.from.to_string())
            .query("dateTo", window.to.to_string()))
    }

    fn normalize(&self, window: &DateWindow, payload: &Value) -> Result<Vec<NormalizedRecord>> {
        let rows = payload["rows"]
            .as_array()
            .ok_or_else(|| IngestError::normalize(self.source, window, "missing rows"))?;

        rows.iter()
            .map(|row| {
                let id = row["id"]
                    .as_str()
                    .ok_or_else(|| IngestError::normalize(self.source, window, "row without id"))?;
                let day = row["date"]
                    .as_str()
                    .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                    .ok_or_else(|| IngestError::normalize(self.source, window, "row without date"))?;
                Ok(NormalizedRecord {
                    key: EntityKey::new(day, self.source, id),
                    fields: row.clone(),
                })
            })
            .collect()
    }

    fn summarize(&self, _window: &DateWindow, records: &[NormalizedRecord]) -> ChunkResult {
        let count = records.len() as u64;
        let amount: i64 = records
            .iter()
            .filter_map(|r| r.fields["amount_minor"].as_i64())
            .sum();

        match self.source {
            SourceId::Wildberries => ChunkResult::Wildberries(WbChunkResult {
                records: count,
                sales_count: count,
                revenue_minor: amount,
                payout_minor: amount,
                ..WbChunkResult::default()
            }),
            SourceId::Ozon => ChunkResult::Ozon(OzonChunkResult {
                records: count,
                operations: count,
                orders_count: count,
                revenue_minor: amount,
                payout_minor: amount,
                ..OzonChunkResult::default()
            }),
        }
    }
}

/// Partial result a successful fetch of `window` produces
pub fn expected_result(source: SourceId, window: &DateWindow) -> ChunkResult {
    let connector = TestConnector::new(source);
    let records = connector
        .normalize(window, &FakeMarketplace::payload(source, window))
        .unwrap();
    connector.summarize(window, &records)
}

/// Fast retries so failing windows settle quickly in real time
pub fn fast_http_config() -> HttpConfig {
    HttpConfig {
        request_timeout: Duration::from_secs(5),
        max_attempts: 2,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        jitter_min: 1.0,
        jitter_max: 1.0,
        ..HttpConfig::default()
    }
}

pub fn generous_upstreams() -> Arc<UpstreamRegistry> {
    Arc::new(UpstreamRegistry::new(
        CircuitBreakerConfig {
            fail_threshold: 50,
            reset_timeout: Duration::from_secs(60),
        },
        RateLimitConfig {
            rate_per_second: 10_000.0,
            capacity: 10_000.0,
        },
    )
    .unwrap())
}

pub struct Harness {
    pub marketplace: Arc<FakeMarketplace>,
    pub processor: Arc<StagedProcessor>,
    pub service: IngestionService,
    pub upstreams: Arc<UpstreamRegistry>,
}

/// Wiring overrides for `harness_with`
pub struct HarnessOptions {
    pub config: ProcessorConfig,
    pub upstreams: Arc<UpstreamRegistry>,
    /// Record sink used instead of the store itself
    pub records: Option<Arc<dyn RecordStore>>,
}

impl HarnessOptions {
    pub fn workers(workers: usize) -> Self {
        Self {
            config: ProcessorConfig {
                worker_count: workers,
                inter_chunk_delay: Duration::ZERO,
                settle_interval: Duration::from_millis(10),
                ..ProcessorConfig::default()
            },
            upstreams: generous_upstreams(),
            records: None,
        }
    }
}

pub fn harness<S>(store: Arc<S>, marketplace: Arc<FakeMarketplace>, workers: usize) -> Harness
where
    S: ProgressTracker + ChunkCache + RecordStore + 'static,
{
    harness_with(store, marketplace, HarnessOptions::workers(workers))
}

pub fn harness_with<S>(store: Arc<S>, marketplace: Arc<FakeMarketplace>, options: HarnessOptions) -> Harness
where
    S: ProgressTracker + ChunkCache + RecordStore + 'static,
{
    let client = Arc::new(ResilientHttpClient::new(
        marketplace.clone(),
        options.upstreams.clone(),
        fast_http_config(),
    ));

    let connectors = ConnectorSet::new()
        .with(Arc::new(TestConnector::new(SourceId::Wildberries)))
        .with(Arc::new(TestConnector::new(SourceId::Ozon)));

    let records: Arc<dyn RecordStore> = match options.records {
        Some(records) => records,
        None => store.clone(),
    };

    let processor = Arc::new(StagedProcessor::new(
        store.clone(),
        store.clone(),
        records,
        client,
        connectors,
        Chunker::default(),
        options.config,
    ));

    let service = IngestionService::new(processor.clone(), store.clone(), store, RetentionConfig::default())
        .with_poll_interval(Duration::from_millis(10));

    Harness {
        marketplace,
        processor,
        service,
        upstreams: options.upstreams,
    }
}

/// Behavior shared by every `ProgressTracker` implementation
pub async fn exercise_tracker_contract(tracker: &dyn ProgressTracker) {
    let job_id = Uuid::new_v4();
    let job = tracker
        .init_job(NewJob {
            job_id,
            period: window("2024-01-01", "2024-02-29"),
            sources: vec![SourceId::Wildberries, SourceId::Ozon],
            notify_target: Some("ops@example.test".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Initialized);

    let missing = tracker.get_job(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(missing, IngestError::JobNotFound(_)));

    let mut plan = BTreeMap::new();
    plan.insert(
        SourceId::Ozon,
        vec![window("2024-01-01", "2024-01-31"), window("2024-02-01", "2024-02-29")],
    );
    plan.insert(
        SourceId::Wildberries,
        vec![window("2024-01-01", "2024-01-31"), window("2024-02-01", "2024-02-29")],
    );
    let planned = tracker.plan_chunks(job_id, &plan).await.unwrap();
    assert_eq!(planned.len(), 4);
    assert!(tracker.plan_chunks(job_id, &plan).await.is_err());

    let stored = tracker.get_job(job_id).await.unwrap();
    assert_eq!(stored.chunk_counts.get(&SourceId::Ozon), Some(&2));
    assert_eq!(stored.notify_target.as_deref(), Some("ops@example.test"));

    // Wildberries comes first regardless of insertion order
    let chunks = tracker.list_chunks(job_id, None, None).await.unwrap();
    let order: Vec<(SourceId, u32)> = chunks.iter().map(|c| (c.source, c.index)).collect();
    assert_eq!(
        order,
        vec![
            (SourceId::Wildberries, 0),
            (SourceId::Wildberries, 1),
            (SourceId::Ozon, 0),
            (SourceId::Ozon, 1),
        ]
    );

    let first = &chunks[0];
    let err = tracker
        .update_chunk(&first.chunk_id, ChunkUpdate::completed(expected_result(first.source, &first.window), "k"))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::InvalidTransition { .. }));

    tracker
        .update_chunk(&first.chunk_id, ChunkUpdate::processing())
        .await
        .unwrap();
    // A second claim of the same chunk loses
    assert!(tracker
        .update_chunk(&first.chunk_id, ChunkUpdate::processing())
        .await
        .is_err());
    tracker
        .update_chunk(
            &first.chunk_id,
            ChunkUpdate::completed(expected_result(first.source, &first.window), "wb-key"),
        )
        .await
        .unwrap();

    let second = &chunks[1];
    tracker
        .update_chunk(&second.chunk_id, ChunkUpdate::processing())
        .await
        .unwrap();

    let completed = tracker
        .list_chunks(job_id, Some(SourceId::Wildberries), Some(ChunkStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].result_ref.as_deref(), Some("wb-key"));
    assert_eq!(
        completed[0].result,
        Some(expected_result(first.source, &first.window))
    );
    assert!(completed[0].started_at.is_some());
    assert!(completed[0].completed_at.is_some());

    // A cutoff in the past leaves the fresh claim alone
    let reset = tracker
        .reset_stale_chunks(job_id, Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(reset, 0);
    let reset = tracker
        .reset_stale_chunks(job_id, Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(reset, 1);
    let pending = tracker
        .list_chunks(job_id, None, Some(ChunkStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 3);

    tracker
        .update_job_status(job_id, JobStatus::StageRunning(SourceId::Wildberries))
        .await
        .unwrap();
    let unfinished = tracker.list_unfinished_jobs().await.unwrap();
    assert!(unfinished.iter().any(|j| j.job_id == job_id));

    tracker
        .finish_job(job_id, JobStatus::Failed, None, Some("stopped by test"))
        .await
        .unwrap();
    let failed = tracker.get_job(job_id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("stopped by test"));
    assert!(tracker
        .update_job_status(job_id, JobStatus::Aggregating)
        .await
        .is_err());
    assert!(!tracker
        .list_unfinished_jobs()
        .await
        .unwrap()
        .iter()
        .any(|j| j.job_id == job_id));

    // Retention: only finished jobs older than the cutoff go
    assert_eq!(tracker.purge_jobs(Utc::now() - chrono::Duration::days(1)).await.unwrap(), 0);
    assert_eq!(tracker.purge_jobs(Utc::now() + chrono::Duration::seconds(1)).await.unwrap(), 1);
    assert!(tracker.get_job(job_id).await.is_err());
    assert!(tracker.list_chunks(job_id, None, None).await.unwrap().is_empty());
}
