//! Per-source request building and normalization
//!
//! Connectors are supplied by collaborators that know each upstream's
//! request and response shapes. The pipeline only calls them through this
//! trait.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use salesync_common::{DateWindow, SourceId};

use crate::error::{IngestError, Result};
use crate::http::{HttpRequest, HttpResponse};

use super::results::ChunkResult;
use super::types::NormalizedRecord;

pub trait SourceConnector: Send + Sync {
    fn source_id(&self) -> SourceId;

    /// Extra request parameters that change the payload for a given window
    /// (folded into the chunk cache key)
    fn request_params(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// The request that fetches one window
    fn build_request(&self, window: &DateWindow) -> Result<HttpRequest>;

    /// Decode a successful response into the raw payload that gets cached
    fn parse_payload(&self, response: &HttpResponse) -> Result<Value> {
        Ok(response.json()?)
    }

    fn normalize(&self, window: &DateWindow, payload: &Value) -> Result<Vec<NormalizedRecord>>;

    /// Partial totals for one window; the variant must match `source_id`
    fn summarize(&self, window: &DateWindow, records: &[NormalizedRecord]) -> ChunkResult;
}

/// Connectors by source
#[derive(Clone, Default)]
pub struct ConnectorSet {
    connectors: HashMap<SourceId, Arc<dyn SourceConnector>>,
}

impl ConnectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector, replacing any previous one for the same source
    pub fn with(mut self, connector: Arc<dyn SourceConnector>) -> Self {
        self.connectors.insert(connector.source_id(), connector);
        self
    }

    pub fn get(&self, source: SourceId) -> Result<Arc<dyn SourceConnector>> {
        self.connectors
            .get(&source)
            .cloned()
            .ok_or(IngestError::ConnectorMissing(source))
    }

    pub fn contains(&self, source: SourceId) -> bool {
        self.connectors.contains_key(&source)
    }
}
