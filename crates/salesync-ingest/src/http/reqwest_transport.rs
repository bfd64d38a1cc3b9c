//! [`HttpTransport`] backed by `reqwest`

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{IngestError, Result};

use super::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, TransportError};

const USER_AGENT: &str = concat!("salesync-ingest/", env!("CARGO_PKG_VERSION"));

/// Production transport; holds one pooled `reqwest::Client`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    /// Map a reqwest failure to a transport error kind. Builder, redirect
    /// and decode errors stay `Other` and are not retried.
    fn classify(error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::timeout(error.to_string())
        } else if error.is_connect() {
            TransportError::connect(error.to_string())
        } else if error.is_body() || error.is_request() {
            TransportError::interrupted(error.to_string())
        } else {
            TransportError::other(error.to_string())
        }
    }

    /// Reading the body after the head arrived only fails when the
    /// connection stalls or drops
    fn classify_body(error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::timeout(error.to_string())
        } else {
            TransportError::interrupted(error.to_string())
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };

        let mut builder = self
            .client
            .request(method, request.url.clone())
            .timeout(self.timeout);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(Self::classify)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(Self::classify_body)?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
