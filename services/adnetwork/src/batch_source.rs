//! Where the poller gets its batches from.
//!
//! When ingestion and polling share a process the poller drains the queue
//! directly. `HttpBatchSource` polls `GET /id` instead, for a poller that sits
//! on the other side of a network boundary.

use crate::identifier::{Identifier, IdentifierError};
use crate::ingest_api::{IngestionEndpoint, PollBatch};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Transient failures reaching the queue
#[derive(Error, Debug)]
pub enum PollError {
    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Poll request failed: {0}")]
    Transport(String),

    #[error("Unexpected poll response status {0}")]
    UnexpectedStatus(u16),

    #[error("Failed to decode poll response: {0}")]
    Decode(String),

    #[error("Poll response carried an invalid identifier: {0}")]
    InvalidIdentifier(#[from] IdentifierError),
}

/// Supplies one batch of identifiers per tick
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchSource: Send + Sync {
    async fn poll_batch(&self) -> Result<PollBatch, PollError>;

    /// Source type for logging
    fn source_type(&self) -> &'static str;
}

/// Drains the in-process queue
pub struct LocalBatchSource {
    endpoint: IngestionEndpoint,
}

impl LocalBatchSource {
    pub fn new(endpoint: IngestionEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl BatchSource for LocalBatchSource {
    async fn poll_batch(&self) -> Result<PollBatch, PollError> {
        Ok(self.endpoint.poll_batch())
    }

    fn source_type(&self) -> &'static str {
        "local"
    }
}

/// Polls the ingestion endpoint over HTTP
pub struct HttpBatchSource {
    client: reqwest::Client,
    url: String,
}

impl HttpBatchSource {
    /// `addr` is the endpoint's bound address; wildcard addresses are polled
    /// through loopback.
    pub fn new(addr: SocketAddr, read_timeout: Duration) -> Result<Self, PollError> {
        let client = reqwest::Client::builder()
            .timeout(read_timeout)
            .build()
            .map_err(|e| PollError::Client(e.to_string()))?;

        let host = match addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        let url = format!("http://{}/id", SocketAddr::new(host, addr.port()));

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BatchSource for HttpBatchSource {
    async fn poll_batch(&self) -> Result<PollBatch, PollError> {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                debug!(url = %self.url, "Poll timed out, treating as empty");
                return Ok(PollBatch::Empty);
            }
            Err(e) => return Err(PollError::Transport(e.to_string())),
        };

        match response.status() {
            StatusCode::NO_CONTENT => Ok(PollBatch::Empty),
            StatusCode::OK => {
                let raw: Vec<String> = match response.json().await {
                    Ok(raw) => raw,
                    Err(e) if e.is_timeout() => {
                        debug!(url = %self.url, "Poll body timed out, treating as empty");
                        return Ok(PollBatch::Empty);
                    }
                    Err(e) => return Err(PollError::Decode(e.to_string())),
                };
                let ids = raw
                    .into_iter()
                    .map(Identifier::parse)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(PollBatch::from_drained(ids))
            }
            other => Err(PollError::UnexpectedStatus(other.as_u16())),
        }
    }

    fn source_type(&self) -> &'static str {
        "http"
    }
}
