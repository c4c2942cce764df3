//! HTTP ingestion endpoint.
//!
//! - `POST /id/{identifier}` queues one identifier
//! - `GET /id` drains the queue: 200 with a JSON array, or 204 when empty
//! - `GET /health` reports liveness and queue depth

use crate::config::InputServiceConfig;
use crate::id_queue::IdentifierQueue;
use crate::identifier::{Identifier, IdentifierError};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Result of draining the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollBatch {
    /// Nothing was queued
    Empty,
    /// Every queued identifier, in arrival order. Never empty.
    Batch(Vec<Identifier>),
}

impl PollBatch {
    pub fn from_drained(ids: Vec<Identifier>) -> Self {
        if ids.is_empty() {
            PollBatch::Empty
        } else {
            PollBatch::Batch(ids)
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PollBatch::Empty => 0,
            PollBatch::Batch(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, PollBatch::Empty)
    }

    pub fn into_ids(self) -> Vec<Identifier> {
        match self {
            PollBatch::Empty => Vec::new(),
            PollBatch::Batch(ids) => ids,
        }
    }
}

/// Accepts identifiers and hands queued batches to the poller
#[derive(Debug, Clone, Default)]
pub struct IngestionEndpoint {
    queue: Arc<IdentifierQueue>,
}

impl IngestionEndpoint {
    pub fn new(queue: Arc<IdentifierQueue>) -> Self {
        Self { queue }
    }

    /// Validate and queue one identifier
    pub fn register(&self, raw: impl Into<String>) -> Result<Identifier, IdentifierError> {
        let id = Identifier::parse(raw)?;
        self.queue.enqueue(id.clone());
        Ok(id)
    }

    /// Drain the queue
    pub fn poll_batch(&self) -> PollBatch {
        PollBatch::from_drained(self.queue.drain_all())
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub endpoint: IngestionEndpoint,
    pub service_name: Arc<str>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Create the ingestion router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/id", get(poll_ids))
        .route("/id/:id", post(register_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": &*state.service_name,
        "queued_ids": state.endpoint.queue_depth(),
    }))
}

/// Register a new identifier
async fn register_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    match state.endpoint.register(id) {
        Ok(id) => {
            debug!(identifier = %id, "Identifier queued");
            metrics::counter!("adnetwork.ids.registered").increment(1);
            Ok(StatusCode::OK)
        }
        Err(e) => {
            warn!(error = %e, "Rejected identifier");
            metrics::counter!("adnetwork.ids.rejected").increment(1);
            Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: e.to_string(),
                    code: "INVALID_IDENTIFIER".to_string(),
                }),
            ))
        }
    }
}

/// Drain queued identifiers
async fn poll_ids(State(state): State<AppState>) -> Response {
    match state.endpoint.poll_batch() {
        PollBatch::Empty => StatusCode::NO_CONTENT.into_response(),
        PollBatch::Batch(ids) => (StatusCode::OK, Json(ids)).into_response(),
    }
}

/// Ingestion listener bound to its socket
pub struct IngestServer {
    listener: TcpListener,
    router: Router,
    local_addr: SocketAddr,
}

impl IngestServer {
    /// Bind the listener. Port 0 picks an ephemeral port.
    pub async fn bind(state: AppState, config: &InputServiceConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind ingestion endpoint to {}", addr))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read bound address")?;

        info!(address = %local_addr, "Identifier input server bound");

        Ok(Self {
            listener,
            router: create_router(state),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(address = %self.local_addr, "Identifier input server running");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .context("Ingestion server error")?;

        Ok(())
    }
}
