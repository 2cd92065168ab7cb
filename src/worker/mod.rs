//! Upstream worker pool.
//!
//! A bounded pool of concurrent HTTP callers. Each backend gets its own
//! persistent `reqwest::Client` (connection pool with keep-alive) so a slow
//! or dying backend never poisons another backend's connections. All
//! upstream failures are classified at this boundary; retry policy lives in
//! the dispatcher.

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::DispatchConfig;
use crate::registry::BackendId;

/// Broad classification of an upstream failure, used for retry decisions
/// and per-attempt diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Timeout,
    Network,
    UpstreamServer,
    UpstreamClient,
    Malformed,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::Network => "network_error",
            ErrorClass::UpstreamServer => "upstream_server_error",
            ErrorClass::UpstreamClient => "upstream_client_error",
            ErrorClass::Malformed => "malformed",
        }
    }

    /// Retriable against another candidate after counting against the
    /// current backend.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorClass::Timeout | ErrorClass::Network | ErrorClass::UpstreamServer
        )
    }
}

/// A classified upstream call failure.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Upstream call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Upstream returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Upstream rejected request with {status}: {body}")]
    Client { status: u16, body: String },

    #[error("Malformed upstream response: {0}")]
    Malformed(String),
}

impl UpstreamError {
    pub fn class(&self) -> ErrorClass {
        match self {
            UpstreamError::Timeout { .. } => ErrorClass::Timeout,
            UpstreamError::Network(_) => ErrorClass::Network,
            UpstreamError::Server { .. } => ErrorClass::UpstreamServer,
            UpstreamError::Client { .. } => ErrorClass::UpstreamClient,
            UpstreamError::Malformed(_) => ErrorClass::Malformed,
        }
    }

    /// A 404 from an Ollama node means the model is not pulled there; the
    /// request may still succeed on another backend.
    pub fn is_model_missing(&self) -> bool {
        matches!(self, UpstreamError::Client { status: 404, .. })
    }
}

/// Bounded pool of upstream HTTP callers.
pub struct WorkerPool {
    clients: DashMap<BackendId, reqwest::Client>,
    permits: Arc<Semaphore>,
    connect_timeout: Duration,
}

impl WorkerPool {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            clients: DashMap::new(),
            permits: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Issue a JSON request and parse the response body.
    pub async fn call_json(
        &self,
        backend: &BackendId,
        endpoint: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, UpstreamError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| UpstreamError::Network("worker pool shut down".to_string()))?;

        let response = self.send(backend, endpoint, body, timeout).await?;
        let status = response.status();

        if !status.is_success() {
            return Err(Self::status_error(status.as_u16(), response).await);
        }

        response
            .json()
            .await
            .map_err(|e| UpstreamError::Malformed(e.to_string()))
    }

    /// Issue a request and pass the response body through as an ordered
    /// chunk stream. Status and headers are awaited before this returns,
    /// so callers can still fail over on connection errors and upstream
    /// rejections; once the stream is handed out the dispatch is committed.
    pub async fn call_streaming(
        &self,
        backend: &BackendId,
        endpoint: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<BoxStream<'static, Result<Bytes, UpstreamError>>, UpstreamError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| UpstreamError::Network("worker pool shut down".to_string()))?;

        let response = self.send(backend, endpoint, body, timeout).await?;
        let status = response.status();

        if !status.is_success() {
            return Err(Self::status_error(status.as_u16(), response).await);
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| UpstreamError::Network(e.to_string())));
        Ok(stream.boxed())
    }

    /// Drop the connection pool for a backend. Called when a backend is
    /// reinstated after a long exclusion so stale keep-alive connections
    /// are not reused.
    pub fn drain_backend(&self, backend: &BackendId) {
        if self.clients.remove(backend).is_some() {
            tracing::debug!(backend = %backend, "Drained upstream connection pool");
        }
    }

    async fn send(
        &self,
        backend: &BackendId,
        endpoint: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<reqwest::Response, UpstreamError> {
        let client = self.client_for(backend)?;
        let url = format!("{}{}", backend.url(), endpoint);

        client
            .post(&url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }
                } else {
                    UpstreamError::Network(e.to_string())
                }
            })
    }

    async fn status_error(status: u16, response: reqwest::Response) -> UpstreamError {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        if status >= 500 {
            UpstreamError::Server { status, body }
        } else {
            UpstreamError::Client { status, body }
        }
    }

    fn client_for(&self, backend: &BackendId) -> Result<reqwest::Client, UpstreamError> {
        if let Some(client) = self.clients.get(backend) {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Duration::from_secs(60))
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        self.clients.insert(backend.clone(), client.clone());
        Ok(client)
    }
}
