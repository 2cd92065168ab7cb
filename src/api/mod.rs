//! Gateway facade.
//!
//! Ollama-compatible HTTP endpoints in front of the routing engine:
//!
//! - `POST /api/chat` - chat completion
//! - `POST /api/generate` - prompt completion
//! - `POST /api/embed` - embeddings
//! - `GET /api/health` - gateway and fleet liveness
//! - `GET /api/stats` - per-host performance and queue statistics
//!
//! Successful JSON responses are augmented with a `routing` object naming
//! the chosen backend, the decision score and rationale, and any failed
//! attempts. Every response carries the `X-Powered-By: SOLLOL` header so
//! clients can detect the router.

mod chat;
mod embed;
mod error;
mod generate;
mod health;
mod stats;
pub mod types;

pub use error::{ApiError, ApiErrorBody};
pub use types::*;

use axum::{
    body::Body,
    http::{header::HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tower_http::limit::RequestBodyLimitLayer;

use crate::analyze::{analyze, RequestContext};
use crate::config::SollolConfig;
use crate::dispatch::{DispatchReply, DispatchSuccess};
use crate::metrics::MetricsRecorder;
use crate::queue::{QueueEntry, QueueError, RequestQueue};
use crate::registry::{BackendId, Registry};
use crate::routing::requires_distributed;
use crate::worker::WorkerPool;

/// Fixed token identifying the gateway on every response.
pub const GATEWAY_HEADER: &str = "x-powered-by";
pub const GATEWAY_TOKEN: &str = "SOLLOL";

/// Names the backend that served the request (lowercase for HTTP/2).
pub const BACKEND_HEADER: &str = "x-sollol-backend";

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub registry: Arc<Registry>,
    pub recorder: Arc<MetricsRecorder>,
    pub queue: Arc<RequestQueue>,
    pub pool: Arc<WorkerPool>,
    pub config: Arc<SollolConfig>,
    /// llama.cpp coordinator identity, when distributed delegation is on
    pub coordinator: Option<BackendId>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        registry: Arc<Registry>,
        recorder: Arc<MetricsRecorder>,
        queue: Arc<RequestQueue>,
        pool: Arc<WorkerPool>,
        config: Arc<SollolConfig>,
    ) -> Self {
        let coordinator = config
            .coordinator
            .as_ref()
            .map(|c| BackendId::new(c.host.clone(), c.port));

        Self {
            registry,
            recorder,
            queue,
            pool,
            config,
            coordinator,
            start_time: Instant::now(),
        }
    }
}

/// Create the gateway router with all endpoints configured.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.server.request_body_limit;
    Router::new()
        .route("/api/chat", post(chat::handle))
        .route("/api/generate", post(generate::handle))
        .route("/api/embed", post(embed::handle))
        .route("/api/health", get(health::handle))
        .route("/api/stats", get(stats::handle))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(axum::middleware::map_response(add_gateway_header))
        .with_state(state)
}

async fn add_gateway_header(mut response: Response) -> Response {
    response.headers_mut().insert(
        HeaderName::from_static(GATEWAY_HEADER),
        HeaderValue::from_static(GATEWAY_TOKEN),
    );
    response
}

/// Shared request path: delegation check, analysis, admission, and the
/// wait for dispatch completion.
pub(crate) async fn submit_and_wait(
    state: &Arc<AppState>,
    payload: RequestPayload,
) -> Result<Response, ApiError> {
    // Oversized models cannot be served by a single Ollama node; when a
    // coordinator is configured the request is forwarded there directly.
    if requires_distributed(payload.model()) {
        if let Some(coordinator) = state.coordinator.clone() {
            return delegate(state, payload, coordinator).await;
        }
        tracing::warn!(
            model = payload.model(),
            "Model requires distributed serving but no coordinator is configured"
        );
    }

    let ctx = analyze(&payload, Some(&state.recorder));
    tracing::info!(
        model = %ctx.model,
        task_type = ctx.task_type.as_str(),
        complexity = ctx.complexity.as_str(),
        priority = ctx.priority,
        "Request admitted"
    );

    let (tx, rx) = oneshot::channel();
    let entry = QueueEntry::new(ctx.clone(), payload, tx, None);

    state.queue.submit(entry).map_err(|e| match e {
        QueueError::Full { max_size } => ApiError::queue_full(max_size),
    })?;

    match rx.await {
        Err(_) => Err(ApiError::dispatch_abandoned()),
        Ok(Err(e)) => Err(ApiError::from_dispatch(e)),
        Ok(Ok(success)) => Ok(build_success_response(&ctx, success, false)),
    }
}

/// Forward a request straight to the distributed coordinator, bypassing
/// the fleet. Only the routing decision lives here; the coordinator is an
/// external collaborator.
async fn delegate(
    state: &Arc<AppState>,
    payload: RequestPayload,
    coordinator: BackendId,
) -> Result<Response, ApiError> {
    let ctx = analyze(&payload, Some(&state.recorder));
    tracing::info!(
        model = %ctx.model,
        coordinator = %coordinator,
        "Delegating to distributed coordinator"
    );

    let timeout = std::time::Duration::from_millis(state.config.dispatch.chat_timeout_ms);
    let started = Instant::now();

    let reply = if payload.is_stream() {
        state
            .pool
            .call_streaming(&coordinator, payload.endpoint(), &payload.upstream_body(), timeout)
            .await
            .map(DispatchReply::Stream)
    } else {
        state
            .pool
            .call_json(&coordinator, payload.endpoint(), &payload.upstream_body(), timeout)
            .await
            .map(DispatchReply::Json)
    }
    .map_err(|e| {
        ApiError::upstream_rejected(
            format!("Coordinator call failed: {}", e),
            serde_json::json!({
                "backend": { "host": coordinator.host, "port": coordinator.port },
                "error_class": e.class().as_str(),
            }),
        )
    })?;

    let success = DispatchSuccess {
        reply,
        decision: crate::routing::ScoringDecision {
            chosen: coordinator,
            score: 0.0,
            alternatives: vec![],
            rationale: format!(
                "model {} requires distributed serving; delegated to coordinator",
                ctx.model
            ),
        },
        failed_attempts: vec![],
        duration_ms: started.elapsed().as_millis() as u64,
    };

    Ok(build_success_response(&ctx, success, true))
}

/// Turn a dispatch success into the client response: inject the `routing`
/// envelope into JSON replies, pass streams through untouched, and name
/// the serving backend in a header.
fn build_success_response(
    ctx: &RequestContext,
    success: DispatchSuccess,
    delegated: bool,
) -> Response {
    let routing = RoutingInfo {
        chosen_backend: success.decision.chosen.to_string(),
        task_type: ctx.task_type.as_str().to_string(),
        complexity: ctx.complexity.as_str().to_string(),
        decision_score: success.decision.score,
        rationale: success.decision.rationale.clone(),
        actual_duration_ms: success.duration_ms,
        failed_attempts: success
            .failed_attempts
            .iter()
            .map(|a| FailedAttempt {
                backend: a.backend.to_string(),
                error_class: a.error_class.as_str().to_string(),
                message: a.message.clone(),
                latency_ms: a.latency_ms,
            })
            .collect(),
        delegated,
    };

    let mut response = match success.reply {
        DispatchReply::Json(mut value) => {
            if let Some(obj) = value.as_object_mut() {
                obj.insert(
                    "routing".to_string(),
                    serde_json::to_value(&routing).unwrap_or(serde_json::Value::Null),
                );
            }
            Json(value).into_response()
        }
        DispatchReply::Stream(stream) => {
            let body = Body::from_stream(stream.map(|chunk| chunk.map_err(std::io::Error::other)));
            Response::builder()
                .header("content-type", "application/x-ndjson")
                .body(body)
                .unwrap_or_else(|_| Json(serde_json::Value::Null).into_response())
        }
    };

    if let Ok(value) = HeaderValue::from_str(&routing.chosen_backend) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(BACKEND_HEADER), value);
    }
    response
}
