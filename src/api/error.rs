//! Gateway error envelope.
//!
//! All gateway failures are serialized in a stable JSON shape:
//! `{"error": {"message", "type", "code"}, "attempts": [...]}` with the
//! attempts array present only when per-attempt diagnostics exist.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};

use crate::dispatch::DispatchError;

/// Error details in the response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub message: String,
    pub r#type: String,
    pub code: String,
}

/// A gateway-facing error with its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ApiErrorBody,
    /// Per-attempt diagnostics for failed dispatches
    pub attempts: Option<serde_json::Value>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>, r#type: &str, code: &str) -> Self {
        Self {
            status,
            body: ApiErrorBody {
                message: message.into(),
                r#type: r#type.to_string(),
                code: code.to_string(),
            },
            attempts: None,
        }
    }

    /// 400: structurally invalid request.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            message,
            "invalid_request_error",
            "invalid_request",
        )
    }

    /// 429: admission queue at capacity.
    pub fn queue_full(max_size: usize) -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            format!("Request queue is full ({} requests)", max_size),
            "overloaded_error",
            "queue_full",
        )
    }

    /// 503: no routable backend.
    pub fn no_backend_available() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "No alive, non-excluded backend available",
            "server_error",
            "no_backend_available",
        )
    }

    /// 502: every dispatch attempt failed.
    pub fn all_attempts_failed(attempts: serde_json::Value) -> Self {
        let mut error = Self::new(
            StatusCode::BAD_GATEWAY,
            "All dispatch attempts failed",
            "server_error",
            "all_attempts_failed",
        );
        error.attempts = Some(attempts);
        error
    }

    /// 502: upstream rejected the request in a non-retriable way.
    pub fn upstream_rejected(message: impl Into<String>, attempt: serde_json::Value) -> Self {
        let mut error = Self::new(
            StatusCode::BAD_GATEWAY,
            message,
            "server_error",
            "upstream_rejected",
        );
        error.attempts = Some(serde_json::Value::Array(vec![attempt]));
        error
    }

    /// 504: caller deadline passed before a successful attempt.
    pub fn deadline_exceeded() -> Self {
        Self::new(
            StatusCode::GATEWAY_TIMEOUT,
            "Request deadline exceeded",
            "server_error",
            "deadline_exceeded",
        )
    }

    /// 503: gateway shutting down.
    pub fn shutting_down() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Gateway is shutting down",
            "server_error",
            "shutting_down",
        )
    }

    /// 502: the dispatcher vanished without answering.
    pub fn dispatch_abandoned() -> Self {
        Self::new(
            StatusCode::BAD_GATEWAY,
            "Dispatch abandoned without a response",
            "server_error",
            "dispatch_abandoned",
        )
    }

    pub fn from_dispatch(error: DispatchError) -> Self {
        match error {
            DispatchError::NoBackendAvailable => Self::no_backend_available(),
            DispatchError::AllAttemptsFailed { attempts } => Self::all_attempts_failed(
                serde_json::to_value(attempts).unwrap_or(serde_json::Value::Null),
            ),
            DispatchError::UpstreamRejected { attempt } => {
                let message = attempt.message.clone();
                Self::upstream_rejected(
                    message,
                    serde_json::to_value(attempt).unwrap_or(serde_json::Value::Null),
                )
            }
            DispatchError::DeadlineExceeded => Self::deadline_exceeded(),
            DispatchError::ShuttingDown => Self::shutting_down(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({ "error": self.body });
        if let Some(attempts) = self.attempts {
            body["attempts"] = attempts;
        }
        (self.status, Json(body)).into_response()
    }
}
