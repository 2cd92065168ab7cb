//! Chat endpoint handler.

use axum::{extract::State, response::Response, Json};
use std::sync::Arc;

use super::{submit_and_wait, ApiError, AppState};
use crate::api::types::{ChatRequest, RequestPayload};

/// POST /api/chat
pub async fn handle(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    if request.model.trim().is_empty() {
        return Err(ApiError::bad_request("model must not be empty"));
    }
    if request.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }
    if request.messages.iter().any(|m| m.role.trim().is_empty()) {
        return Err(ApiError::bad_request("message roles must not be empty"));
    }

    submit_and_wait(&state, RequestPayload::Chat(request)).await
}
