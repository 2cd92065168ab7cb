//! Embedding endpoint handler.

use axum::{extract::State, response::Response, Json};
use std::sync::Arc;

use super::{submit_and_wait, ApiError, AppState};
use crate::api::types::{EmbedInput, EmbedRequest, RequestPayload};

/// POST /api/embed
pub async fn handle(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EmbedRequest>,
) -> Result<Response, ApiError> {
    if request.model.trim().is_empty() {
        return Err(ApiError::bad_request("model must not be empty"));
    }
    if let EmbedInput::Batch(items) = &request.input {
        if items.is_empty() {
            return Err(ApiError::bad_request("input batch must not be empty"));
        }
    }

    submit_and_wait(&state, RequestPayload::Embed(request)).await
}
