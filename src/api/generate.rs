//! Generate endpoint handler.

use axum::{extract::State, response::Response, Json};
use std::sync::Arc;

use super::{submit_and_wait, ApiError, AppState};
use crate::api::types::{GenerateRequest, RequestPayload};

/// POST /api/generate
pub async fn handle(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    if request.model.trim().is_empty() {
        return Err(ApiError::bad_request("model must not be empty"));
    }

    submit_and_wait(&state, RequestPayload::Generate(request)).await
}
