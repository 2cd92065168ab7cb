//! Gateway health endpoint.

use axum::{extract::State, Json};
use std::sync::Arc;
use std::time::Instant;

use super::AppState;

/// GET /api/health - gateway status plus per-host liveness.
pub async fn handle(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let now = Instant::now();
    let snapshots = state.registry.snapshot();
    let alive = snapshots.iter().filter(|s| s.is_available(now)).count();

    let hosts: Vec<serde_json::Value> = snapshots
        .iter()
        .map(|s| {
            serde_json::json!({
                "host": s.id.to_string(),
                "alive": s.alive,
                "excluded": s.is_excluded(now),
            })
        })
        .collect();

    Json(serde_json::json!({
        "status": if alive > 0 { "healthy" } else { "degraded" },
        "backends": snapshots.len(),
        "available": alive,
        "hosts": hosts,
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
