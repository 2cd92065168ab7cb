//! Fleet statistics endpoint.

use axum::{extract::State, Json};
use std::sync::Arc;
use std::time::Instant;

use super::AppState;

/// GET /api/stats - per-host performance state and queue statistics.
pub async fn handle(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let now = Instant::now();

    let hosts: Vec<serde_json::Value> = state
        .registry
        .snapshot()
        .iter()
        .map(|s| {
            let excluded_for_ms = s
                .excluded_until
                .filter(|until| *until > now)
                .map(|until| until.duration_since(now).as_millis() as u64);

            serde_json::json!({
                "host": s.id.to_string(),
                "available": s.is_available(now),
                "alive": s.alive,
                "latency_ms": s.latency_ewma_ms,
                "success_rate": s.success_rate,
                "sample_count": s.sample_count,
                "in_flight": s.in_flight,
                "failure_streak": s.failure_streak,
                "excluded_for_ms": excluded_for_ms,
                "cpu_load": s.cpu_load,
                "gpu_free_mb": s.gpu_memory_free_mb,
                "has_gpu": s.has_gpu,
                "vram_exhausted": s.vram_exhausted,
                "tier": s.tier,
                "last_probe_at": s.last_probe_at.map(|t| t.to_rfc3339()),
            })
        })
        .collect();

    Json(serde_json::json!({
        "hosts": hosts,
        "queue": state.queue.stats(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
