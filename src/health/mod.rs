//! Health prober.
//!
//! A background task that probes each backend's `/api/tags` endpoint on an
//! adaptive schedule: stable backends are probed rarely, unstable or
//! excluded ones every few seconds so recovery is prompt. Probe results
//! flow into the registry; reinstatement after an exclusion drains the
//! backend's upstream connection pool.

mod state;

pub use state::{ProbeResult, ProbeState};

use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::HealthConfig;
use crate::registry::{BackendId, Registry};
use crate::worker::WorkerPool;

/// Minimal shape of the Ollama `/api/tags` response; only used to verify
/// the backend is actually an inference server and not a stray listener.
#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<serde_json::Value>,
}

/// Background service that periodically probes backend liveness.
pub struct HealthProber {
    registry: Arc<Registry>,
    pool: Arc<WorkerPool>,
    client: reqwest::Client,
    config: HealthConfig,
    state: DashMap<BackendId, ProbeState>,
}

impl HealthProber {
    pub fn new(registry: Arc<Registry>, pool: Arc<WorkerPool>, config: HealthConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.probe_timeout_ms))
            .build()
            .expect("Failed to build health probe HTTP client");

        Self {
            registry,
            pool,
            client,
            config,
            state: DashMap::new(),
        }
    }

    /// Probe interval for a backend, from its recent failure ratio.
    /// Excluded backends always use the unstable tier so reinstatement is
    /// detected quickly once the window passes.
    pub fn interval_for(&self, id: &BackendId) -> Duration {
        let intervals = &self.config.probe_intervals_ms;

        let excluded = self
            .registry
            .snapshot_one(id)
            .map(|s| s.is_excluded(Instant::now()))
            .unwrap_or(false);
        if excluded {
            return Duration::from_millis(intervals.unstable);
        }

        let ratio = self.registry.failure_ratio(id).unwrap_or(0.0);
        let ms = if ratio < 0.01 {
            intervals.very_stable
        } else if ratio < 0.05 {
            intervals.stable
        } else if ratio <= 0.15 {
            intervals.degraded
        } else {
            intervals.unstable
        };
        Duration::from_millis(ms)
    }

    /// Probe one backend and apply the result.
    pub async fn probe_backend(&self, id: &BackendId) -> ProbeResult {
        let url = format!("{}/api/tags", id.url());
        let started = Instant::now();

        let result = match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let rtt_ms = started.elapsed().as_secs_f64() * 1000.0;
                match response.json::<TagsResponse>().await {
                    Ok(tags) => ProbeResult::Alive {
                        rtt_ms,
                        model_count: tags.models.len(),
                    },
                    Err(e) => ProbeResult::Failed {
                        reason: format!("invalid tags response: {}", e),
                    },
                }
            }
            Ok(response) => ProbeResult::Failed {
                reason: format!("status {}", response.status()),
            },
            Err(e) => ProbeResult::Failed {
                reason: if e.is_timeout() {
                    "probe timeout".to_string()
                } else {
                    e.to_string()
                },
            },
        };

        self.apply_result(id, &result);
        result
    }

    /// Apply a probe result to the registry and the prober's own state.
    pub fn apply_result(&self, id: &BackendId, result: &ProbeResult) {
        let mut state = self.state.entry(id.clone()).or_default();

        match result {
            ProbeResult::Alive { rtt_ms, .. } => {
                state.consecutive_failures = 0;
                metrics::histogram!(
                    "sollol_probe_rtt_seconds",
                    "backend" => id.to_string()
                )
                .record(rtt_ms / 1000.0);

                match self
                    .registry
                    .update_probe(id, true, Some(*rtt_ms), None, None)
                {
                    Ok(true) => {
                        // Fresh start after exclusion: stale keep-alive
                        // connections must not be reused.
                        self.pool.drain_backend(id);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(backend = %id, error = %e, "Probe update failed");
                    }
                }
            }
            ProbeResult::Failed { reason } => {
                state.consecutive_failures += 1;
                tracing::debug!(
                    backend = %id,
                    failures = state.consecutive_failures,
                    reason,
                    "Probe failed"
                );

                // A single miss does not change liveness; only a streak at
                // the threshold marks the backend not-alive and excluded.
                if state.consecutive_failures >= self.config.failure_threshold {
                    if let Err(e) = self.registry.mark_unreachable(id) {
                        tracing::warn!(backend = %id, error = %e, "Failed to mark unreachable");
                    }
                }
            }
        }

        state.last_probe_at = Some(Instant::now());
    }

    /// Probe every backend whose interval has elapsed.
    pub async fn probe_due_backends(&self) -> usize {
        let now = Instant::now();
        let due: Vec<BackendId> = self
            .registry
            .ids()
            .into_iter()
            .filter(|id| {
                let interval = self.interval_for(id);
                self.state
                    .get(id)
                    .and_then(|s| s.last_probe_at)
                    .map(|last| now.saturating_duration_since(last) >= interval)
                    .unwrap_or(true)
            })
            .collect();

        let count = due.len();
        for id in due {
            self.probe_backend(&id).await;
        }
        count
    }

    /// Start the prober background task.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!("Health prober started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Health prober shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let probed = self.probe_due_backends().await;
                        if probed > 0 {
                            tracing::trace!(probed, "Probe cycle completed");
                        }
                    }
                }
            }
        })
    }
}
