//! Metrics recorder.
//!
//! Records every terminal dispatch outcome: feeds the registry's EWMAs and
//! exclusion bookkeeping, maintains bounded performance-sample rings keyed
//! three ways (per backend, per backend+task+model, per task+model), and
//! emits sampled structured events. The rings power the duration predictor
//! and the scorer's task-specialization bonus.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use crate::analyze::TaskType;
use crate::config::MetricsConfig;
use crate::registry::{BackendId, Registry};

/// Specialization requires at least this many `(backend, task, model)`
/// samples before the bonus can apply.
const SPECIALIZATION_MIN_SAMPLES: usize = 10;

/// Success-rate lead over the fleet average required for the bonus,
/// in percentage points.
const SPECIALIZATION_LEAD: f64 = 0.05;

/// One terminal dispatch outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub backend: BackendId,
    pub task_type: TaskType,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error_class: Option<String>,
    pub duration_ms: u64,
    pub prompt_size: usize,
    pub completion_size: usize,
}

type Ring = Mutex<VecDeque<PerformanceSample>>;

/// Process-wide recorder of dispatch outcomes.
///
/// Constructed explicitly and shared via `Arc`; tests build isolated
/// instances rather than relying on globals.
pub struct MetricsRecorder {
    registry: Arc<Registry>,
    per_backend: DashMap<BackendId, Ring>,
    per_backend_task: DashMap<(BackendId, TaskType, String), Ring>,
    per_task_model: DashMap<(TaskType, String), Ring>,
    config: MetricsConfig,
}

impl MetricsRecorder {
    pub fn new(registry: Arc<Registry>, config: MetricsConfig) -> Self {
        Self {
            registry,
            per_backend: DashMap::new(),
            per_backend_task: DashMap::new(),
            per_task_model: DashMap::new(),
            config,
        }
    }

    /// Record a terminal outcome. Updates the registry (EWMA, success
    /// window, exclusion rule), appends to the three rings, and emits a
    /// sampled structured event plus metrics counters.
    pub fn record(&self, sample: PerformanceSample) {
        let _ = self.registry.record_outcome(
            &sample.backend,
            sample.success,
            sample.duration_ms as f64,
        );

        metrics::counter!(
            "sollol_dispatch_outcomes_total",
            "backend" => sample.backend.to_string(),
            "outcome" => if sample.success { "success" } else { "failure" }
        )
        .increment(1);
        metrics::histogram!(
            "sollol_dispatch_duration_seconds",
            "task_type" => sample.task_type.as_str()
        )
        .record(sample.duration_ms as f64 / 1000.0);

        self.emit_event(&sample);

        self.push(
            self.per_backend
                .entry(sample.backend.clone())
                .or_default()
                .value(),
            sample.clone(),
        );
        self.push(
            self.per_backend_task
                .entry((
                    sample.backend.clone(),
                    sample.task_type,
                    sample.model.clone(),
                ))
                .or_default()
                .value(),
            sample.clone(),
        );
        self.push(
            self.per_task_model
                .entry((sample.task_type, sample.model.clone()))
                .or_default()
                .value(),
            sample,
        );
    }

    /// Record a cancelled attempt. Cancellations never count against a
    /// backend's success rate; only an event is emitted.
    pub fn record_cancelled(&self, backend: &BackendId, task_type: TaskType, model: &str) {
        metrics::counter!(
            "sollol_dispatch_outcomes_total",
            "backend" => backend.to_string(),
            "outcome" => "cancelled"
        )
        .increment(1);
        tracing::debug!(backend = %backend, task_type = task_type.as_str(), model, "Dispatch cancelled");
    }

    /// Median successful duration for `(task_type, model)`, if at least
    /// `min_samples` successes are on record.
    pub fn median_duration_ms(
        &self,
        task_type: TaskType,
        model: &str,
        min_samples: usize,
    ) -> Option<u64> {
        let ring = self
            .per_task_model
            .get(&(task_type, model.to_string()))?;
        let guard = ring.lock().ok()?;
        let mut durations: Vec<u64> = guard
            .iter()
            .filter(|s| s.success)
            .map(|s| s.duration_ms)
            .collect();
        if durations.len() < min_samples {
            return None;
        }
        durations.sort_unstable();
        Some(durations[durations.len() / 2])
    }

    /// Whether a backend has demonstrated a specialization for
    /// `(task_type, model)`: its success rate there beats the fleet average
    /// by at least five percentage points across ten or more samples.
    pub fn is_specialized(&self, backend: &BackendId, task_type: TaskType, model: &str) -> bool {
        let backend_rate = match self.ring_success_rate(
            self.per_backend_task
                .get(&(backend.clone(), task_type, model.to_string())),
        ) {
            Some((rate, count)) if count >= SPECIALIZATION_MIN_SAMPLES => rate,
            _ => return false,
        };

        let fleet_rate = match self
            .ring_success_rate(self.per_task_model.get(&(task_type, model.to_string())))
        {
            Some((rate, _)) => rate,
            None => return false,
        };

        backend_rate >= fleet_rate + SPECIALIZATION_LEAD
    }

    /// p95 of successful request durations for a backend, used to bound
    /// the hedging delay.
    pub fn p95_duration_ms(&self, backend: &BackendId) -> Option<u64> {
        let ring = self.per_backend.get(backend)?;
        let guard = ring.lock().ok()?;
        let mut durations: Vec<u64> = guard
            .iter()
            .filter(|s| s.success)
            .map(|s| s.duration_ms)
            .collect();
        if durations.is_empty() {
            return None;
        }
        durations.sort_unstable();
        let idx = (durations.len() * 95) / 100;
        Some(durations[idx.min(durations.len() - 1)])
    }

    fn push(&self, ring: &Ring, sample: PerformanceSample) {
        if let Ok(mut guard) = ring.lock() {
            guard.push_back(sample);
            while guard.len() > self.config.ring_capacity {
                guard.pop_front();
            }
        }
    }

    fn emit_event(&self, sample: &PerformanceSample) {
        if sample.success {
            if rand::random::<f64>() < self.config.sampling_rate_info {
                tracing::info!(
                    backend = %sample.backend,
                    task_type = sample.task_type.as_str(),
                    model = %sample.model,
                    duration_ms = sample.duration_ms,
                    prompt_size = sample.prompt_size,
                    completion_size = sample.completion_size,
                    "Dispatch succeeded"
                );
            }
        } else {
            tracing::warn!(
                backend = %sample.backend,
                task_type = sample.task_type.as_str(),
                model = %sample.model,
                duration_ms = sample.duration_ms,
                error_class = sample.error_class.as_deref().unwrap_or("unknown"),
                "Dispatch failed"
            );
        }
    }

    fn ring_success_rate(
        &self,
        ring: Option<impl std::ops::Deref<Target = Ring>>,
    ) -> Option<(f64, usize)> {
        let ring = ring?;
        let guard = ring.lock().ok()?;
        if guard.is_empty() {
            return None;
        }
        let ok = guard.iter().filter(|s| s.success).count();
        Some((ok as f64 / guard.len() as f64, guard.len()))
    }
}
