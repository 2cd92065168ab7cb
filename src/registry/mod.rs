//! Host registry module.
//!
//! The registry is the single authoritative store of backend state. All
//! mutations flow through its named operations; readers take cheap
//! point-in-time snapshots that the scorer consumes without locking.

mod backend;
mod error;

pub use backend::*;
pub use error::*;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::config::{ExclusionConfig, MetricsConfig};

/// Latency EWMA smoothing factor for request and probe observations.
const LATENCY_ALPHA: f64 = 0.2;

/// Baseline EWMA factor for VRAM-exhaustion detection (slow-moving).
const BASELINE_ALPHA: f64 = 0.1;

/// A GPU node responding slower than this despite a fast baseline has
/// almost certainly fallen back to CPU inference.
const VRAM_EXHAUSTION_FLOOR_MS: f64 = 2000.0;

/// External resource reports older than this many seconds are discarded.
const RESOURCE_STALENESS_SECS: i64 = 30;

/// The Host Registry stores all known inference backends.
///
/// Thread-safe: backed by a concurrent map with per-shard locking, so
/// mutators are serialized per backend while `in_flight` adjustments stay
/// atomic and lock-free.
pub struct Registry {
    backends: DashMap<BackendId, Backend>,
    exclusion: ExclusionConfig,
    success_window: usize,
    warmup_threshold: usize,
}

/// Terminal outcome of one dispatch attempt, as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Succeeded,
    Failed,
    /// Cancelled attempts adjust `in_flight` but never count against the
    /// backend's success rate or failure streak.
    Cancelled,
}

impl Registry {
    pub fn new(exclusion: ExclusionConfig, metrics: &MetricsConfig) -> Self {
        Self {
            backends: DashMap::new(),
            exclusion,
            success_window: metrics.success_window,
            warmup_threshold: metrics.warmup_threshold,
        }
    }

    /// Register a backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateBackend` when `(host, port)` is
    /// already registered.
    pub fn add_backend(&self, entry: &crate::config::BackendEntry) -> Result<(), RegistryError> {
        let backend = Backend::from_entry(entry);
        let id = backend.id.clone();

        if self.backends.contains_key(&id) {
            return Err(RegistryError::DuplicateBackend(id.to_string()));
        }

        self.backends.insert(id, backend);
        Ok(())
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    pub fn ids(&self) -> Vec<BackendId> {
        self.backends.iter().map(|e| e.key().clone()).collect()
    }

    /// Point-in-time copy of every backend, for scoring and stats.
    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        let mut snapshots: Vec<_> = self
            .backends
            .iter()
            .map(|entry| self.snapshot_backend(entry.value()))
            .collect();
        // Stable id order so identical snapshots rank identically
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub fn snapshot_one(&self, id: &BackendId) -> Option<BackendSnapshot> {
        self.backends
            .get(id)
            .map(|entry| self.snapshot_backend(entry.value()))
    }

    fn snapshot_backend(&self, backend: &Backend) -> BackendSnapshot {
        let sample_count = backend.recent_outcomes.len();
        // Warm-up rule: too few samples to judge, score as perfect
        let success_rate = if sample_count < self.warmup_threshold {
            1.0
        } else {
            backend.raw_success_rate().unwrap_or(1.0)
        };

        BackendSnapshot {
            id: backend.id.clone(),
            has_gpu: backend.has_gpu,
            gpu_memory_total_mb: backend.gpu_memory_total_mb,
            cpu_capacity: backend.cpu_capacity,
            tier: backend.tier,
            alive: backend.alive,
            last_probe_at: backend.last_probe_at,
            latency_ewma_ms: backend.latency_ewma_ms,
            success_rate,
            sample_count,
            in_flight: backend.in_flight.load(Ordering::SeqCst),
            failure_streak: backend.failure_streak,
            excluded_until: backend.excluded_until,
            gpu_memory_free_mb: backend.gpu_memory_free_mb,
            cpu_load: backend.cpu_load,
            vram_exhausted: backend.vram_exhausted,
        }
    }

    /// Apply a probe result from the health prober.
    ///
    /// A successful probe of a backend whose exclusion window has passed
    /// reinstates it; `Ok(true)` reports that transition so the caller can
    /// drain stale connection pools. While the window is still open the
    /// backend stays non-alive regardless of the probe result, preserving
    /// the invariant that `alive` implies `excluded_until <= now`.
    pub fn update_probe(
        &self,
        id: &BackendId,
        alive: bool,
        rtt_ms: Option<f64>,
        gpu_free_mb: Option<u64>,
        cpu_load: Option<f64>,
    ) -> Result<bool, RegistryError> {
        let mut backend = self
            .backends
            .get_mut(id)
            .ok_or_else(|| RegistryError::BackendNotFound(id.to_string()))?;

        backend.last_probe_at = Some(Utc::now());
        let mut reinstated = false;

        if alive {
            let now = Instant::now();
            match backend.excluded_until {
                Some(until) if until > now => {
                    // Window still open: probing succeeded but the backend
                    // is not yet eligible again.
                    backend.alive = false;
                }
                Some(_) => {
                    backend.excluded_until = None;
                    backend.failure_streak = 0;
                    backend.alive = true;
                    reinstated = true;
                    tracing::info!(backend = %backend.id, "Backend reinstated after exclusion");
                }
                None => {
                    backend.alive = true;
                }
            }

            if let Some(rtt) = rtt_ms {
                Self::update_ewma(&mut backend.latency_ewma_ms, rtt);
            }
        } else {
            backend.alive = false;
        }

        if let Some(free) = gpu_free_mb {
            backend.gpu_memory_free_mb = free;
            backend.resources_updated_at = Some(Utc::now());
        }
        if let Some(load) = cpu_load {
            backend.cpu_load = load.clamp(0.0, 1.0);
            backend.resources_updated_at = Some(Utc::now());
        }

        Ok(reinstated)
    }

    /// Mark a backend unreachable after repeated probe failures, opening an
    /// exclusion window if one is not already open.
    pub fn mark_unreachable(&self, id: &BackendId) -> Result<(), RegistryError> {
        let mut backend = self
            .backends
            .get_mut(id)
            .ok_or_else(|| RegistryError::BackendNotFound(id.to_string()))?;

        backend.alive = false;
        let now = Instant::now();
        let already_excluded = matches!(backend.excluded_until, Some(until) if until > now);
        if !already_excluded {
            let backoff = self.backoff_for_episode(backend.exclusion_episodes);
            backend.excluded_until = Some(now + backoff);
            backend.exclusion_episodes += 1;
            metrics::counter!("sollol_exclusions_total", "reason" => "unreachable").increment(1);
            tracing::warn!(
                backend = %backend.id,
                backoff_ms = backoff.as_millis() as u64,
                "Backend unreachable, excluded"
            );
        }

        Ok(())
    }

    /// Record a terminal dispatch outcome: updates the latency EWMA, the
    /// rolling success window, the failure streak, the VRAM-exhaustion
    /// baseline, and applies the exclusion rule at the failure threshold.
    pub fn record_outcome(
        &self,
        id: &BackendId,
        success: bool,
        latency_ms: f64,
    ) -> Result<(), RegistryError> {
        let mut backend = self
            .backends
            .get_mut(id)
            .ok_or_else(|| RegistryError::BackendNotFound(id.to_string()))?;

        Self::update_ewma(&mut backend.latency_ewma_ms, latency_ms);

        backend.recent_outcomes.push_back(success);
        while backend.recent_outcomes.len() > self.success_window {
            backend.recent_outcomes.pop_front();
        }

        if success {
            backend.failure_streak = 0;
            // A real request succeeded: the backend has recovered, so the
            // exclusion escalation restarts from the first step.
            backend.exclusion_episodes = 0;
            self.observe_baseline(&mut backend, latency_ms);
        } else {
            backend.failure_streak += 1;
            if backend.failure_streak >= self.exclusion.failure_threshold {
                let now = Instant::now();
                let already_excluded =
                    matches!(backend.excluded_until, Some(until) if until > now);
                if !already_excluded {
                    let backoff = self.backoff_for_episode(backend.exclusion_episodes);
                    backend.excluded_until = Some(now + backoff);
                    backend.exclusion_episodes += 1;
                    backend.failure_streak = 0;
                    metrics::counter!("sollol_exclusions_total", "reason" => "failures")
                        .increment(1);
                    tracing::warn!(
                        backend = %backend.id,
                        backoff_ms = backoff.as_millis() as u64,
                        "Failure streak reached threshold, backend excluded"
                    );
                }
            }
        }

        Ok(())
    }

    /// Update the slow latency baseline and flip the VRAM-exhaustion flag
    /// when a GPU node's latency spikes far above it (GPU to CPU fallback
    /// in the wild looks exactly like this).
    fn observe_baseline(&self, backend: &mut Backend, latency_ms: f64) {
        if backend.latency_baseline_ms == 0.0 {
            backend.latency_baseline_ms = latency_ms;
            return;
        }

        if backend.has_gpu {
            let baseline = backend.latency_baseline_ms;
            let spike_floor = (baseline * 4.0).max(VRAM_EXHAUSTION_FLOOR_MS);
            if latency_ms > spike_floor {
                if !backend.vram_exhausted {
                    tracing::warn!(
                        backend = %backend.id,
                        baseline_ms = baseline,
                        latency_ms,
                        "Latency spike on GPU backend, flagging VRAM exhaustion"
                    );
                    backend.vram_exhausted = true;
                }
            } else if backend.vram_exhausted && latency_ms < baseline * 1.5 {
                tracing::info!(
                    backend = %backend.id,
                    latency_ms,
                    "GPU backend latency recovered"
                );
                backend.vram_exhausted = false;
            }
        }

        backend.latency_baseline_ms =
            backend.latency_baseline_ms * (1.0 - BASELINE_ALPHA) + latency_ms * BASELINE_ALPHA;
    }

    /// Atomically increment `in_flight` unless the backend is already at
    /// `cap`. Returns whether the slot was taken. The compare-exchange
    /// loop closes the race between observing capacity in a snapshot and
    /// claiming it; every dispatch claim goes through here so the cap
    /// cannot be bypassed.
    pub fn try_begin_dispatch(&self, id: &BackendId, cap: u32) -> Result<bool, RegistryError> {
        let backend = self
            .backends
            .get(id)
            .ok_or_else(|| RegistryError::BackendNotFound(id.to_string()))?;

        loop {
            let current = backend.in_flight.load(Ordering::SeqCst);
            if current >= cap {
                return Ok(false);
            }
            match backend.in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(true),
                Err(_) => continue,
            }
        }
    }

    /// Atomically decrement `in_flight` after an upstream call terminates
    /// on any path, including cancellation (saturating at 0).
    pub fn end_dispatch(
        &self,
        id: &BackendId,
        outcome: DispatchOutcome,
    ) -> Result<u32, RegistryError> {
        let backend = self
            .backends
            .get(id)
            .ok_or_else(|| RegistryError::BackendNotFound(id.to_string()))?;

        tracing::trace!(backend = %id, ?outcome, "Dispatch finished");

        loop {
            let current = backend.in_flight.load(Ordering::SeqCst);
            if current == 0 {
                tracing::warn!(
                    backend = %id,
                    "Attempted to decrement in_flight when already at 0"
                );
                return Ok(0);
            }

            let new_val = current - 1;
            match backend.in_flight.compare_exchange(
                current,
                new_val,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(new_val),
                Err(_) => continue, // Retry if another thread modified the value
            }
        }
    }

    /// Open an explicit exclusion window.
    pub fn exclude(&self, id: &BackendId, duration: Duration) -> Result<(), RegistryError> {
        let mut backend = self
            .backends
            .get_mut(id)
            .ok_or_else(|| RegistryError::BackendNotFound(id.to_string()))?;

        backend.excluded_until = Some(Instant::now() + duration);
        backend.alive = false;
        Ok(())
    }

    /// Close any exclusion window and mark the backend eligible again.
    pub fn reinstate(&self, id: &BackendId) -> Result<(), RegistryError> {
        let mut backend = self
            .backends
            .get_mut(id)
            .ok_or_else(|| RegistryError::BackendNotFound(id.to_string()))?;

        backend.excluded_until = None;
        backend.failure_streak = 0;
        backend.alive = true;
        Ok(())
    }

    /// Accept an externally pushed resource report (GPU telemetry, load
    /// publishers). Reports older than 30 seconds, or older than what the
    /// registry already holds, are ignored.
    pub fn update_resources(
        &self,
        id: &BackendId,
        gpu_free_mb: u64,
        cpu_load: f64,
        observed_at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut backend = self
            .backends
            .get_mut(id)
            .ok_or_else(|| RegistryError::BackendNotFound(id.to_string()))?;

        let now = Utc::now();
        if now - observed_at > chrono::Duration::seconds(RESOURCE_STALENESS_SECS) {
            tracing::debug!(backend = %id, %observed_at, "Ignoring stale resource report");
            return Ok(());
        }
        if let Some(current) = backend.resources_updated_at {
            if observed_at < current {
                return Ok(());
            }
        }

        backend.gpu_memory_free_mb = gpu_free_mb;
        backend.cpu_load = cpu_load.clamp(0.0, 1.0);
        backend.resources_updated_at = Some(observed_at);
        Ok(())
    }

    /// Recent probe/outcome failure ratio, used by the prober to pick its
    /// interval tier. `None` when there are no samples yet.
    pub fn failure_ratio(&self, id: &BackendId) -> Option<f64> {
        let backend = self.backends.get(id)?;
        backend.raw_success_rate().map(|rate| 1.0 - rate)
    }

    fn update_ewma(current: &mut f64, sample: f64) {
        if *current == 0.0 {
            *current = sample;
        } else {
            *current = *current * (1.0 - LATENCY_ALPHA) + sample * LATENCY_ALPHA;
        }
    }

    fn backoff_for_episode(&self, episode: u32) -> Duration {
        let schedule = &self.exclusion.backoff_schedule_ms;
        let idx = (episode as usize).min(schedule.len() - 1);
        Duration::from_millis(schedule[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendEntry;

    fn test_registry() -> Registry {
        Registry::new(ExclusionConfig::default(), &MetricsConfig::default())
    }

    fn add(registry: &Registry, host: &str) -> BackendId {
        registry
            .add_backend(&BackendEntry {
                host: host.to_string(),
                port: 11434,
                ..Default::default()
            })
            .unwrap();
        BackendId::new(host, 11434)
    }

    #[test]
    fn duplicate_backend_rejected() {
        let registry = test_registry();
        add(&registry, "a");
        let result = registry.add_backend(&BackendEntry {
            host: "a".to_string(),
            port: 11434,
            ..Default::default()
        });
        assert!(matches!(result, Err(RegistryError::DuplicateBackend(_))));
        assert_eq!(registry.backend_count(), 1);
    }

    #[test]
    fn in_flight_pairing_returns_to_zero() {
        let registry = test_registry();
        let id = add(&registry, "a");

        assert!(registry.try_begin_dispatch(&id, 8).unwrap());
        assert!(registry.try_begin_dispatch(&id, 8).unwrap());
        assert_eq!(registry.snapshot_one(&id).unwrap().in_flight, 2);
        assert_eq!(
            registry.end_dispatch(&id, DispatchOutcome::Succeeded).unwrap(),
            1
        );
        assert_eq!(
            registry.end_dispatch(&id, DispatchOutcome::Cancelled).unwrap(),
            0
        );
        assert_eq!(registry.snapshot_one(&id).unwrap().in_flight, 0);
    }

    #[test]
    fn try_begin_dispatch_respects_cap() {
        let registry = test_registry();
        let id = add(&registry, "a");

        assert!(registry.try_begin_dispatch(&id, 2).unwrap());
        assert!(registry.try_begin_dispatch(&id, 2).unwrap());
        assert!(!registry.try_begin_dispatch(&id, 2).unwrap());
        assert_eq!(registry.snapshot_one(&id).unwrap().in_flight, 2);
    }

    #[test]
    fn end_dispatch_saturates_at_zero() {
        let registry = test_registry();
        let id = add(&registry, "a");
        assert_eq!(
            registry.end_dispatch(&id, DispatchOutcome::Failed).unwrap(),
            0
        );
    }

    #[test]
    fn warmup_success_rate_is_one() {
        let registry = test_registry();
        let id = add(&registry, "a");

        // 2 failures is below the warm-up threshold of 5 samples
        registry.record_outcome(&id, false, 100.0).unwrap();
        registry.record_outcome(&id, false, 100.0).unwrap();

        let snapshot = registry.snapshot_one(&id).unwrap();
        assert_eq!(snapshot.sample_count, 2);
        assert_eq!(snapshot.success_rate, 1.0);
    }

    #[test]
    fn success_rate_reflects_window_after_warmup() {
        let registry = test_registry();
        let id = add(&registry, "a");

        for _ in 0..8 {
            registry.record_outcome(&id, true, 100.0).unwrap();
        }
        registry.record_outcome(&id, false, 100.0).unwrap();
        registry.record_outcome(&id, false, 100.0).unwrap();

        let snapshot = registry.snapshot_one(&id).unwrap();
        assert_eq!(snapshot.sample_count, 10);
        assert!((snapshot.success_rate - 0.8).abs() < 1e-9);
    }

    #[test]
    fn exclusion_applies_exactly_at_threshold() {
        let registry = test_registry();
        let id = add(&registry, "a");
        registry.update_probe(&id, true, None, None, None).unwrap();

        registry.record_outcome(&id, false, 100.0).unwrap();
        registry.record_outcome(&id, false, 100.0).unwrap();
        let snapshot = registry.snapshot_one(&id).unwrap();
        assert_eq!(snapshot.failure_streak, 2);
        assert!(!snapshot.is_excluded(Instant::now()));

        registry.record_outcome(&id, false, 100.0).unwrap();
        let snapshot = registry.snapshot_one(&id).unwrap();
        assert!(snapshot.is_excluded(Instant::now()));
    }

    #[test]
    fn success_clears_streak_but_keeps_exclusion() {
        let registry = test_registry();
        let id = add(&registry, "a");

        for _ in 0..3 {
            registry.record_outcome(&id, false, 100.0).unwrap();
        }
        assert!(registry
            .snapshot_one(&id)
            .unwrap()
            .is_excluded(Instant::now()));

        registry.record_outcome(&id, true, 100.0).unwrap();
        let snapshot = registry.snapshot_one(&id).unwrap();
        assert_eq!(snapshot.failure_streak, 0);
        // Exclusion window stays open; only a probe reinstates
        assert!(snapshot.is_excluded(Instant::now()));
    }

    #[test]
    fn exclusion_backoff_escalates() {
        let registry = Registry::new(
            ExclusionConfig {
                failure_threshold: 1,
                backoff_schedule_ms: vec![10, 1000],
            },
            &MetricsConfig::default(),
        );
        let id = add(&registry, "a");

        registry.record_outcome(&id, false, 100.0).unwrap();
        let first = registry.snapshot_one(&id).unwrap().excluded_until.unwrap();
        assert!(first <= Instant::now() + Duration::from_millis(10));

        // First window expires, next episode picks the longer backoff
        std::thread::sleep(Duration::from_millis(20));
        registry.record_outcome(&id, false, 100.0).unwrap();
        let second = registry.snapshot_one(&id).unwrap().excluded_until.unwrap();
        assert!(second > Instant::now() + Duration::from_millis(500));
    }

    #[test]
    fn probe_reinstates_after_window_passes() {
        let registry = Registry::new(
            ExclusionConfig {
                failure_threshold: 1,
                backoff_schedule_ms: vec![10],
            },
            &MetricsConfig::default(),
        );
        let id = add(&registry, "a");

        registry.record_outcome(&id, false, 100.0).unwrap();
        assert!(registry
            .snapshot_one(&id)
            .unwrap()
            .is_excluded(Instant::now()));

        // Probe succeeds while the window is still open: stays ineligible
        registry.update_probe(&id, true, Some(5.0), None, None).unwrap();
        assert!(!registry.snapshot_one(&id).unwrap().alive);

        std::thread::sleep(Duration::from_millis(20));
        registry.update_probe(&id, true, Some(5.0), None, None).unwrap();
        let snapshot = registry.snapshot_one(&id).unwrap();
        assert!(snapshot.alive);
        assert!(snapshot.is_available(Instant::now()));
    }

    #[test]
    fn latency_ewma_converges() {
        let registry = test_registry();
        let id = add(&registry, "a");

        registry.record_outcome(&id, true, 100.0).unwrap();
        assert_eq!(registry.snapshot_one(&id).unwrap().latency_ewma_ms, 100.0);

        registry.record_outcome(&id, true, 200.0).unwrap();
        let ewma = registry.snapshot_one(&id).unwrap().latency_ewma_ms;
        assert!((ewma - 120.0).abs() < 1e-9);
    }

    #[test]
    fn stale_resource_report_ignored() {
        let registry = test_registry();
        let id = add(&registry, "a");

        let stale = Utc::now() - chrono::Duration::seconds(60);
        registry.update_resources(&id, 4096, 0.5, stale).unwrap();
        let snapshot = registry.snapshot_one(&id).unwrap();
        assert_eq!(snapshot.gpu_memory_free_mb, 0);
        assert_eq!(snapshot.cpu_load, 0.0);

        registry
            .update_resources(&id, 4096, 0.5, Utc::now())
            .unwrap();
        let snapshot = registry.snapshot_one(&id).unwrap();
        assert_eq!(snapshot.gpu_memory_free_mb, 4096);
        assert!((snapshot.cpu_load - 0.5).abs() < 1e-9);
    }

    #[test]
    fn vram_exhaustion_detected_and_recovers() {
        let registry = test_registry();
        registry
            .add_backend(&BackendEntry {
                host: "gpu".to_string(),
                port: 11434,
                has_gpu: true,
                gpu_memory_total_mb: 16384,
                ..Default::default()
            })
            .unwrap();
        let id = BackendId::new("gpu", 11434);

        // Establish a fast baseline
        for _ in 0..5 {
            registry.record_outcome(&id, true, 300.0).unwrap();
        }
        assert!(!registry.snapshot_one(&id).unwrap().vram_exhausted);

        // Sudden jump to multi-second latency on a GPU node
        registry.record_outcome(&id, true, 5000.0).unwrap();
        assert!(registry.snapshot_one(&id).unwrap().vram_exhausted);

        // Back to normal
        registry.record_outcome(&id, true, 320.0).unwrap();
        assert!(!registry.snapshot_one(&id).unwrap().vram_exhausted);
    }

    #[test]
    fn mark_unreachable_excludes_once() {
        let registry = test_registry();
        let id = add(&registry, "a");
        registry.update_probe(&id, true, None, None, None).unwrap();

        registry.mark_unreachable(&id).unwrap();
        let first = registry.snapshot_one(&id).unwrap().excluded_until.unwrap();

        registry.mark_unreachable(&id).unwrap();
        let second = registry.snapshot_one(&id).unwrap().excluded_until.unwrap();
        assert_eq!(first, second, "open window should not be extended");
        assert!(!registry.snapshot_one(&id).unwrap().alive);
    }

    #[test]
    fn snapshot_is_sorted_by_id() {
        let registry = test_registry();
        add(&registry, "c");
        add(&registry, "a");
        add(&registry, "b");

        let ids: Vec<_> = registry.snapshot().iter().map(|s| s.id.host.clone()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
