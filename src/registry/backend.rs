//! Backend identity, state, and snapshot types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::AtomicU32;
use std::time::Instant;

use crate::config::BackendEntry;

/// Identity of an upstream backend: `(host, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendId {
    pub host: String,
    pub port: u16,
}

impl BackendId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Base URL for upstream HTTP calls.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An upstream inference backend.
///
/// Holds static capability declarations from configuration plus the mutable
/// performance and liveness state maintained by the prober, the metrics
/// recorder, and the dispatcher. `in_flight` is atomic so dispatch
/// bookkeeping never blocks on the registry shard lock.
#[derive(Debug)]
pub struct Backend {
    pub id: BackendId,

    // Static capabilities
    pub has_gpu: bool,
    pub gpu_memory_total_mb: u64,
    pub cpu_capacity: f64,
    pub tier: Option<u8>,

    // Mutable state
    pub alive: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub latency_ewma_ms: f64,
    /// Rolling window of recent outcomes, newest at the back
    pub recent_outcomes: VecDeque<bool>,
    pub in_flight: AtomicU32,
    pub failure_streak: u32,
    /// Consecutive exclusion episodes; indexes the backoff schedule
    pub exclusion_episodes: u32,
    pub excluded_until: Option<Instant>,
    pub gpu_memory_free_mb: u64,
    /// Normalized CPU load in [0, 1]
    pub cpu_load: f64,
    pub resources_updated_at: Option<DateTime<Utc>>,
    /// Latency spiked far above baseline on a GPU node (likely CPU fallback)
    pub vram_exhausted: bool,
    /// Slow-moving latency baseline used for exhaustion detection
    pub latency_baseline_ms: f64,
}

impl Backend {
    /// Create a backend from its configuration entry. All runtime state
    /// starts empty; liveness is established by the first probe.
    pub fn from_entry(entry: &BackendEntry) -> Self {
        Self {
            id: BackendId::new(entry.host.clone(), entry.port),
            has_gpu: entry.has_gpu,
            gpu_memory_total_mb: entry.gpu_memory_total_mb,
            cpu_capacity: entry.cpu_capacity,
            tier: entry.tier,
            alive: false,
            last_probe_at: None,
            latency_ewma_ms: 0.0,
            recent_outcomes: VecDeque::new(),
            in_flight: AtomicU32::new(0),
            failure_streak: 0,
            exclusion_episodes: 0,
            excluded_until: None,
            gpu_memory_free_mb: entry.gpu_memory_total_mb,
            cpu_load: 0.0,
            resources_updated_at: None,
            vram_exhausted: false,
            latency_baseline_ms: 0.0,
        }
    }

    /// Success rate over the rolling window, or None with no samples.
    pub fn raw_success_rate(&self) -> Option<f64> {
        if self.recent_outcomes.is_empty() {
            return None;
        }
        let ok = self.recent_outcomes.iter().filter(|s| **s).count();
        Some(ok as f64 / self.recent_outcomes.len() as f64)
    }
}

/// Immutable point-in-time copy of a backend, consumed by the scorer.
///
/// `success_rate` already applies the warm-up rule: below the warm-up
/// sample threshold it reads 1.0.
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub id: BackendId,
    pub has_gpu: bool,
    pub gpu_memory_total_mb: u64,
    pub cpu_capacity: f64,
    pub tier: Option<u8>,
    pub alive: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub latency_ewma_ms: f64,
    pub success_rate: f64,
    pub sample_count: usize,
    pub in_flight: u32,
    pub failure_streak: u32,
    pub excluded_until: Option<Instant>,
    pub gpu_memory_free_mb: u64,
    pub cpu_load: f64,
    pub vram_exhausted: bool,
}

impl BackendSnapshot {
    /// Excluded backends are invisible to the scorer until the window passes.
    pub fn is_excluded(&self, now: Instant) -> bool {
        matches!(self.excluded_until, Some(until) if until > now)
    }

    /// Alive and not excluded: eligible as a routing candidate.
    pub fn is_available(&self, now: Instant) -> bool {
        self.alive && !self.is_excluded(now)
    }
}
