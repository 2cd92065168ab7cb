//! Metrics recorder configuration.

use serde::{Deserialize, Serialize};

/// Settings for performance sample retention and event sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Samples retained per ring (per backend and per task/model key)
    pub ring_capacity: usize,
    /// Fraction of successful outcomes emitted as structured events;
    /// failures are always emitted
    pub sampling_rate_info: f64,
    /// Rolling window length for per-backend success rate
    pub success_window: usize,
    /// Below this many outcomes, success rate scores as 1.0 and never
    /// triggers exclusion
    pub warmup_threshold: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1000,
            sampling_rate_info: 0.1,
            success_window: 100,
            warmup_threshold: 5,
        }
    }
}
