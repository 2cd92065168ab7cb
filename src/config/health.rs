//! Health prober configuration.

use serde::{Deserialize, Serialize};

/// Probe intervals by backend stability tier, in milliseconds.
///
/// The prober classifies each backend from its recent failure ratio and
/// picks the matching interval: very stable fleets are probed rarely,
/// unstable or excluded backends every few seconds so recovery is prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeIntervals {
    /// <1% failures in the recent window
    pub very_stable: u64,
    /// <5% failures
    pub stable: u64,
    /// 5-15% failures
    pub degraded: u64,
    /// >15% failures, or currently excluded
    pub unstable: u64,
}

impl Default for ProbeIntervals {
    fn default() -> Self {
        Self {
            very_stable: 60_000,
            stable: 30_000,
            degraded: 15_000,
            unstable: 5_000,
        }
    }
}

/// Settings for the background health prober.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Whether background probing is enabled
    pub enabled: bool,
    /// Per-probe timeout
    pub probe_timeout_ms: u64,
    /// Consecutive probe failures before marking not-alive
    pub failure_threshold: u32,
    pub probe_intervals_ms: ProbeIntervals,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_timeout_ms: 2000,
            failure_threshold: 3,
            probe_intervals_ms: ProbeIntervals::default(),
        }
    }
}
