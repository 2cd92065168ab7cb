//! Failure exclusion configuration.

use serde::{Deserialize, Serialize};

/// Settings for time-bounded backend exclusion after repeated failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusionConfig {
    /// Consecutive retriable failures before a backend is excluded
    pub failure_threshold: u32,
    /// Exclusion durations by consecutive episode; the last entry caps
    pub backoff_schedule_ms: Vec<u64>,
}

impl Default for ExclusionConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            backoff_schedule_ms: vec![5_000, 30_000, 120_000, 300_000],
        }
    }
}
