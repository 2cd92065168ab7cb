//! Admission queue configuration.

use serde::{Deserialize, Serialize};

/// Settings for the priority queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued entries before submissions are rejected
    pub max_size: usize,
    /// Milliseconds of waiting per +1 effective-priority boost
    pub age_boost_step_ms: u64,
    /// Maximum age boost added to a declared priority
    pub age_boost_cap: u8,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            age_boost_step_ms: 2000,
            age_boost_cap: 9,
        }
    }
}
