//! Dispatcher and worker pool configuration.

use serde::{Deserialize, Serialize};

/// Settings for dispatch attempts, retries, and upstream calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum dispatch attempts per request
    pub max_retries: u32,
    /// Concurrent in-flight requests allowed per backend
    pub per_backend_concurrency: u32,
    /// Bound on concurrent upstream callers across all backends
    pub worker_pool_size: usize,
    /// Upstream timeout for chat/generate requests
    pub chat_timeout_ms: u64,
    /// Upstream timeout for embedding requests
    pub embed_timeout_ms: u64,
    /// First retry backoff; doubles per attempt
    pub backoff_base_ms: u64,
    /// Backoff ceiling
    pub backoff_cap_ms: u64,
    /// Speculative second dispatch for priority >= 9 requests
    pub hedging_enabled: bool,
    /// Delay before the hedge fires (bounded by the chosen backend's p95)
    pub hedging_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            per_backend_concurrency: 8,
            worker_pool_size: 64,
            chat_timeout_ms: 300_000,
            embed_timeout_ms: 60_000,
            backoff_base_ms: 100,
            backoff_cap_ms: 2000,
            hedging_enabled: false,
            hedging_delay_ms: 500,
        }
    }
}
