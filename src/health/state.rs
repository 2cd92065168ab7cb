//! Per-backend probe state.

use std::time::Instant;

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    /// Backend answered `/api/tags` with a valid model list
    Alive { rtt_ms: f64, model_count: usize },
    /// Connection failure, timeout, error status, or unparseable body
    Failed { reason: String },
}

/// Tracks probe history for a single backend.
#[derive(Debug, Clone, Default)]
pub struct ProbeState {
    /// Count of consecutive failed probes
    pub consecutive_failures: u32,
    /// When the last probe completed
    pub last_probe_at: Option<Instant>,
}
