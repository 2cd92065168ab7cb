//! Static backend declarations.

use serde::{Deserialize, Serialize};

/// One configured upstream backend.
///
/// Identity is `(host, port)`; the rest are static capability declarations
/// that seed the registry. Runtime state (liveness, latency, load) is
/// discovered by the health prober and the metrics recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendEntry {
    pub host: String,
    pub port: u16,
    /// Whether the node has a usable GPU
    pub has_gpu: bool,
    /// Total GPU memory in megabytes (0 if unknown or CPU-only)
    pub gpu_memory_total_mb: u64,
    /// Relative CPU capacity hint (1.0 = one typical core-set)
    pub cpu_capacity: f64,
    /// Declared priority tier; higher tiers attract high-priority requests
    pub tier: Option<u8>,
}

impl Default for BackendEntry {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 11434,
            has_gpu: false,
            gpu_memory_total_mb: 0,
            cpu_capacity: 1.0,
            tier: None,
        }
    }
}

/// Optional llama.cpp distributed coordinator.
///
/// When configured, requests for models whose profile requires distributed
/// serving are forwarded here instead of the Ollama fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub host: String,
    pub port: u16,
}
