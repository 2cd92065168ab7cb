//! Model resource profiles.
//!
//! A static table of well-known models plus a name-based estimate for
//! unknown ones. The router uses this only for one decision: whether a
//! model is too large for a single Ollama node and must be delegated to
//! the llama.cpp distributed coordinator.

use crate::analyze::normalize_model_name;

/// Resource profile of a model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelProfile {
    /// Parameter count in billions
    pub parameters_b: u32,
    /// Estimated memory footprint in GB
    pub estimated_memory_gb: f64,
    /// Needs multi-node serving
    pub requires_distributed: bool,
}

/// Parameter count above which single-node serving is off the table.
/// Unknown models up to 70B stay on the regular fleet.
const DISTRIBUTED_PARAMS_B: u32 = 70;

/// Look up a known model profile by normalized name.
pub fn profile_for(model: &str) -> Option<ModelProfile> {
    let profile = |parameters_b, estimated_memory_gb, requires_distributed| ModelProfile {
        parameters_b,
        estimated_memory_gb,
        requires_distributed,
    };

    Some(match normalize_model_name(model) {
        // Small models (fit on a single GPU)
        "llama3.2" | "llama3.2:3b" => profile(3, 2.5, false),
        "phi" => profile(3, 1.5, false),
        "phi3" => profile(4, 2.0, false),
        "gemma:7b" => profile(7, 5.0, false),
        "llama3:8b" | "llama3.1:8b" => profile(8, 6.0, false),
        "mistral:7b" | "llama2:7b" => profile(7, 5.0, false),
        "llama2:13b" => profile(13, 9.0, false),

        // Medium and large models (require distributed serving)
        "llama2:70b" | "llama3:70b" | "llama3.1:70b" => profile(70, 40.0, true),
        "mixtral:8x7b" => profile(47, 26.0, true),
        "qwen2.5:72b" => profile(72, 42.0, true),
        "llama3.1:405b" => profile(405, 230.0, true),
        "mixtral:8x22b" => profile(141, 80.0, true),

        _ => return None,
    })
}

/// Whether a model must be delegated to the distributed coordinator.
///
/// Known models answer from the table; unknown models are estimated from a
/// `:<N>b` size suffix when present, and default to single-node otherwise.
pub fn requires_distributed(model: &str) -> bool {
    if let Some(profile) = profile_for(model) {
        return profile.requires_distributed;
    }

    estimated_parameters_b(model)
        .map(|params| params > DISTRIBUTED_PARAMS_B)
        .unwrap_or(false)
}

/// Parse a parameter-count hint from a `:<N>b` model name suffix.
fn estimated_parameters_b(model: &str) -> Option<u32> {
    let normalized = normalize_model_name(model);
    let tag = normalized.rsplit(':').next()?;
    let digits = tag.strip_suffix(['b', 'B'])?;
    digits.parse().ok()
}
