//! Context-aware backend scoring.
//!
//! The scorer is a pure ranking function over a registry snapshot: given a
//! [`RequestContext`] it produces scored candidates with a factor
//! decomposition, a human-readable rationale, and the alternatives that
//! were considered. It is deliberately swappable behind the [`Scorer`]
//! trait so alternative formulas can be A/B tested without touching the
//! dispatcher.

pub mod profiles;
pub mod scorer;

pub use profiles::{profile_for, requires_distributed, ModelProfile};
pub use scorer::{DefaultScorer, ScoringParams};

use serde::Serialize;
use std::time::Instant;

use crate::analyze::RequestContext;
use crate::registry::{BackendId, BackendSnapshot};

/// Multiplier decomposition of one candidate's score.
///
/// Every field is the multiplicative contribution applied to the baseline;
/// 1.0 means neutral.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub success_rate: f64,
    pub latency: f64,
    pub gpu_bonus: f64,
    pub load: f64,
    pub priority_alignment: f64,
    pub task_specialization: f64,
    pub duration_headroom: f64,
    pub vram_health: f64,
}

impl ScoreBreakdown {
    /// Factor names paired with their multipliers, for rationale building.
    pub fn named(&self) -> [(&'static str, f64); 8] {
        [
            ("success_rate", self.success_rate),
            ("latency_penalty", self.latency),
            ("gpu_bonus", self.gpu_bonus),
            ("load_penalty", self.load),
            ("priority_alignment", self.priority_alignment),
            ("task_specialization", self.task_specialization),
            ("duration_headroom", self.duration_headroom),
            ("vram_exhaustion", self.vram_health),
        ]
    }

    /// The two factors that moved this score furthest from neutral.
    pub fn top_factors(&self) -> [(&'static str, f64); 2] {
        let mut factors = self.named();
        factors.sort_by(|a, b| {
            b.1.ln()
                .abs()
                .partial_cmp(&a.1.ln().abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        [factors[0], factors[1]]
    }
}

/// One ranked candidate.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub snapshot: BackendSnapshot,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// The routing decision attached to responses and metrics samples.
#[derive(Debug, Clone, Serialize)]
pub struct ScoringDecision {
    pub chosen: BackendId,
    pub score: f64,
    /// Up to five runners-up with their scores
    pub alternatives: Vec<(BackendId, f64)>,
    pub rationale: String,
}

impl ScoringDecision {
    /// Build a decision from a ranked candidate list. The first entry is
    /// the chosen backend.
    pub fn from_ranked(ranked: &[ScoredCandidate]) -> Option<Self> {
        let chosen = ranked.first()?;
        let [(f1, v1), (f2, v2)] = chosen.breakdown.top_factors();
        let rationale = format!(
            "selected {} (score {:.1}); dominant factors: {}={:.2}, {}={:.2}",
            chosen.snapshot.id, chosen.score, f1, v1, f2, v2
        );

        Some(Self {
            chosen: chosen.snapshot.id.clone(),
            score: chosen.score,
            alternatives: ranked
                .iter()
                .skip(1)
                .take(5)
                .map(|c| (c.snapshot.id.clone(), c.score))
                .collect(),
            rationale,
        })
    }
}

/// The pluggable scoring capability.
///
/// Implementations must be deterministic for a given `(ctx, snapshot)`
/// pair: concurrent calls over identical inputs rank identically. Excluded
/// or non-alive backends never appear in the result.
pub trait Scorer: Send + Sync {
    fn score(
        &self,
        ctx: &RequestContext,
        snapshot: &[BackendSnapshot],
        now: Instant,
    ) -> Vec<ScoredCandidate>;
}
