//! Default scoring formula.

use std::sync::Arc;
use std::time::Instant;

use super::{ScoreBreakdown, ScoredCandidate, Scorer};
use crate::analyze::{Complexity, RequestContext};
use crate::metrics::MetricsRecorder;
use crate::registry::BackendSnapshot;

/// Tunable constants for the default formula.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringParams {
    /// Starting score before multipliers
    pub baseline: f64,
    /// Per-backend concurrency cap, mirrored from dispatch config
    pub per_backend_concurrency: u32,
    /// Nominal capacity window a fully idle backend offers, in ms
    pub capacity_window_ms: u64,
    /// GPU bonus when the request wants a GPU and the backend can serve it
    pub gpu_bonus: f64,
    /// GPU damp when the request wants a GPU and the backend cannot
    pub gpu_miss_penalty: f64,
    /// Boost for high-tier backends on priority >= 8 requests
    pub high_priority_boost: f64,
    /// Damp for high-tier backends on priority <= 2 requests
    pub low_priority_damp: f64,
    /// Bonus for a demonstrated (task, model) specialization
    pub specialization_bonus: f64,
    /// Damp applied to VRAM-exhausted GPU backends
    pub vram_exhaustion_damp: f64,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            baseline: 100.0,
            per_backend_concurrency: 8,
            capacity_window_ms: 30_000,
            gpu_bonus: 1.5,
            gpu_miss_penalty: 0.5,
            high_priority_boost: 1.25,
            low_priority_damp: 0.8,
            specialization_bonus: 1.25,
            vram_exhaustion_damp: 0.25,
        }
    }
}

impl ScoringParams {
    /// Minimum free GPU memory (MB) a backend must report before the GPU
    /// bonus applies, by complexity bucket.
    fn memory_floor_mb(complexity: Complexity) -> u64 {
        match complexity {
            Complexity::Low => 1024,
            Complexity::Medium => 2048,
            Complexity::High => 4096,
        }
    }
}

/// The default multiplicative scorer:
///
/// ```text
/// score = baseline
///       x success_rate
///       / (1 + latency_ewma_s)
///       x gpu_bonus
///       / (1 + cpu_load + 0.1 x in_flight)
///       x priority_alignment
///       x task_specialization
///       / (1 + estimated_duration / expected_capacity)
/// ```
///
/// The specialization bonus consults the metrics recorder's performance
/// history; everything else reads only the snapshot, so a ranking is
/// reproducible until new outcomes land.
pub struct DefaultScorer {
    params: ScoringParams,
    recorder: Arc<MetricsRecorder>,
}

impl DefaultScorer {
    pub fn new(params: ScoringParams, recorder: Arc<MetricsRecorder>) -> Self {
        Self { params, recorder }
    }

    fn breakdown(&self, ctx: &RequestContext, backend: &BackendSnapshot) -> ScoreBreakdown {
        let p = &self.params;

        let latency_penalty = backend.latency_ewma_ms / 1000.0;

        let gpu_bonus = if ctx.requires_gpu {
            let floor = ScoringParams::memory_floor_mb(ctx.complexity);
            if backend.has_gpu && backend.gpu_memory_free_mb >= floor {
                p.gpu_bonus
            } else {
                p.gpu_miss_penalty
            }
        } else {
            1.0
        };

        let load_penalty = backend.cpu_load + 0.1 * backend.in_flight as f64;

        let high_tier = backend.has_gpu || backend.tier.unwrap_or(0) >= 2;
        let priority_alignment = if ctx.priority >= 8 && high_tier {
            p.high_priority_boost
        } else if ctx.priority <= 2 && high_tier {
            p.low_priority_damp
        } else {
            1.0
        };

        let task_specialization =
            if self
                .recorder
                .is_specialized(&backend.id, ctx.task_type, &ctx.model)
            {
                p.specialization_bonus
            } else {
                1.0
            };

        let cap = p.per_backend_concurrency.max(1);
        let free_slots = cap.saturating_sub(backend.in_flight).max(1);
        let expected_capacity_ms =
            (p.capacity_window_ms as f64 * free_slots as f64 / cap as f64).max(1.0);
        let headroom_penalty = ctx.estimated_duration_ms as f64 / expected_capacity_ms;

        let vram_health = if backend.vram_exhausted {
            p.vram_exhaustion_damp
        } else {
            1.0
        };

        ScoreBreakdown {
            success_rate: backend.success_rate,
            latency: 1.0 / (1.0 + latency_penalty),
            gpu_bonus,
            load: 1.0 / (1.0 + load_penalty),
            priority_alignment,
            task_specialization,
            duration_headroom: 1.0 / (1.0 + headroom_penalty),
            vram_health,
        }
    }
}

impl Scorer for DefaultScorer {
    fn score(
        &self,
        ctx: &RequestContext,
        snapshot: &[BackendSnapshot],
        now: Instant,
    ) -> Vec<ScoredCandidate> {
        let mut ranked: Vec<ScoredCandidate> = snapshot
            .iter()
            .filter(|b| b.is_available(now))
            .map(|backend| {
                let breakdown = self.breakdown(ctx, backend);
                let score = breakdown
                    .named()
                    .into_iter()
                    .fold(self.params.baseline, |acc, (_, factor)| acc * factor);
                ScoredCandidate {
                    snapshot: backend.clone(),
                    score,
                    breakdown,
                }
            })
            .collect();

        // Higher score first; ties resolved by lower in_flight, then lower
        // latency, then stable id order.
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.snapshot.in_flight.cmp(&b.snapshot.in_flight))
                .then_with(|| {
                    a.snapshot
                        .latency_ewma_ms
                        .partial_cmp(&b.snapshot.latency_ewma_ms)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.snapshot.id.cmp(&b.snapshot.id))
        });

        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::TaskType;
    use crate::config::{BackendEntry, ExclusionConfig, MetricsConfig};
    use crate::registry::{BackendId, Registry};
    use crate::routing::ScoringDecision;
    use chrono::Utc;
    use std::time::Duration;

    fn ctx(task_type: TaskType, requires_gpu: bool, priority: u8) -> RequestContext {
        RequestContext {
            task_type,
            complexity: crate::analyze::Complexity::High,
            requires_gpu,
            estimated_tokens: 2500,
            estimated_duration_ms: 5000,
            model: "llama3.1:8b".to_string(),
            priority,
            submitted_at: Utc::now(),
        }
    }

    fn snapshot(host: &str, has_gpu: bool) -> BackendSnapshot {
        BackendSnapshot {
            id: BackendId::new(host, 11434),
            has_gpu,
            gpu_memory_total_mb: if has_gpu { 16384 } else { 0 },
            cpu_capacity: 1.0,
            tier: None,
            alive: true,
            last_probe_at: None,
            latency_ewma_ms: 100.0,
            success_rate: 1.0,
            sample_count: 20,
            in_flight: 0,
            failure_streak: 0,
            excluded_until: None,
            gpu_memory_free_mb: if has_gpu { 16384 } else { 0 },
            cpu_load: 0.1,
            vram_exhausted: false,
        }
    }

    fn scorer() -> DefaultScorer {
        let registry = Arc::new(Registry::new(
            ExclusionConfig::default(),
            &MetricsConfig::default(),
        ));
        registry
            .add_backend(&BackendEntry {
                host: "seed".to_string(),
                port: 1,
                ..Default::default()
            })
            .unwrap();
        let recorder = Arc::new(MetricsRecorder::new(registry, MetricsConfig::default()));
        DefaultScorer::new(ScoringParams::default(), recorder)
    }

    #[test]
    fn gpu_backend_wins_generation() {
        let scorer = scorer();
        let snapshots = vec![snapshot("cpu-node", false), snapshot("gpu-node", true)];
        let ranked = scorer.score(&ctx(TaskType::Generation, true, 5), &snapshots, Instant::now());

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].snapshot.id.host, "gpu-node");
        assert_eq!(ranked[0].breakdown.gpu_bonus, 1.5);
        assert_eq!(ranked[1].breakdown.gpu_bonus, 0.5);
    }

    #[test]
    fn rationale_mentions_gpu_bonus() {
        let scorer = scorer();
        let snapshots = vec![snapshot("cpu-node", false), snapshot("gpu-node", true)];
        let ranked = scorer.score(&ctx(TaskType::Generation, true, 5), &snapshots, Instant::now());
        let decision = ScoringDecision::from_ranked(&ranked).unwrap();

        assert!(decision.rationale.contains("gpu_bonus"));
        assert_eq!(decision.alternatives.len(), 1);
    }

    #[test]
    fn cpu_backend_can_win_small_embedding() {
        let scorer = scorer();
        let mut gpu = snapshot("gpu-node", true);
        gpu.latency_ewma_ms = 900.0;
        gpu.cpu_load = 0.8;
        let mut cpu = snapshot("cpu-node", false);
        cpu.latency_ewma_ms = 40.0;
        cpu.cpu_load = 0.05;

        let embed_ctx = RequestContext {
            requires_gpu: false,
            estimated_duration_ms: 200,
            ..ctx(TaskType::Embedding, false, 5)
        };
        let ranked = scorer.score(&embed_ctx, &[gpu, cpu], Instant::now());
        assert_eq!(ranked[0].snapshot.id.host, "cpu-node");
    }

    #[test]
    fn excluded_and_dead_backends_never_ranked() {
        let scorer = scorer();
        let now = Instant::now();
        let mut excluded = snapshot("excluded", true);
        excluded.excluded_until = Some(now + Duration::from_secs(30));
        let mut dead = snapshot("dead", true);
        dead.alive = false;

        let ranked = scorer.score(&ctx(TaskType::Generation, true, 5), &[excluded, dead], now);
        assert!(ranked.is_empty());
    }

    #[test]
    fn scoring_is_deterministic_on_unchanged_snapshot() {
        let scorer = scorer();
        let now = Instant::now();
        let snapshots = vec![
            snapshot("a", true),
            snapshot("b", true),
            snapshot("c", false),
        ];
        let first = scorer.score(&ctx(TaskType::Generation, true, 5), &snapshots, now);
        let second = scorer.score(&ctx(TaskType::Generation, true, 5), &snapshots, now);

        let ids1: Vec<_> = first.iter().map(|c| c.snapshot.id.clone()).collect();
        let ids2: Vec<_> = second.iter().map(|c| c.snapshot.id.clone()).collect();
        assert_eq!(ids1, ids2);
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.score, b.score);
        }
    }

    #[test]
    fn ties_broken_by_in_flight_then_id() {
        let scorer = scorer();
        let mut busy = snapshot("aaa", true);
        busy.in_flight = 3;
        let idle = snapshot("bbb", true);

        // busy has lower id but more in-flight work; load penalty already
        // separates the scores, so check ordering is by score
        let ranked = scorer.score(
            &ctx(TaskType::Generation, true, 5),
            &[busy, idle],
            Instant::now(),
        );
        assert_eq!(ranked[0].snapshot.id.host, "bbb");

        // Identical state: stable id order decides
        let ranked = scorer.score(
            &ctx(TaskType::Generation, true, 5),
            &[snapshot("bbb", true), snapshot("aaa", true)],
            Instant::now(),
        );
        assert_eq!(ranked[0].snapshot.id.host, "aaa");
    }

    #[test]
    fn low_success_rate_drags_score() {
        let scorer = scorer();
        let healthy = snapshot("healthy", true);
        let mut flaky = snapshot("flaky", true);
        flaky.success_rate = 0.5;

        let ranked = scorer.score(
            &ctx(TaskType::Generation, true, 5),
            &[flaky, healthy],
            Instant::now(),
        );
        assert_eq!(ranked[0].snapshot.id.host, "healthy");
        assert!(ranked[0].score > ranked[1].score * 1.5);
    }

    #[test]
    fn high_priority_prefers_gpu_tier() {
        let scorer = scorer();
        let snapshots = vec![snapshot("gpu-node", true), snapshot("cpu-node", false)];

        let ranked = scorer.score(&ctx(TaskType::Generation, true, 9), &snapshots, Instant::now());
        assert_eq!(ranked[0].breakdown.priority_alignment, 1.25);
        assert_eq!(ranked[1].breakdown.priority_alignment, 1.0);
    }

    #[test]
    fn vram_exhausted_backend_damped() {
        let scorer = scorer();
        let mut exhausted = snapshot("gpu-a", true);
        exhausted.vram_exhausted = true;
        let healthy = snapshot("gpu-b", true);

        let ranked = scorer.score(
            &ctx(TaskType::Generation, true, 5),
            &[exhausted, healthy],
            Instant::now(),
        );
        assert_eq!(ranked[0].snapshot.id.host, "gpu-b");
        assert_eq!(ranked[1].breakdown.vram_health, 0.25);
    }

    #[test]
    fn gpu_bonus_requires_free_memory() {
        let scorer = scorer();
        let mut starved = snapshot("gpu-node", true);
        starved.gpu_memory_free_mb = 512; // below the high-complexity floor

        let ranked = scorer.score(
            &ctx(TaskType::Generation, true, 5),
            &[starved],
            Instant::now(),
        );
        assert_eq!(ranked[0].breakdown.gpu_bonus, 0.5);
    }

    #[test]
    fn in_flight_raises_headroom_penalty() {
        let scorer = scorer();
        let idle = snapshot("idle", true);
        let mut loaded = snapshot("loaded", true);
        loaded.in_flight = 7;

        let c = ctx(TaskType::Generation, true, 5);
        let idle_ranked = scorer.score(&c, &[idle], Instant::now());
        let loaded_ranked = scorer.score(&c, &[loaded], Instant::now());
        assert!(
            idle_ranked[0].breakdown.duration_headroom
                > loaded_ranked[0].breakdown.duration_headroom
        );
    }
}
