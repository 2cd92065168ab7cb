//! Dispatcher.
//!
//! Pops admitted entries, asks the scorer for a fresh ranking on every
//! attempt, and walks the candidates with retry, backoff, and failover.
//! Owns the retry decision: upstream failures are classified by the worker
//! pool, counted against backends here, and surfaced to the gateway only
//! after the policy is exhausted.

use bytes::Bytes;
use futures_util::stream::BoxStream;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::analyze::RequestContext;
use crate::api::types::RequestPayload;
use crate::config::DispatchConfig;
use crate::metrics::{MetricsRecorder, PerformanceSample};
use crate::queue::{QueueEntry, RequestQueue};
use crate::registry::{BackendId, DispatchOutcome, Registry};
use crate::routing::{ScoredCandidate, Scorer, ScoringDecision};
use crate::worker::{ErrorClass, UpstreamError, WorkerPool};

/// One failed attempt, kept for the routing envelope diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptDiagnostic {
    pub backend: BackendId,
    pub error_class: ErrorClass,
    pub message: String,
    pub latency_ms: u64,
}

/// Successful upstream reply: a parsed JSON body, or a passthrough chunk
/// stream for `stream: true` requests.
pub enum DispatchReply {
    Json(serde_json::Value),
    Stream(BoxStream<'static, Result<Bytes, UpstreamError>>),
}

impl std::fmt::Debug for DispatchReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchReply::Json(v) => f.debug_tuple("Json").field(v).finish(),
            DispatchReply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A completed dispatch, handed back to the gateway.
#[derive(Debug)]
pub struct DispatchSuccess {
    pub reply: DispatchReply,
    pub decision: ScoringDecision,
    pub failed_attempts: Vec<AttemptDiagnostic>,
    pub duration_ms: u64,
}

/// Terminal dispatch failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No alive, non-excluded backend exists
    #[error("No backend available")]
    NoBackendAvailable,

    /// Every attempt failed
    #[error("All dispatch attempts failed after {} tries", attempts.len())]
    AllAttemptsFailed { attempts: Vec<AttemptDiagnostic> },

    /// An upstream rejected the request in a way retries cannot fix
    #[error("Upstream rejected request: {}", attempt.message)]
    UpstreamRejected { attempt: AttemptDiagnostic },

    /// The caller-supplied deadline passed before an attempt succeeded
    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    /// The gateway is shutting down
    #[error("Gateway is shutting down")]
    ShuttingDown,
}

pub type DispatchResult = Result<DispatchSuccess, DispatchError>;

/// Decrements `in_flight` on every exit path. A dropped guard (future
/// cancelled mid-call) reports `Cancelled`; normal completion reports the
/// real outcome through `finish`.
struct InFlightGuard<'a> {
    registry: &'a Registry,
    id: BackendId,
    finished: bool,
}

impl<'a> InFlightGuard<'a> {
    /// Claim a slot only when the backend is under `cap`. `Ok(None)` means
    /// the slot race was lost and the caller must re-queue.
    fn begin_capped(
        registry: &'a Registry,
        id: BackendId,
        cap: u32,
    ) -> Result<Option<Self>, crate::registry::RegistryError> {
        if !registry.try_begin_dispatch(&id, cap)? {
            return Ok(None);
        }
        Ok(Some(Self {
            registry,
            id,
            finished: false,
        }))
    }

    fn finish(&mut self, outcome: DispatchOutcome) {
        if !self.finished {
            self.finished = true;
            let _ = self.registry.end_dispatch(&self.id, outcome);
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self
                .registry
                .end_dispatch(&self.id, DispatchOutcome::Cancelled);
        }
    }
}

enum TryResult {
    Success {
        reply: DispatchReply,
        backend: BackendId,
    },
    Failures {
        failures: Vec<(BackendId, UpstreamError, u64)>,
        /// Candidates that lost the slot race; they were never actually
        /// attempted and stay eligible for later attempts
        capacity_losers: Vec<BackendId>,
    },
    /// Every candidate lost the slot race: the backends reached their cap
    /// between the snapshot and the claim
    AtCapacity,
}

enum CallFailure {
    AtCapacity,
    Upstream(UpstreamError, u64),
}

/// The dispatch engine.
pub struct Dispatcher {
    registry: Arc<Registry>,
    recorder: Arc<MetricsRecorder>,
    scorer: Arc<dyn Scorer>,
    queue: Arc<RequestQueue>,
    pool: Arc<WorkerPool>,
    config: DispatchConfig,
    age_credit: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        recorder: Arc<MetricsRecorder>,
        scorer: Arc<dyn Scorer>,
        queue: Arc<RequestQueue>,
        pool: Arc<WorkerPool>,
        config: DispatchConfig,
        age_credit: Duration,
    ) -> Self {
        Self {
            registry,
            recorder,
            scorer,
            queue,
            pool,
            config,
            age_credit,
        }
    }

    /// Run the dispatch loop until cancelled. Each popped entry is served
    /// on its own task; on shutdown the remaining queue is drained with
    /// `ShuttingDown` errors.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Dispatcher started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Dispatcher shutting down");
                        for entry in self.queue.drain() {
                            let _ = entry.response_tx.send(Err(DispatchError::ShuttingDown));
                        }
                        break;
                    }
                    entry = self.queue.pop_ready() => {
                        // With the whole fleet at its concurrency caps no
                        // entry can dispatch; re-queue (seq preserved, so
                        // FIFO holds) and pause instead of spawning tasks
                        // that would race for the next free slot.
                        if self.fleet_saturated() {
                            self.queue.resubmit(entry, self.age_credit);
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                            }
                            continue;
                        }
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            this.dispatch_entry(entry).await;
                        });
                    }
                }
            }
        })
    }

    /// Serve one entry to completion: ranked attempts with failover,
    /// capacity re-queue, hedging, backoff, and cancellation.
    pub async fn dispatch_entry(self: Arc<Self>, mut entry: QueueEntry) {
        let ctx = entry.context.clone();
        let endpoint = entry.payload.endpoint();
        let body = entry.payload.upstream_body();
        let streaming = entry.payload.is_stream();
        let timeout = self.timeout_for(&entry.payload);
        let cap = self.config.per_backend_concurrency;
        let started = Instant::now();

        let mut tried: HashSet<BackendId> = HashSet::new();
        let mut failed: Vec<AttemptDiagnostic> = Vec::new();
        let mut attempt: u32 = 0;

        let terminal: DispatchResult = loop {
            if attempt >= self.config.max_retries {
                break Err(DispatchError::AllAttemptsFailed {
                    attempts: std::mem::take(&mut failed),
                });
            }

            if entry.response_tx.is_closed() {
                tracing::debug!(request_id = %entry.request_id, "Client gone, abandoning entry");
                return;
            }

            let snapshot = self.registry.snapshot();
            let ranked = self.scorer.score(&ctx, &snapshot, Instant::now());
            if ranked.is_empty() {
                metrics::counter!("sollol_errors_total", "kind" => "no_backend").increment(1);
                tracing::error!(
                    request_id = %entry.request_id,
                    model = %ctx.model,
                    "No alive, non-excluded backend available"
                );
                break Err(DispatchError::NoBackendAvailable);
            }

            let untried: Vec<&ScoredCandidate> = ranked
                .iter()
                .filter(|c| !tried.contains(&c.snapshot.id))
                .collect();
            if untried.is_empty() {
                break Err(DispatchError::AllAttemptsFailed {
                    attempts: std::mem::take(&mut failed),
                });
            }

            let under_cap: Vec<&ScoredCandidate> = untried
                .iter()
                .copied()
                .filter(|c| c.snapshot.in_flight < cap)
                .collect();
            if under_cap.is_empty() {
                // Every eligible candidate is saturated: hand the entry
                // back to the queue with an age credit so it re-enters at
                // the head of its priority class. The short pause keeps a
                // saturated fleet from spinning pop/resubmit cycles.
                tracing::debug!(
                    request_id = %entry.request_id,
                    "All candidates at concurrency cap, re-queueing"
                );
                tokio::select! {
                    biased;
                    _ = entry.response_tx.closed() => return,
                    _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                }
                self.queue.resubmit(entry, self.age_credit);
                return;
            }

            let primary = under_cap[0].clone();
            let hedge = self.hedge_candidate(&ctx, attempt, &under_cap);

            tried.insert(primary.snapshot.id.clone());
            if let Some((candidate, _)) = &hedge {
                tried.insert(candidate.snapshot.id.clone());
            }

            let attempt_fut = self.try_candidates(
                &ctx,
                &primary.snapshot.id,
                hedge
                    .as_ref()
                    .map(|(candidate, delay)| (candidate.snapshot.id.clone(), *delay)),
                endpoint,
                &body,
                timeout,
                streaming,
            );
            tokio::pin!(attempt_fut);

            enum Waited {
                Done(TryResult),
                ClientGone,
                Deadline,
            }

            let deadline = entry.deadline;
            let waited = tokio::select! {
                biased;
                _ = entry.response_tx.closed() => Waited::ClientGone,
                _ = Self::sleep_until_deadline(deadline) => Waited::Deadline,
                result = &mut attempt_fut => Waited::Done(result),
            };

            match waited {
                Waited::ClientGone => {
                    // Dropping the attempt future aborts the upstream call;
                    // the in-flight guard records the cancellation.
                    self.recorder
                        .record_cancelled(&primary.snapshot.id, ctx.task_type, &ctx.model);
                    tracing::info!(request_id = %entry.request_id, "Client disconnected, dispatch cancelled");
                    return;
                }
                Waited::Deadline => {
                    self.recorder
                        .record_cancelled(&primary.snapshot.id, ctx.task_type, &ctx.model);
                    break Err(DispatchError::DeadlineExceeded);
                }
                Waited::Done(TryResult::Success { reply, backend }) => {
                    let winner = if backend == primary.snapshot.id {
                        &primary
                    } else {
                        hedge
                            .as_ref()
                            .map(|(candidate, _)| candidate)
                            .unwrap_or(&primary)
                    };
                    break Ok(DispatchSuccess {
                        reply,
                        decision: Self::decision_for(winner, &ranked),
                        failed_attempts: std::mem::take(&mut failed),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Waited::Done(TryResult::AtCapacity) => {
                    // Lost the slot race after the snapshot showed room;
                    // same treatment as a saturated candidate list.
                    tokio::select! {
                        biased;
                        _ = entry.response_tx.closed() => return,
                        _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                    }
                    self.queue.resubmit(entry, self.age_credit);
                    return;
                }
                Waited::Done(TryResult::Failures {
                    failures,
                    capacity_losers,
                }) => {
                    // Capacity losers were never attempted; let later
                    // attempts pick them again.
                    for loser in capacity_losers {
                        tried.remove(&loser);
                    }

                    let mut rejected: Option<AttemptDiagnostic> = None;
                    for (backend, error, latency_ms) in failures {
                        let diagnostic = AttemptDiagnostic {
                            backend,
                            error_class: error.class(),
                            message: error.to_string(),
                            latency_ms,
                        };
                        // Non-retriable upstream rejections stop the walk,
                        // except a 404 on the model: another backend may
                        // have it pulled.
                        if !diagnostic.error_class.is_retriable() && !error.is_model_missing() {
                            rejected = Some(diagnostic.clone());
                        }
                        failed.push(diagnostic);
                    }
                    if let Some(attempt) = rejected {
                        break Err(DispatchError::UpstreamRejected { attempt });
                    }

                    attempt += 1;
                    if attempt < self.config.max_retries {
                        let delay = self.backoff_delay(attempt - 1);
                        tokio::select! {
                            biased;
                            _ = entry.response_tx.closed() => {
                                tracing::debug!(request_id = %entry.request_id, "Client gone during backoff");
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        };

        let _ = entry.response_tx.send(terminal);
    }

    /// Race the primary candidate against an optional delayed hedge.
    /// First success wins; the loser is aborted. When both fail, every
    /// failure is reported for diagnostics.
    async fn try_candidates(
        &self,
        ctx: &RequestContext,
        primary: &BackendId,
        hedge: Option<(BackendId, Duration)>,
        endpoint: &str,
        body: &serde_json::Value,
        timeout: Duration,
        streaming: bool,
    ) -> TryResult {
        let Some((hedge_id, delay)) = hedge else {
            return match self
                .call_one(ctx, primary, endpoint, body, timeout, streaming)
                .await
            {
                Ok(reply) => TryResult::Success {
                    reply,
                    backend: primary.clone(),
                },
                Err(CallFailure::AtCapacity) => TryResult::AtCapacity,
                Err(CallFailure::Upstream(error, latency)) => TryResult::Failures {
                    failures: vec![(primary.clone(), error, latency)],
                    capacity_losers: vec![],
                },
            };
        };

        tracing::debug!(
            primary = %primary,
            hedge = %hedge_id,
            delay_ms = delay.as_millis() as u64,
            "Hedged dispatch"
        );

        let primary_fut =
            Box::pin(self.call_one(ctx, primary, endpoint, body, timeout, streaming));
        let hedge_fut = Box::pin({
            let hedge_id = hedge_id.clone();
            async move {
                tokio::time::sleep(delay).await;
                self.call_one(ctx, &hedge_id, endpoint, body, timeout, streaming)
                    .await
            }
        });

        use futures::future::{select, Either};
        match select(primary_fut, hedge_fut).await {
            Either::Left((Ok(reply), _hedge)) => TryResult::Success {
                reply,
                backend: primary.clone(),
            },
            Either::Right((Ok(reply), _primary)) => TryResult::Success {
                reply,
                backend: hedge_id.clone(),
            },
            Either::Left((Err(f1), hedge_rest)) => match hedge_rest.await {
                Ok(reply) => TryResult::Success {
                    reply,
                    backend: hedge_id.clone(),
                },
                Err(f2) => Self::merge_hedge_failures(primary, f1, &hedge_id, f2),
            },
            Either::Right((Err(f2), primary_rest)) => match primary_rest.await {
                Ok(reply) => TryResult::Success {
                    reply,
                    backend: primary.clone(),
                },
                Err(f1) => Self::merge_hedge_failures(primary, f1, &hedge_id, f2),
            },
        }
    }

    fn merge_hedge_failures(
        primary: &BackendId,
        primary_failure: CallFailure,
        hedge: &BackendId,
        hedge_failure: CallFailure,
    ) -> TryResult {
        let mut failures = Vec::new();
        let mut capacity_losers = Vec::new();
        match primary_failure {
            CallFailure::Upstream(error, latency) => failures.push((primary.clone(), error, latency)),
            CallFailure::AtCapacity => capacity_losers.push(primary.clone()),
        }
        match hedge_failure {
            CallFailure::Upstream(error, latency) => failures.push((hedge.clone(), error, latency)),
            CallFailure::AtCapacity => capacity_losers.push(hedge.clone()),
        }

        if failures.is_empty() {
            TryResult::AtCapacity
        } else {
            TryResult::Failures {
                failures,
                capacity_losers,
            }
        }
    }

    /// One upstream call with full in-flight and outcome accounting.
    async fn call_one(
        &self,
        ctx: &RequestContext,
        id: &BackendId,
        endpoint: &str,
        body: &serde_json::Value,
        timeout: Duration,
        streaming: bool,
    ) -> Result<DispatchReply, CallFailure> {
        let cap = self.config.per_backend_concurrency;
        let mut guard = match InFlightGuard::begin_capped(&self.registry, id.clone(), cap) {
            Ok(Some(guard)) => guard,
            Ok(None) => return Err(CallFailure::AtCapacity),
            Err(e) => {
                return Err(CallFailure::Upstream(
                    UpstreamError::Network(e.to_string()),
                    0,
                ))
            }
        };

        let started_at = chrono::Utc::now();
        let started = Instant::now();

        let result = if streaming {
            self.pool
                .call_streaming(id, endpoint, body, timeout)
                .await
                .map(DispatchReply::Stream)
        } else {
            self.pool
                .call_json(id, endpoint, body, timeout)
                .await
                .map(DispatchReply::Json)
        };

        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(reply) => {
                guard.finish(DispatchOutcome::Succeeded);
                let completion_size = match &reply {
                    DispatchReply::Json(value) => value.to_string().len(),
                    DispatchReply::Stream(_) => 0,
                };
                self.recorder.record(PerformanceSample {
                    backend: id.clone(),
                    task_type: ctx.task_type,
                    model: ctx.model.clone(),
                    started_at,
                    finished_at: chrono::Utc::now(),
                    success: true,
                    error_class: None,
                    duration_ms: latency_ms,
                    prompt_size: ctx.estimated_tokens as usize * 4,
                    completion_size,
                });
                Ok(reply)
            }
            Err(error) => {
                guard.finish(DispatchOutcome::Failed);
                let class = error.class();
                if class.is_retriable() {
                    // Counts against the backend: feeds success rate and
                    // the exclusion streak.
                    self.recorder.record(PerformanceSample {
                        backend: id.clone(),
                        task_type: ctx.task_type,
                        model: ctx.model.clone(),
                        started_at,
                        finished_at: chrono::Utc::now(),
                        success: false,
                        error_class: Some(class.as_str().to_string()),
                        duration_ms: latency_ms,
                        prompt_size: ctx.estimated_tokens as usize * 4,
                        completion_size: 0,
                    });
                } else {
                    tracing::warn!(
                        backend = %id,
                        error_class = class.as_str(),
                        "Upstream rejection, not counted against backend"
                    );
                }
                Err(CallFailure::Upstream(error, latency_ms))
            }
        }
    }

    /// True when at least one backend is routable but every routable
    /// backend is at its concurrency cap. Distinct from "no backend
    /// available": that case must flow through dispatch and fail.
    fn fleet_saturated(&self) -> bool {
        let now = Instant::now();
        let mut any_available = false;
        for backend in self.registry.snapshot() {
            if backend.is_available(now) {
                any_available = true;
                if backend.in_flight < self.config.per_backend_concurrency {
                    return false;
                }
            }
        }
        any_available
    }

    fn hedge_candidate(
        &self,
        ctx: &RequestContext,
        attempt: u32,
        under_cap: &[&ScoredCandidate],
    ) -> Option<(ScoredCandidate, Duration)> {
        if !self.config.hedging_enabled || ctx.priority < 9 || attempt != 0 {
            return None;
        }
        let runner_up = under_cap.get(1)?;
        let primary = under_cap[0];
        let p95 = self
            .recorder
            .p95_duration_ms(&primary.snapshot.id)
            .unwrap_or(u64::MAX);
        let delay = Duration::from_millis(self.config.hedging_delay_ms.min(p95));
        Some(((*runner_up).clone(), delay))
    }

    fn decision_for(chosen: &ScoredCandidate, ranked: &[ScoredCandidate]) -> ScoringDecision {
        let [(f1, v1), (f2, v2)] = chosen.breakdown.top_factors();
        ScoringDecision {
            chosen: chosen.snapshot.id.clone(),
            score: chosen.score,
            alternatives: ranked
                .iter()
                .filter(|c| c.snapshot.id != chosen.snapshot.id)
                .take(5)
                .map(|c| (c.snapshot.id.clone(), c.score))
                .collect(),
            rationale: format!(
                "selected {} (score {:.1}); dominant factors: {}={:.2}, {}={:.2}",
                chosen.snapshot.id, chosen.score, f1, v1, f2, v2
            ),
        }
    }

    /// Exponential backoff with +/-25% jitter, capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.config.backoff_cap_ms);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((base as f64 * jitter) as u64)
    }

    fn timeout_for(&self, payload: &RequestPayload) -> Duration {
        match payload {
            RequestPayload::Embed(_) => Duration::from_millis(self.config.embed_timeout_ms),
            _ => Duration::from_millis(self.config.chat_timeout_ms),
        }
    }

    async fn sleep_until_deadline(deadline: Option<Instant>) {
        match deadline {
            Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendEntry, ExclusionConfig, MetricsConfig, QueueConfig};
    use crate::routing::{DefaultScorer, ScoringParams};

    fn dispatcher(config: DispatchConfig) -> Arc<Dispatcher> {
        let registry = Arc::new(Registry::new(
            ExclusionConfig::default(),
            &MetricsConfig::default(),
        ));
        registry
            .add_backend(&BackendEntry {
                host: "a".to_string(),
                port: 11434,
                ..Default::default()
            })
            .unwrap();
        let recorder = Arc::new(MetricsRecorder::new(
            Arc::clone(&registry),
            MetricsConfig::default(),
        ));
        let scorer = Arc::new(DefaultScorer::new(
            ScoringParams::default(),
            Arc::clone(&recorder),
        ));
        let queue = Arc::new(RequestQueue::new(QueueConfig::default()));
        let pool = Arc::new(WorkerPool::new(&config));
        Arc::new(Dispatcher::new(
            registry,
            recorder,
            scorer,
            queue,
            pool,
            config,
            Duration::from_secs(2),
        ))
    }

    #[test]
    fn backoff_grows_and_caps() {
        let dispatcher = dispatcher(DispatchConfig::default());

        // 100ms * 2^0 with +/-25% jitter
        let first = dispatcher.backoff_delay(0).as_millis() as u64;
        assert!((75..=125).contains(&first), "got {first}");

        // 100ms * 2^2 = 400ms
        let third = dispatcher.backoff_delay(2).as_millis() as u64;
        assert!((300..=500).contains(&third), "got {third}");

        // Capped at 2000ms before jitter
        let huge = dispatcher.backoff_delay(10).as_millis() as u64;
        assert!(huge <= 2500, "got {huge}");
    }

    #[test]
    fn timeout_selected_by_endpoint() {
        let dispatcher = dispatcher(DispatchConfig::default());
        let embed = RequestPayload::Embed(crate::api::types::EmbedRequest {
            model: "e".to_string(),
            input: crate::api::types::EmbedInput::Single("x".to_string()),
            priority: None,
            extra: Default::default(),
        });
        let chat = RequestPayload::Chat(crate::api::types::ChatRequest {
            model: "m".to_string(),
            messages: vec![],
            stream: false,
            priority: None,
            extra: Default::default(),
        });

        assert_eq!(dispatcher.timeout_for(&embed), Duration::from_secs(60));
        assert_eq!(dispatcher.timeout_for(&chat), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn in_flight_guard_cancels_on_drop() {
        let registry = Arc::new(Registry::new(
            ExclusionConfig::default(),
            &MetricsConfig::default(),
        ));
        registry
            .add_backend(&BackendEntry {
                host: "a".to_string(),
                port: 11434,
                ..Default::default()
            })
            .unwrap();
        let id = BackendId::new("a", 11434);

        {
            let guard = InFlightGuard::begin_capped(&registry, id.clone(), 8)
                .unwrap()
                .unwrap();
            assert_eq!(registry.snapshot_one(&id).unwrap().in_flight, 1);
            // Dropped without finish(): simulates an aborted future
            drop(guard);
        }
        assert_eq!(registry.snapshot_one(&id).unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn in_flight_guard_finish_is_idempotent() {
        let registry = Arc::new(Registry::new(
            ExclusionConfig::default(),
            &MetricsConfig::default(),
        ));
        registry
            .add_backend(&BackendEntry {
                host: "a".to_string(),
                port: 11434,
                ..Default::default()
            })
            .unwrap();
        let id = BackendId::new("a", 11434);

        let mut guard = InFlightGuard::begin_capped(&registry, id.clone(), 8)
            .unwrap()
            .unwrap();
        guard.finish(DispatchOutcome::Succeeded);
        guard.finish(DispatchOutcome::Failed);
        drop(guard);
        // Exactly one decrement despite finish twice plus drop
        assert_eq!(registry.snapshot_one(&id).unwrap().in_flight, 0);
    }
}
