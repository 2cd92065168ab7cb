//! Priority admission queue.
//!
//! Entries are ordered by effective priority: the declared priority plus an
//! age boost that grows while the entry waits. The boost guarantees
//! non-starvation: any entry eventually reaches effective priority 10 and,
//! because ties break FIFO on submission order, it then outranks every
//! later arrival. Completion is signalled back to the gateway through a
//! oneshot channel owned by each entry.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

use crate::analyze::RequestContext;
use crate::api::types::RequestPayload;
use crate::dispatch::DispatchResult;
use crate::config::QueueConfig;

/// Number of recent pop-waits retained for the stats percentiles.
const WAIT_WINDOW: usize = 512;

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Queue is at capacity
    #[error("Queue is full ({max_size} requests)")]
    Full { max_size: usize },
}

/// A request admitted to the queue, owned by the queue until popped.
pub struct QueueEntry {
    pub request_id: Uuid,
    pub context: RequestContext,
    pub payload: RequestPayload,
    /// Channel the dispatcher answers on
    pub response_tx: oneshot::Sender<DispatchResult>,
    pub submitted_at: Instant,
    /// Extra simulated wait granted on capacity re-queues
    pub age_credit: Duration,
    /// Caller-supplied total deadline
    pub deadline: Option<Instant>,
    /// Submission order; assigned by the queue
    seq: u64,
}

impl QueueEntry {
    pub fn new(
        context: RequestContext,
        payload: RequestPayload,
        response_tx: oneshot::Sender<DispatchResult>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            context,
            payload,
            response_tx,
            submitted_at: Instant::now(),
            age_credit: Duration::ZERO,
            deadline,
            seq: 0,
        }
    }
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("request_id", &self.request_id)
            .field("priority", &self.context.priority)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Queue statistics for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    /// Queued entries per declared priority (index 0 = priority 1)
    pub depth_by_priority: [usize; 10],
    pub p50_wait_ms: u64,
    pub p95_wait_ms: u64,
}

/// Age-boosted priority queue.
pub struct RequestQueue {
    entries: Mutex<Vec<QueueEntry>>,
    notify: Notify,
    seq: AtomicU64,
    wait_samples: Mutex<VecDeque<u64>>,
    config: QueueConfig,
}

impl RequestQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            wait_samples: Mutex::new(VecDeque::new()),
            config,
        }
    }

    /// Admit an entry. Returns `QueueError::Full` at capacity.
    pub fn submit(&self, mut entry: QueueEntry) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        if entries.len() >= self.config.max_size {
            return Err(QueueError::Full {
                max_size: self.config.max_size,
            });
        }

        entry.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        entries.push(entry);
        metrics::gauge!("sollol_queue_depth").set(entries.len() as f64);
        drop(entries);

        self.notify.notify_one();
        Ok(())
    }

    /// Re-admit an entry the dispatcher could not place because every
    /// candidate was at its concurrency cap. The age credit keeps its
    /// effective priority at the head of its class; capacity is not
    /// re-checked because the entry was already admitted once.
    pub fn resubmit(&self, mut entry: QueueEntry, age_credit: Duration) {
        entry.age_credit += age_credit;
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        entries.push(entry);
        metrics::gauge!("sollol_queue_depth").set(entries.len() as f64);
        drop(entries);

        self.notify.notify_one();
    }

    /// Remove and return the entry with the highest effective priority,
    /// waiting cooperatively while the queue is empty.
    pub async fn pop_ready(&self) -> QueueEntry {
        loop {
            let notified = self.notify.notified();

            if let Some(entry) = self.try_pop(Instant::now()) {
                return entry;
            }

            notified.await;
        }
    }

    /// Non-blocking pop of the best entry at `now`.
    pub fn try_pop(&self, now: Instant) -> Option<QueueEntry> {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        if entries.is_empty() {
            return None;
        }

        let best = entries
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                self.effective_priority(a, now)
                    .cmp(&self.effective_priority(b, now))
                    // FIFO within a priority class: older submission wins
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|(idx, _)| idx)?;

        let entry = entries.swap_remove(best);
        metrics::gauge!("sollol_queue_depth").set(entries.len() as f64);
        drop(entries);

        self.record_wait(now.saturating_duration_since(entry.submitted_at));
        Some(entry)
    }

    /// Remove a queued entry by request id. Idempotent: removing an entry
    /// that was already popped or cancelled is a no-op.
    pub fn cancel(&self, request_id: Uuid) -> bool {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        let before = entries.len();
        entries.retain(|e| e.request_id != request_id);
        let removed = entries.len() < before;
        if removed {
            metrics::gauge!("sollol_queue_depth").set(entries.len() as f64);
        }
        removed
    }

    /// Remove every queued entry, for shutdown draining.
    pub fn drain(&self) -> Vec<QueueEntry> {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        metrics::gauge!("sollol_queue_depth").set(0.0);
        std::mem::take(&mut *entries)
    }

    pub fn depth(&self) -> usize {
        self.entries.lock().expect("queue lock poisoned").len()
    }

    pub fn stats(&self) -> QueueStats {
        let entries = self.entries.lock().expect("queue lock poisoned");
        let mut depth_by_priority = [0usize; 10];
        for entry in entries.iter() {
            let idx = (entry.context.priority.clamp(1, 10) - 1) as usize;
            depth_by_priority[idx] += 1;
        }
        let depth = entries.len();
        drop(entries);

        let mut waits: Vec<u64> = self
            .wait_samples
            .lock()
            .expect("queue lock poisoned")
            .iter()
            .copied()
            .collect();
        waits.sort_unstable();
        let percentile = |p: usize| -> u64 {
            if waits.is_empty() {
                0
            } else {
                waits[((waits.len() - 1) * p) / 100]
            }
        };

        QueueStats {
            depth,
            depth_by_priority,
            p50_wait_ms: percentile(50),
            p95_wait_ms: percentile(95),
        }
    }

    /// Declared priority plus age boost, saturating at 10.
    fn effective_priority(&self, entry: &QueueEntry, now: Instant) -> u8 {
        let waited = now.saturating_duration_since(entry.submitted_at) + entry.age_credit;
        let step = self.config.age_boost_step_ms.max(1);
        let boost = (waited.as_millis() as u64 / step).min(self.config.age_boost_cap as u64) as u8;
        entry.context.priority.saturating_add(boost).min(10)
    }

    fn record_wait(&self, waited: Duration) {
        let mut samples = self.wait_samples.lock().expect("queue lock poisoned");
        samples.push_back(waited.as_millis() as u64);
        while samples.len() > WAIT_WINDOW {
            samples.pop_front();
        }
    }
}
