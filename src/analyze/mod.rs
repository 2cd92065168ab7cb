//! Request analysis.
//!
//! Pure classification of an inbound payload into a [`RequestContext`]: task
//! type, complexity bucket, GPU requirement, token estimate, duration
//! estimate, and clamped priority. No network I/O happens here; the only
//! external input is the optional performance history used for duration
//! prediction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::types::RequestPayload;
use crate::metrics::MetricsRecorder;

/// Character-per-token proxy used for prompt size estimation.
const CHARS_PER_TOKEN: usize = 4;

/// Prompt token estimates above this force a GPU preference regardless of
/// task type.
const GPU_TOKEN_THRESHOLD: u32 = 2000;

/// Conversations at least this deep get bumped one complexity bucket.
const DEEP_CONVERSATION_TURNS: usize = 4;

/// Minimum history samples before the duration predictor trusts the median.
const DURATION_HISTORY_MIN: usize = 5;

/// What kind of work a request represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Generation,
    Embedding,
    Classification,
    Extraction,
    Summarization,
    Analysis,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Generation => "generation",
            TaskType::Embedding => "embedding",
            TaskType::Classification => "classification",
            TaskType::Extraction => "extraction",
            TaskType::Summarization => "summarization",
            TaskType::Analysis => "analysis",
        }
    }
}

/// Prompt size bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        }
    }

    fn upgraded(self) -> Self {
        match self {
            Complexity::Low => Complexity::Medium,
            Complexity::Medium | Complexity::High => Complexity::High,
        }
    }
}

/// The classification a request carries through the router.
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub task_type: TaskType,
    pub complexity: Complexity,
    pub requires_gpu: bool,
    pub estimated_tokens: u32,
    pub estimated_duration_ms: u64,
    /// Normalized model name (":latest" suffix stripped)
    pub model: String,
    /// Clamped to [1, 10]
    pub priority: u8,
    pub submitted_at: DateTime<Utc>,
}

/// Normalize a model name for history keys and profile lookups.
///
/// Drops the `:latest` suffix (Ollama treats `llama3.1` and
/// `llama3.1:latest` as the same model) while preserving size suffixes
/// like `:8b` and `:70b`.
pub fn normalize_model_name(model: &str) -> &str {
    model.strip_suffix(":latest").unwrap_or(model)
}

/// Inspect a payload and produce its [`RequestContext`].
///
/// When a recorder is supplied and holds enough `(task_type, model)`
/// history, the duration estimate is that history's median; otherwise a
/// static table by task type and complexity applies.
pub fn analyze(payload: &RequestPayload, recorder: Option<&MetricsRecorder>) -> RequestContext {
    let model = normalize_model_name(payload.model()).to_string();
    let task_type = classify_task(payload);
    let estimated_tokens = (payload.prompt_chars() / CHARS_PER_TOKEN) as u32;

    let mut complexity = bucket_tokens(estimated_tokens);
    if payload.conversation_depth() >= DEEP_CONVERSATION_TURNS {
        complexity = complexity.upgraded();
    }

    let requires_gpu = matches!(
        task_type,
        TaskType::Generation | TaskType::Summarization | TaskType::Analysis
    ) || estimated_tokens > GPU_TOKEN_THRESHOLD;

    let estimated_duration_ms = recorder
        .and_then(|r| r.median_duration_ms(task_type, &model, DURATION_HISTORY_MIN))
        .unwrap_or_else(|| static_duration_ms(task_type, complexity));

    let priority = clamp_priority(payload.priority_raw());

    RequestContext {
        task_type,
        complexity,
        requires_gpu,
        estimated_tokens,
        estimated_duration_ms,
        model,
        priority,
        submitted_at: Utc::now(),
    }
}

/// Clamp a declared priority to [1, 10], logging once when out of range.
pub fn clamp_priority(raw: Option<i64>) -> u8 {
    match raw {
        None => 5,
        Some(p) if (1..=10).contains(&p) => p as u8,
        Some(p) => {
            let clamped = p.clamp(1, 10) as u8;
            tracing::warn!(requested = p, clamped, "Priority outside [1,10], clamped");
            clamped
        }
    }
}

fn classify_task(payload: &RequestPayload) -> TaskType {
    if matches!(payload, RequestPayload::Embed(_)) {
        return TaskType::Embedding;
    }

    let text = payload.last_user_text().to_lowercase();
    if text.contains("summarize") || text.contains("summarise") {
        TaskType::Summarization
    } else if text.contains("classify") {
        TaskType::Classification
    } else if text.contains("extract") {
        TaskType::Extraction
    } else if text.contains("analyze") || text.contains("analyse") {
        TaskType::Analysis
    } else {
        TaskType::Generation
    }
}

fn bucket_tokens(tokens: u32) -> Complexity {
    if tokens < 500 {
        Complexity::Low
    } else if tokens < 2000 {
        Complexity::Medium
    } else {
        Complexity::High
    }
}

/// Fallback duration estimates in milliseconds, by task and complexity.
fn static_duration_ms(task: TaskType, complexity: Complexity) -> u64 {
    use Complexity::*;
    use TaskType::*;
    match (task, complexity) {
        (Embedding, Low) => 200,
        (Embedding, Medium) => 500,
        (Embedding, High) => 1500,
        (Classification, Low) => 500,
        (Classification, Medium) => 1200,
        (Classification, High) => 3000,
        (Extraction, Low) => 800,
        (Extraction, Medium) => 2000,
        (Extraction, High) => 5000,
        (Generation, Low) => 1500,
        (Generation, Medium) => 4000,
        (Generation, High) => 10_000,
        (Summarization | Analysis, Low) => 2000,
        (Summarization | Analysis, Medium) => 5000,
        (Summarization | Analysis, High) => 12_000,
    }
}
