//! Request and response types for the Ollama-compatible gateway surface.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single message in a chat conversation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    /// Pass through any additional fields to the backend
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// `POST /api/chat` body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    /// Router extension: scheduling priority in [1, 10], default 5.
    /// Stripped before the request is forwarded upstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// `POST /api/generate` body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Embedding input: a single string or a batch.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EmbedInput {
    Single(String),
    Batch(Vec<String>),
}

impl EmbedInput {
    pub fn total_chars(&self) -> usize {
        match self {
            EmbedInput::Single(s) => s.len(),
            EmbedInput::Batch(items) => items.iter().map(|s| s.len()).sum(),
        }
    }
}

/// `POST /api/embed` body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbedRequest {
    pub model: String,
    pub input: EmbedInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// An inbound request, tagged by endpoint.
///
/// The analyzer reads only the fields it cares about; everything else is
/// carried opaquely in `extra` and forwarded upstream untouched.
#[derive(Debug, Clone)]
pub enum RequestPayload {
    Chat(ChatRequest),
    Generate(GenerateRequest),
    Embed(EmbedRequest),
}

impl RequestPayload {
    pub fn model(&self) -> &str {
        match self {
            RequestPayload::Chat(r) => &r.model,
            RequestPayload::Generate(r) => &r.model,
            RequestPayload::Embed(r) => &r.model,
        }
    }

    pub fn priority_raw(&self) -> Option<i64> {
        match self {
            RequestPayload::Chat(r) => r.priority,
            RequestPayload::Generate(r) => r.priority,
            RequestPayload::Embed(r) => r.priority,
        }
    }

    /// Total prompt size in characters, the token-estimate input.
    pub fn prompt_chars(&self) -> usize {
        match self {
            RequestPayload::Chat(r) => r.messages.iter().map(|m| m.content.len()).sum(),
            RequestPayload::Generate(r) => r.prompt.len(),
            RequestPayload::Embed(r) => r.input.total_chars(),
        }
    }

    /// Number of conversation turns (1 for non-chat requests).
    pub fn conversation_depth(&self) -> usize {
        match self {
            RequestPayload::Chat(r) => r.messages.len(),
            _ => 1,
        }
    }

    /// Content of the last user message, for keyword classification.
    pub fn last_user_text(&self) -> &str {
        match self {
            RequestPayload::Chat(r) => r
                .messages
                .iter()
                .rev()
                .find(|m| m.role == "user")
                .map(|m| m.content.as_str())
                .unwrap_or(""),
            RequestPayload::Generate(r) => &r.prompt,
            RequestPayload::Embed(_) => "",
        }
    }

    pub fn is_stream(&self) -> bool {
        match self {
            RequestPayload::Chat(r) => r.stream,
            RequestPayload::Generate(r) => r.stream,
            RequestPayload::Embed(_) => false,
        }
    }

    /// Upstream endpoint path for this payload.
    pub fn endpoint(&self) -> &'static str {
        match self {
            RequestPayload::Chat(_) => "/api/chat",
            RequestPayload::Generate(_) => "/api/generate",
            RequestPayload::Embed(_) => "/api/embed",
        }
    }

    /// Serialize for forwarding, with the router-only `priority` field
    /// stripped so upstreams never see it.
    pub fn upstream_body(&self) -> serde_json::Value {
        let mut value = match self {
            RequestPayload::Chat(r) => serde_json::to_value(r),
            RequestPayload::Generate(r) => serde_json::to_value(r),
            RequestPayload::Embed(r) => serde_json::to_value(r),
        }
        .unwrap_or(serde_json::Value::Null);

        if let Some(obj) = value.as_object_mut() {
            obj.remove("priority");
        }
        value
    }
}

/// One failed dispatch attempt, surfaced in the routing envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub backend: String,
    pub error_class: String,
    pub message: String,
    pub latency_ms: u64,
}

/// Routing metadata attached to every successful gateway response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingInfo {
    pub chosen_backend: String,
    pub task_type: String,
    pub complexity: String,
    pub decision_score: f64,
    pub rationale: String,
    pub actual_duration_ms: u64,
    pub failed_attempts: Vec<FailedAttempt>,
    #[serde(default)]
    pub delegated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_preserves_unknown_fields() {
        let body = serde_json::json!({
            "model": "llama3.1",
            "messages": [{"role": "user", "content": "hi"}],
            "options": {"temperature": 0.2},
            "keep_alive": "5m"
        });
        let request: ChatRequest = serde_json::from_value(body).unwrap();
        assert!(request.extra.contains_key("options"));
        assert!(request.extra.contains_key("keep_alive"));

        let round_tripped = serde_json::to_value(&request).unwrap();
        assert_eq!(round_tripped["options"]["temperature"], 0.2);
    }

    #[test]
    fn upstream_body_strips_priority() {
        let body = serde_json::json!({
            "model": "llama3.1",
            "messages": [{"role": "user", "content": "hi"}],
            "priority": 9
        });
        let request: ChatRequest = serde_json::from_value(body).unwrap();
        let payload = RequestPayload::Chat(request);

        let upstream = payload.upstream_body();
        assert!(upstream.get("priority").is_none());
        assert_eq!(upstream["model"], "llama3.1");
    }

    #[test]
    fn embed_input_accepts_single_and_batch() {
        let single: EmbedRequest =
            serde_json::from_value(serde_json::json!({"model": "e", "input": "hello"})).unwrap();
        assert_eq!(single.input.total_chars(), 5);

        let batch: EmbedRequest =
            serde_json::from_value(serde_json::json!({"model": "e", "input": ["ab", "cd"]}))
                .unwrap();
        assert_eq!(batch.input.total_chars(), 4);
    }

    #[test]
    fn last_user_text_skips_assistant_turns() {
        let request: ChatRequest = serde_json::from_value(serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": "second"},
                {"role": "assistant", "content": "trailing"}
            ]
        }))
        .unwrap();
        let payload = RequestPayload::Chat(request);
        assert_eq!(payload.last_user_text(), "second");
        assert_eq!(payload.conversation_depth(), 4);
    }
}
