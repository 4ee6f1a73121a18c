//! Request/result/event types for the LLM orchestration core (spec.md §3).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Opaque name for a model from the caller's point of view (`"deepseek"`).
pub type LogicalModel = String;

/// Opaque name for a concrete provider endpoint (`"ark-deepseek"`).
pub type PhysicalModel = String;

/// Caller-supplied tracking metadata threaded through to the token tracker
/// and the diagram cache (spec.md §3 `ChatRequest`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tracking {
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub api_key_id: Option<String>,
    pub request_type: Option<String>,
    pub diagram_type: Option<String>,
    pub endpoint_path: Option<String>,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
}

/// A chat request addressed to a logical model.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub logical_model: LogicalModel,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub timeout: Option<Duration>,
    pub tracking: Tracking,
    /// Caller already resolved a physical model and load balancing should
    /// be skipped entirely (§4.6.1 step 1).
    pub skip_load_balancing: bool,
    /// Emit reasoning/"thinking" tokens as distinct stream chunks where the
    /// provider distinguishes them.
    pub enable_thinking: bool,
    /// Emit `StreamChunk` variants instead of plain content strings.
    pub yield_structured: bool,
}

impl ChatRequest {
    /// Build a minimal request: a single user-role prompt to a logical
    /// model, all other fields defaulted.
    pub fn new(prompt: impl Into<String>, logical_model: impl Into<LogicalModel>) -> Self {
        Self {
            messages: vec![Message::user(prompt.into())],
            logical_model: logical_model.into(),
            max_tokens: None,
            temperature: None,
            timeout: None,
            tracking: Tracking::default(),
            skip_load_balancing: false,
            enable_thinking: false,
            yield_structured: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.messages.insert(0, Message::system(system.into()));
        self
    }

    pub fn with_tracking(mut self, tracking: Tracking) -> Self {
        self.tracking = tracking;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn skip_load_balancing(mut self) -> Self {
        self.skip_load_balancing = true;
        self
    }
}

/// Token usage reported by (or inferred for) a single call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Reconcile a provider-reported total: the API's total is authoritative
    /// when present (spec.md §3 `ChatResult`).
    pub fn with_reported_total(mut self, reported_total: Option<u32>) -> Self {
        if let Some(total) = reported_total {
            self.total_tokens = total;
        }
        self
    }
}

/// Result of a non-streaming chat call.
#[derive(Debug, Clone)]
pub struct ChatResult {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// A chunk of a structured streaming response.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Reasoning tokens from a reasoning-capable model.
    Thinking(String),
    /// Ordinary response tokens.
    Token(String),
    /// Terminal usage report; at most one per stream.
    Usage(TokenUsage),
}

/// One event in a `progressive`/`streamProgressive` fan-out (§3 `ProgressiveEvent`).
#[derive(Debug, Clone)]
pub struct ProgressiveEvent {
    pub llm: LogicalModel,
    pub kind: ProgressiveEventKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub enum ProgressiveEventKind {
    Token { token: String },
    Complete { duration: Duration, token_count: u32 },
    Error { error: String, duration: Duration },
}

impl ProgressiveEvent {
    pub fn token(llm: impl Into<LogicalModel>, token: impl Into<String>) -> Self {
        Self {
            llm: llm.into(),
            kind: ProgressiveEventKind::Token { token: token.into() },
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn complete(llm: impl Into<LogicalModel>, duration: Duration, token_count: u32) -> Self {
        Self {
            llm: llm.into(),
            kind: ProgressiveEventKind::Complete { duration, token_count },
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error(llm: impl Into<LogicalModel>, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            llm: llm.into(),
            kind: ProgressiveEventKind::Error {
                error: error.into(),
                duration,
            },
            timestamp: chrono::Utc::now(),
        }
    }

    /// Whether this event is one of the two terminal kinds (§4.6.5 invariant:
    /// exactly one terminal event per requested model).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            ProgressiveEventKind::Complete { .. } | ProgressiveEventKind::Error { .. }
        )
    }
}

/// One row to be persisted per LLM call (§3 `UsageRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub model_provider: String,
    pub model_name: PhysicalModel,
    pub model_alias: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub request_type: String,
    pub diagram_type: Option<String>,
    pub endpoint_path: Option<String>,
    pub success: bool,
    pub response_time_ms: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reported_total_wins_over_sum() {
        let usage = TokenUsage::new(10, 20).with_reported_total(Some(99));
        assert_eq!(usage.total_tokens, 99);
        assert_eq!(usage.input_tokens, 10);
    }

    #[test]
    fn reported_total_absent_keeps_sum() {
        let usage = TokenUsage::new(10, 20).with_reported_total(None);
        assert_eq!(usage.total_tokens, 30);
    }

    #[test]
    fn progressive_event_terminal_classification() {
        let token = ProgressiveEvent::token("qwen", "hi");
        let complete = ProgressiveEvent::complete("qwen", Duration::from_secs(1), 3);
        let error = ProgressiveEvent::error("qwen", "boom", Duration::from_secs(1));
        assert!(!token.is_terminal());
        assert!(complete.is_terminal());
        assert!(error.is_terminal());
    }
}
