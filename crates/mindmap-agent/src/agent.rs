//! The Agent contract (spec.md §4.9): a polymorphic producer of diagram
//! specs over two capabilities. Internals — prompt templates, tool use,
//! whatever an implementation does to turn a prompt into a spec — are an
//! explicit Non-goal; this crate specifies only the boundary an agent must
//! present to the rest of the system.

use mindmap_core::Result;
use serde_json::Value;

/// Input to [`Agent::generate_graph`].
#[derive(Debug, Clone)]
pub struct GenerateGraphRequest {
    pub prompt: String,
    pub language: String,
    pub params: Value,
}

/// Output of [`Agent::generate_graph`]. A tagged result rather than a bare
/// `Result<Value, String>` because a failed generation still names the
/// diagram type that was attempted, which callers use for error reporting.
#[derive(Debug, Clone)]
pub struct GenerateGraphOutcome {
    pub success: bool,
    pub diagram_type: String,
    pub spec: Option<Value>,
    pub error: Option<String>,
}

impl GenerateGraphOutcome {
    pub fn ok(diagram_type: impl Into<String>, spec: Value) -> Self {
        Self { success: true, diagram_type: diagram_type.into(), spec: Some(spec), error: None }
    }

    pub fn failed(diagram_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self { success: false, diagram_type: diagram_type.into(), spec: None, error: Some(error.into()) }
    }
}

/// A producer of diagram specs. The core orchestrates `LlmCore` calls on an
/// agent's behalf; it never inspects an agent's internals.
#[async_trait::async_trait]
pub trait Agent: Send + Sync {
    async fn generate_graph(&self, request: GenerateGraphRequest) -> GenerateGraphOutcome;

    async fn enhance_spec(&self, spec: Value) -> Result<Value>;
}
