//! A test double for [`Agent`], used by this crate's own tests and
//! available to other crates' tests so they can exercise the boundary
//! without a real LLM-backed implementation.

use mindmap_core::Result;
use serde_json::Value;

use crate::agent::{Agent, GenerateGraphOutcome, GenerateGraphRequest};

/// Always returns a fixed spec, or a fixed failure if `fail_with` is set.
pub struct MockAgent {
    pub diagram_type: String,
    pub spec: Value,
    pub fail_with: Option<String>,
}

impl MockAgent {
    pub fn succeeding(diagram_type: impl Into<String>, spec: Value) -> Self {
        Self { diagram_type: diagram_type.into(), spec, fail_with: None }
    }

    pub fn failing(diagram_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            diagram_type: diagram_type.into(),
            spec: Value::Null,
            fail_with: Some(error.into()),
        }
    }
}

#[async_trait::async_trait]
impl Agent for MockAgent {
    async fn generate_graph(&self, _request: GenerateGraphRequest) -> GenerateGraphOutcome {
        match &self.fail_with {
            Some(error) => GenerateGraphOutcome::failed(self.diagram_type.clone(), error.clone()),
            None => GenerateGraphOutcome::ok(self.diagram_type.clone(), self.spec.clone()),
        }
    }

    async fn enhance_spec(&self, spec: Value) -> Result<Value> {
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn succeeding_mock_returns_configured_spec() {
        let agent = MockAgent::succeeding("bubble_map", serde_json::json!({"nodes": []}));
        let outcome = agent
            .generate_graph(GenerateGraphRequest {
                prompt: "anything".into(),
                language: "en".into(),
                params: Value::Null,
            })
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.diagram_type, "bubble_map");
        assert_eq!(outcome.spec, Some(serde_json::json!({"nodes": []})));
    }

    #[tokio::test]
    async fn failing_mock_reports_the_configured_error() {
        let agent = MockAgent::failing("bubble_map", "upstream unavailable");
        let outcome = agent
            .generate_graph(GenerateGraphRequest {
                prompt: "anything".into(),
                language: "en".into(),
                params: Value::Null,
            })
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("upstream unavailable"));
        assert!(outcome.spec.is_none());
    }

    #[tokio::test]
    async fn enhance_spec_passes_through_unchanged() {
        let agent = MockAgent::succeeding("tree_map", Value::Null);
        let spec = serde_json::json!({"title": "unchanged"});
        let enhanced = agent.enhance_spec(spec.clone()).await.unwrap();
        assert_eq!(enhanced, spec);
    }
}
