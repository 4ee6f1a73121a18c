//! Single-provider transport contract (spec §4.1).

use async_trait::async_trait;
use futures::stream::BoxStream;
use mindmap_core::{ChatResult, Message, PhysicalModel, Result, StreamChunk};

/// One remote chat endpoint. Implementations are per-endpoint and
/// interchangeable at the [`crate::pool::ClientPool`] level.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// The physical model name this client serves, e.g. `"ark-deepseek"`.
    fn physical_model(&self) -> &PhysicalModel;

    /// Non-streaming chat completion.
    async fn chat(
        &self,
        messages: &[Message],
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<ChatResult>;

    /// Streaming chat completion. Emits exactly one `StreamChunk::Usage` at
    /// end-of-stream when the upstream reports usage; its absence means
    /// "not available," never an error.
    async fn stream_chat(
        &self,
        messages: &[Message],
        temperature: Option<f32>,
        max_tokens: Option<u32>,
        enable_thinking: bool,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>>;
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scriptable provider client used by tests in this crate and in
    /// `mindmap-agent`'s mock agent.
    pub struct StubProvider {
        pub model: PhysicalModel,
        pub calls: Arc<AtomicUsize>,
        pub fail: bool,
    }

    impl StubProvider {
        pub fn new(model: impl Into<PhysicalModel>) -> Self {
            Self {
                model: model.into(),
                calls: Arc::new(AtomicUsize::new(0)),
                fail: false,
            }
        }

        pub fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    #[async_trait]
    impl ProviderClient for StubProvider {
        fn physical_model(&self) -> &PhysicalModel {
            &self.model
        }

        async fn chat(
            &self,
            messages: &[Message],
            _temperature: Option<f32>,
            _max_tokens: Option<u32>,
        ) -> Result<ChatResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(mindmap_core::CoreError::Transport("stub failure".into()));
            }
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(ChatResult {
                content: format!("echo:{last}"),
                usage: Some(mindmap_core::TokenUsage::new(10, 5)),
            })
        }

        async fn stream_chat(
            &self,
            messages: &[Message],
            _temperature: Option<f32>,
            _max_tokens: Option<u32>,
            _enable_thinking: bool,
        ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
            use futures::stream;
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(mindmap_core::CoreError::Transport("stub failure".into()));
            }
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            let chunks = vec![
                Ok(StreamChunk::Token(format!("echo:{last}"))),
                Ok(StreamChunk::Usage(mindmap_core::TokenUsage::new(10, 5))),
            ];
            Ok(Box::pin(stream::iter(chunks)))
        }
    }
}
