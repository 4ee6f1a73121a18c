//! Shared OpenAI-compatible chat-completions adapter, used for both
//! Dashscope and Volcengine Ark physical models (spec §4.1).

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use mindmap_core::{ChatResult, CoreError, Message, MessageRole, PhysicalModel, Result, StreamChunk, TokenUsage};

use crate::provider::ProviderClient;

/// A single provider endpoint speaking the OpenAI chat-completions wire
/// format. Dashscope's compatible-mode and Volcengine Ark both implement
/// this, so one struct covers every physical model in this deployment.
pub struct OpenAiCompatibleClient {
    physical_model: PhysicalModel,
    endpoint: String,
    wire_model: String,
    api_key: String,
    client: Client,
}

impl OpenAiCompatibleClient {
    pub fn new(
        physical_model: impl Into<PhysicalModel>,
        endpoint: impl Into<String>,
        wire_model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        // Connection-pooled client: avoids a TCP/TLS handshake per call,
        // the same tuning the teacher applies to its local Ollama runtime.
        let client = Client::builder()
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(5))
            .http2_keep_alive_interval(Duration::from_secs(30))
            .http2_keep_alive_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CoreError::Transport(e.to_string()))?;

        Ok(Self {
            physical_model: physical_model.into(),
            endpoint: endpoint.into(),
            wire_model: wire_model.into(),
            api_key: api_key.into(),
            client,
        })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.trim_end_matches('/'))
    }

    fn request_body(&self, messages: &[Message], temperature: Option<f32>, max_tokens: Option<u32>, stream: bool) -> serde_json::Value {
        let wire_messages: Vec<_> = messages.iter().map(wire_message).collect();
        json!({
            "model": self.wire_model,
            "messages": wire_messages,
            "temperature": temperature.unwrap_or(0.7),
            "max_tokens": max_tokens,
            "stream": stream,
        })
    }

    async fn send(&self, body: serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        if !response.status().is_success() {
            return Err(classify_status(response).await);
        }
        Ok(response)
    }
}

fn wire_message(m: &Message) -> serde_json::Value {
    let role = match m.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    };
    json!({ "role": role, "content": m.content })
}

fn classify_reqwest_error(err: reqwest::Error) -> CoreError {
    if err.is_timeout() {
        CoreError::Timeout(0)
    } else if err.is_connect() {
        CoreError::Transport(format!("connect error: {err}"))
    } else {
        CoreError::Transport(err.to_string())
    }
}

async fn classify_status(response: reqwest::Response) -> CoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 429 {
        CoreError::RateLimited(body)
    } else if status.as_u16() == 402 || body.to_lowercase().contains("quota") || body.to_lowercase().contains("insufficient_quota") {
        CoreError::QuotaExhausted(body)
    } else if status.is_client_error() {
        CoreError::InputInvalid(body)
    } else if status.is_server_error() {
        CoreError::ServiceUnavailable(status.as_u16(), body)
    } else {
        CoreError::Transport(format!("http {status}: {body}"))
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageOut,
}

#[derive(Debug, Deserialize)]
struct ChatMessageOut {
    content: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChatChunkChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChunkChoice {
    delta: ChatDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChatDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
}

#[async_trait]
impl ProviderClient for OpenAiCompatibleClient {
    fn physical_model(&self) -> &PhysicalModel {
        &self.physical_model
    }

    async fn chat(
        &self,
        messages: &[Message],
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<ChatResult> {
        let body = self.request_body(messages, temperature, max_tokens, false);
        let response = self.send(body).await?;
        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CoreError::ResponseInvalid(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CoreError::ResponseInvalid("empty choices".into()))?;

        if content.is_empty() {
            return Err(CoreError::ResponseInvalid("empty content".into()));
        }

        let usage = parsed.usage.map(|u| {
            TokenUsage::new(u.prompt_tokens, u.completion_tokens).with_reported_total(Some(u.total_tokens))
        });

        Ok(ChatResult { content, usage })
    }

    async fn stream_chat(
        &self,
        messages: &[Message],
        temperature: Option<f32>,
        max_tokens: Option<u32>,
        enable_thinking: bool,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let body = self.request_body(messages, temperature, max_tokens, true);
        let response = self.send(body).await?;
        let byte_stream = response.bytes_stream();

        // A `data: {...}` frame can land split across two TCP reads, so the
        // line buffer has to survive across chunks rather than resetting
        // per-chunk (mirrors the ollama backend's byte accumulator).
        let chunk_stream = byte_stream
            .map(|chunk| chunk.map_err(classify_reqwest_error))
            .scan(Vec::<u8>::new(), move |buffer, chunk| {
                let events = match chunk {
                    Ok(bytes) => {
                        buffer.extend_from_slice(&bytes);
                        drain_sse_lines(buffer, enable_thinking)
                    }
                    Err(e) => vec![Err(e)],
                };
                futures::future::ready(Some(events))
            })
            .flat_map(stream::iter);

        Ok(Box::pin(chunk_stream))
    }
}

/// Pull every complete `\n`-terminated line out of `buffer`, parse each as
/// one SSE frame, and leave any trailing partial line in `buffer` for the
/// next chunk to complete.
fn drain_sse_lines(buffer: &mut Vec<u8>, enable_thinking: bool) -> Vec<Result<StreamChunk>> {
    let mut out = Vec::new();

    loop {
        let Some(nl_pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };
        let line = String::from_utf8_lossy(&buffer[..nl_pos]).trim().to_string();
        *buffer = buffer[nl_pos + 1..].to_vec();

        if line.is_empty() {
            continue;
        }
        out.extend(parse_sse_line(&line, enable_thinking));
    }

    out
}

/// Parse one `data: {...}` SSE line. Dashscope and Volcengine Ark both use
/// the OpenAI SSE convention: one JSON object per `data:` line, terminated
/// by a literal `data: [DONE]` line.
fn parse_sse_line(line: &str, enable_thinking: bool) -> Vec<Result<StreamChunk>> {
    let mut out = Vec::new();

    let Some(payload) = line.strip_prefix("data: ") else {
        return out;
    };
    if payload == "[DONE]" {
        return out;
    }

    let parsed: std::result::Result<ChatCompletionChunk, _> = serde_json::from_str(payload);
    let Ok(parsed) = parsed else { return out };

    if let Some(usage) = parsed.usage {
        out.push(Ok(StreamChunk::Usage(
            TokenUsage::new(usage.prompt_tokens, usage.completion_tokens)
                .with_reported_total(Some(usage.total_tokens)),
        )));
        return out;
    }

    if let Some(choice) = parsed.choices.into_iter().next() {
        if enable_thinking {
            if let Some(reasoning) = choice.delta.reasoning_content {
                if !reasoning.is_empty() {
                    out.push(Ok(StreamChunk::Thinking(reasoning)));
                }
            }
        }
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                out.push(Ok(StreamChunk::Token(content)));
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_token_and_usage_frames() {
        let frame = b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: {\"choices\":[],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2,\"total_tokens\":3}}\n\ndata: [DONE]\n";
        let mut buffer = frame.to_vec();
        let events = drain_sse_lines(&mut buffer, false);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Ok(StreamChunk::Token(_))));
        assert!(matches!(events[1], Ok(StreamChunk::Usage(_))));
        assert!(buffer.is_empty());
    }

    #[test]
    fn thinking_tokens_dropped_when_disabled() {
        let frame = b"data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"hmm\"}}]}\n\n";
        let mut buffer = frame.to_vec();
        let events = drain_sse_lines(&mut buffer, false);
        assert!(events.is_empty());
    }

    #[test]
    fn frame_split_across_chunks_is_reassembled() {
        // The `data: {...}` line arrives in two pieces, as it would when a
        // TCP read boundary lands mid-frame.
        let mut buffer = Vec::new();
        let first = b"data: {\"choices\":[{\"delta\":{\"cont";
        let second = b"ent\":\"hi\"}}]}\n";

        buffer.extend_from_slice(first);
        let events = drain_sse_lines(&mut buffer, false);
        assert!(events.is_empty(), "no complete line yet, nothing should parse");

        buffer.extend_from_slice(second);
        let events = drain_sse_lines(&mut buffer, false);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Ok(StreamChunk::Token(token)) => assert_eq!(token, "hi"),
            other => panic!("expected a token chunk, got {other:?}"),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn usage_frame_split_across_chunks_is_not_dropped() {
        let mut buffer = Vec::new();
        let first = b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":1,\"completion";
        let second = b"_tokens\":2,\"total_tokens\":3}}\n";

        buffer.extend_from_slice(first);
        assert!(drain_sse_lines(&mut buffer, false).is_empty());

        buffer.extend_from_slice(second);
        let events = drain_sse_lines(&mut buffer, false);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(StreamChunk::Usage(_))));
    }
}
