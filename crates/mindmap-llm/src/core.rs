//! `LlmCore`: the single façade agents call into (spec §4.6).
//!
//! Orchestration grounded on `original_source/services/llm_service.py`
//! (`chat`, `chat_with_usage`, `chat_stream`, `generate_multi`,
//! `generate_progressive`, `stream_progressive`, `generate_race`,
//! `health_check`); the retry-with-backoff shape is grounded on
//! `neomind-llm::rate_limited_client::RateLimitedClient::retry_request`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use rand::Rng;
use tokio::sync::mpsc;

use mindmap_core::{
    ChatRequest, ChatResult, CoreError, HealthErrorCategory, LogicalModel, Message, PhysicalModel,
    Result, StreamChunk,
};

use crate::circuit_breaker::CircuitBreaker;
use crate::load_balancer::LoadBalancer;
use crate::pool::ClientPool;
use crate::provider::ProviderClient;
use crate::rate_limiter::RateLimiterRegistry;
use crate::token_tracker::TokenTracker;

/// Per-logical-model call budget, including retries (§4.6.9). Every model
/// gets the same generous budget today; diagram generation against deep
/// hierarchies is the slow path that sets the floor.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(70);

const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_BACKOFF: Duration = Duration::from_millis(500);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Outcome of one logical model in a `multi`/`progressive` fan-out.
#[derive(Debug, Clone)]
pub struct ModelOutcome {
    pub content: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
    pub success: bool,
}

pub type MultiResult = HashMap<LogicalModel, ModelOutcome>;

/// Winner of a `race` call.
#[derive(Debug, Clone)]
pub struct RaceResult {
    pub llm: LogicalModel,
    pub content: String,
    pub duration: Duration,
}

/// Logical-model health, without leaking upstream error text (§4.6.8).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelHealth {
    pub healthy: bool,
    pub category: Option<HealthErrorCategory>,
    pub latency_ms: Option<u64>,
}

pub struct LlmCore {
    pool: Arc<ClientPool>,
    load_balancer: Arc<LoadBalancer>,
    circuit_breaker: Arc<CircuitBreaker>,
    rate_limiters: Arc<RateLimiterRegistry>,
    token_tracker: Option<Arc<TokenTracker>>,
}

impl LlmCore {
    pub fn new(
        pool: Arc<ClientPool>,
        load_balancer: Arc<LoadBalancer>,
        circuit_breaker: Arc<CircuitBreaker>,
        rate_limiters: Arc<RateLimiterRegistry>,
        token_tracker: Option<Arc<TokenTracker>>,
    ) -> Self {
        Self {
            pool,
            load_balancer,
            circuit_breaker,
            rate_limiters,
            token_tracker,
        }
    }

    /// Resolve `req.logical_model` to a physical model unless the caller
    /// already supplied one (§4.6.1 step 1).
    async fn resolve(&self, req: &ChatRequest) -> Result<PhysicalModel> {
        if req.skip_load_balancing {
            Ok(req.logical_model.clone())
        } else {
            self.load_balancer.resolve(&req.logical_model).await
        }
    }

    fn messages_for(req: &ChatRequest) -> &[Message] {
        &req.messages
    }

    /// §4.6.1 `chat`.
    pub async fn chat(&self, req: ChatRequest) -> Result<String> {
        let (content, _usage) = self.chat_with_usage_inner(req, true).await?;
        Ok(content)
    }

    /// §4.6.2 `chatWithUsage` — same call, but the caller takes ownership of
    /// token tracking instead of the core enqueuing it automatically.
    pub async fn chat_with_usage(&self, req: ChatRequest) -> Result<ChatResult> {
        let (content, usage) = self.chat_with_usage_inner(req, false).await?;
        Ok(ChatResult { content, usage })
    }

    async fn chat_with_usage_inner(
        &self,
        req: ChatRequest,
        track_usage: bool,
    ) -> Result<(String, Option<mindmap_core::TokenUsage>)> {
        let physical_model = self.resolve(&req).await?;
        let limiter = self.rate_limiters.for_physical_model(&physical_model);
        let client = self.pool.get(&physical_model)?;
        let timeout = req.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let messages = Self::messages_for(&req).to_vec();
        let temperature = req.temperature;
        let max_tokens = req.max_tokens;
        let started = Instant::now();

        self.circuit_breaker.reserve_probe(&physical_model);
        let permit = limiter.acquire().await?;

        let outcome = tokio::time::timeout(
            timeout,
            with_retry(|| {
                let client = client.clone();
                let messages = messages.clone();
                async move { client.chat(&messages, temperature, max_tokens).await }
            }),
        )
        .await;

        permit.release().await;
        let duration = started.elapsed();

        let result = match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(CoreError::Timeout(timeout.as_secs())),
        };

        match result {
            Ok(result) => {
                if result.content.trim().is_empty() {
                    let err = CoreError::ResponseInvalid("empty content".into());
                    self.record_outcome(&physical_model, &req.logical_model, false, duration, &err);
                    return Err(err);
                }
                self.circuit_breaker.record(&physical_model, true, duration, false);
                self.load_balancer
                    .record_provider_metrics(&physical_model, true, duration, None);

                if track_usage {
                    self.enqueue_usage(&req, &physical_model, &result, duration, true);
                }

                Ok((result.content, result.usage))
            }
            Err(err) => {
                self.record_outcome(&physical_model, &req.logical_model, false, duration, &err);
                if track_usage {
                    self.enqueue_failure(&req, &physical_model, duration);
                }
                Err(err)
            }
        }
    }

    fn record_outcome(
        &self,
        physical_model: &str,
        _logical_model: &str,
        success: bool,
        duration: Duration,
        err: &CoreError,
    ) {
        let quota_exhausted = matches!(err, CoreError::QuotaExhausted(_));
        self.circuit_breaker.record(physical_model, success, duration, quota_exhausted);
        self.load_balancer
            .record_provider_metrics(physical_model, success, duration, Some(err.kind()));
    }

    fn enqueue_usage(
        &self,
        req: &ChatRequest,
        physical_model: &str,
        result: &ChatResult,
        duration: Duration,
        success: bool,
    ) {
        let Some(tracker) = &self.token_tracker else { return };
        let usage = result.usage.unwrap_or_default();
        let request_type = req.tracking.request_type.as_deref().unwrap_or("diagram_generation");
        tracker.track_usage(
            physical_model,
            usage.input_tokens,
            usage.output_tokens,
            request_type,
            &req.tracking,
            duration.as_millis() as u64,
            success,
        );
    }

    fn enqueue_failure(&self, req: &ChatRequest, physical_model: &str, duration: Duration) {
        let Some(tracker) = &self.token_tracker else { return };
        let request_type = req.tracking.request_type.as_deref().unwrap_or("diagram_generation");
        tracker.track_usage(physical_model, 0, 0, request_type, &req.tracking, duration.as_millis() as u64, false);
    }

    /// §4.6.3 `chatStream`. The rate-limiter slot is held for the entire
    /// stream and released exactly once, however the stream ends.
    pub async fn chat_stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let physical_model = self.resolve(&req).await?;
        let limiter = self.rate_limiters.for_physical_model(&physical_model);
        let client = self.pool.get(&physical_model)?;
        let messages = Self::messages_for(&req).to_vec();

        self.circuit_breaker.reserve_probe(&physical_model);
        let permit = limiter.acquire().await?;

        let upstream = client
            .stream_chat(&messages, req.temperature, req.max_tokens, req.enable_thinking)
            .await?;

        let circuit_breaker = self.circuit_breaker.clone();
        let load_balancer_metrics_model = physical_model.clone();
        let tracker = self.token_tracker.clone();
        let request_type = req.tracking.request_type.clone().unwrap_or_else(|| "diagram_generation".into());
        let tracking = req.tracking.clone();
        let yield_structured = req.yield_structured;
        let started = Instant::now();

        let stream = async_stream::stream! {
            tokio::pin!(upstream);
            let mut failed = false;
            let mut usage_seen = None;

            while let Some(item) = upstream.next().await {
                match &item {
                    Ok(StreamChunk::Usage(usage)) => {
                        usage_seen = Some(*usage);
                        // Plain mode yields content strings only; the usage
                        // chunk stays internal-only for tracking (§4.6.3).
                        if !yield_structured {
                            continue;
                        }
                    }
                    Ok(StreamChunk::Thinking(_)) if !yield_structured => continue,
                    Err(_) => failed = true,
                    _ => {}
                }
                yield item;
            }

            let duration = started.elapsed();
            circuit_breaker.record(&load_balancer_metrics_model, !failed, duration, false);

            if let Some(tracker) = tracker {
                if let Some(usage) = usage_seen {
                    tracker.track_usage(
                        &load_balancer_metrics_model,
                        usage.input_tokens,
                        usage.output_tokens,
                        &request_type,
                        &tracking,
                        duration.as_millis() as u64,
                        !failed,
                    );
                }
            }

            permit.release().await;
        };

        Ok(Box::pin(stream))
    }

    /// §4.6.4 `multi` — fan out to every requested logical model, wait for
    /// all of them, no early termination.
    pub async fn multi(&self, prompt: &str, models: &[LogicalModel]) -> MultiResult {
        let calls = models.iter().map(|model| {
            let prompt = prompt.to_string();
            let model = model.clone();
            async move {
                let started = Instant::now();
                let req = ChatRequest::new(prompt, model.clone());
                let outcome = self.chat(req).await;
                let duration = started.elapsed();
                let result = match outcome {
                    Ok(content) => ModelOutcome { content: Some(content), error: None, duration, success: true },
                    Err(err) => ModelOutcome { content: None, error: Some(err.to_string()), duration, success: false },
                };
                (model, result)
            }
        });

        futures::future::join_all(calls).await.into_iter().collect()
    }

    /// §4.6.5 `progressive` — like `multi`, but yields each result as soon
    /// as it is ready, in completion order.
    pub fn progressive<'a>(
        &'a self,
        prompt: &'a str,
        models: &'a [LogicalModel],
    ) -> BoxStream<'a, (LogicalModel, ModelOutcome)> {
        // `progressive` only needs completion-ordered final results, not
        // token-level interleaving, so a `FuturesUnordered` over full `chat`
        // calls is enough; `streamProgressive` below is the task-per-model
        // design needed for live token fan-out.
        let futures = models.iter().map(move |model| {
            let model = model.clone();
            async move {
                let started = Instant::now();
                let req = ChatRequest::new(prompt, model.clone());
                let outcome = self.chat(req).await;
                let duration = started.elapsed();
                match outcome {
                    Ok(content) => (model, ModelOutcome { content: Some(content), error: None, duration, success: true }),
                    Err(err) => (model, ModelOutcome { content: None, error: Some(err.to_string()), duration, success: false }),
                }
            }
        });

        futures::stream::FuturesUnordered::from_iter(futures).boxed()
    }

    /// §4.6.6 `streamProgressive` — the hardest path: N concurrent
    /// producers, each independently load-balanced, publishing to one
    /// shared queue; the consumer yields events FIFO until every model has
    /// emitted exactly one terminal event.
    pub async fn stream_progressive(
        self: &Arc<Self>,
        prompt: String,
        models: Vec<LogicalModel>,
    ) -> BoxStream<'static, mindmap_core::ProgressiveEvent> {
        use mindmap_core::ProgressiveEvent;

        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressiveEvent>();
        let mut handles = Vec::with_capacity(models.len());
        let mut in_flight = Vec::with_capacity(models.len());

        for logical_model in models.iter().cloned() {
            let core = self.clone();
            let prompt = prompt.clone();
            let tx = tx.clone();
            // Set once the producer resolves a physical model, cleared
            // before it sends its own terminal event. Whatever is left set
            // when this task is aborted mid-flight is what `CancelGuard`
            // below reports as a cancellation (spec.md:313).
            let slot: Arc<SyncMutex<Option<(PhysicalModel, Instant)>>> = Arc::new(SyncMutex::new(None));
            in_flight.push(slot.clone());

            let handle = tokio::spawn(async move {
                let physical_model = match core.load_balancer.resolve(&logical_model).await {
                    Ok(physical) => physical,
                    Err(err) => {
                        let _ = tx.send(ProgressiveEvent::error(logical_model, err.to_string(), Duration::ZERO));
                        return;
                    }
                };

                let started = Instant::now();
                *slot.lock() = Some((physical_model.clone(), started));

                let mut req = ChatRequest::new(prompt, physical_model.clone());
                req.skip_load_balancing = true;
                req.yield_structured = false;

                let stream = match core.chat_stream(req).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        *slot.lock() = None;
                        let _ = tx.send(ProgressiveEvent::error(logical_model, err.to_string(), started.elapsed()));
                        return;
                    }
                };

                tokio::pin!(stream);
                let mut token_count: u32 = 0;
                let mut failed = None;

                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(StreamChunk::Token(token)) => {
                            token_count += 1;
                            let _ = tx.send(ProgressiveEvent::token(logical_model.clone(), token));
                        }
                        Ok(StreamChunk::Thinking(_)) | Ok(StreamChunk::Usage(_)) => {}
                        Err(err) => {
                            failed = Some(err.to_string());
                            break;
                        }
                    }
                }

                *slot.lock() = None;
                let duration = started.elapsed();
                match failed {
                    Some(error) => {
                        let _ = tx.send(ProgressiveEvent::error(logical_model, error, duration));
                    }
                    None => {
                        let _ = tx.send(ProgressiveEvent::complete(logical_model, duration, token_count));
                    }
                }
            });
            handles.push(handle);
        }
        drop(tx);

        // Aborts every outstanding producer the moment this stream is
        // dropped before its terminal events arrive, and records each one
        // still in flight as a cancellation instead of leaving it running
        // to completion unobserved (spec.md:313, :202).
        struct CancelGuard {
            handles: Vec<tokio::task::JoinHandle<()>>,
            in_flight: Vec<Arc<SyncMutex<Option<(PhysicalModel, Instant)>>>>,
            circuit_breaker: Arc<CircuitBreaker>,
        }

        impl Drop for CancelGuard {
            fn drop(&mut self) {
                for handle in &self.handles {
                    handle.abort();
                }
                for slot in &self.in_flight {
                    if let Some((physical_model, started)) = slot.lock().take() {
                        tracing::warn!(
                            physical_model = %physical_model,
                            error = %CoreError::Cancelled,
                            "producer task cancelled: stream_progressive consumer dropped",
                        );
                        self.circuit_breaker.record_cancelled(&physical_model, started.elapsed());
                    }
                }
            }
        }

        let mut guard = CancelGuard { handles, in_flight, circuit_breaker: self.circuit_breaker.clone() };

        let expected = models.len();
        let stream = async_stream::stream! {
            let mut terminal_seen = 0usize;
            while terminal_seen < expected {
                match rx.recv().await {
                    Some(event) => {
                        if event.is_terminal() {
                            terminal_seen += 1;
                        }
                        yield event;
                    }
                    None => break,
                }
            }
            // Drain anything still buffered (step 4): producers that raced
            // past their terminal send before the channel closed.
            while let Ok(event) = rx.try_recv() {
                yield event;
            }
            for handle in guard.handles.drain(..) {
                let _ = handle.await;
            }
        };

        Box::pin(stream)
    }

    /// §4.6.7 `race` — first successful completion wins; the rest are
    /// cancelled.
    pub async fn race(self: &Arc<Self>, prompt: &str, models: &[LogicalModel]) -> Result<RaceResult> {
        let mut tasks = tokio::task::JoinSet::new();
        for model in models {
            let core = self.clone();
            let prompt = prompt.to_string();
            let model = model.clone();
            tasks.spawn(async move {
                let started = Instant::now();
                let req = ChatRequest::new(prompt, model.clone());
                let result = core.chat(req).await;
                (model, result, started.elapsed())
            });
        }

        let mut last_error = None;
        while let Some(joined) = tasks.join_next().await {
            let Ok((model, result, duration)) = joined else { continue };
            match result {
                Ok(content) => {
                    tasks.abort_all();
                    return Ok(RaceResult { llm: model, content, duration });
                }
                Err(err) => last_error = Some(err),
            }
        }

        Err(last_error.unwrap_or_else(|| CoreError::Other("all models failed to generate a response".into())))
    }

    /// §4.6.8 health check — a minimal probe per logical model, fanned out
    /// in parallel, with upstream error text scrubbed to a stable category.
    pub async fn health_check(&self, logical_models: &[LogicalModel]) -> HashMap<LogicalModel, ModelHealth> {
        let probes = logical_models.iter().map(|model| {
            let model = model.clone();
            async move {
                let started = Instant::now();
                let req = ChatRequest::new("ping", model.clone()).with_timeout(Duration::from_secs(10));
                let outcome = self.chat(req).await;
                let latency_ms = started.elapsed().as_millis() as u64;
                let health = match outcome {
                    Ok(_) => ModelHealth { healthy: true, category: None, latency_ms: Some(latency_ms) },
                    Err(err) => ModelHealth {
                        healthy: false,
                        category: Some(mindmap_core::classify_error(&err)),
                        latency_ms: None,
                    },
                };
                (model, health)
            }
        });

        futures::future::join_all(probes).await.into_iter().collect()
    }
}

/// Exponential backoff with full jitter, bounded attempts; retries
/// transport/timeout/rate-limit failures only (§4.6.1 step 4a).
async fn with_retry<F, Fut>(mut call: F) -> Result<ChatResult>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<ChatResult>>,
{
    let mut attempt = 0;
    let mut backoff = RETRY_BASE_BACKOFF;

    loop {
        match call().await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retriable() && attempt + 1 < MAX_RETRY_ATTEMPTS => {
                attempt += 1;
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let sleep_for = backoff.mul_f64(jitter).min(RETRY_MAX_BACKOFF);
                tracing::debug!(attempt, ?sleep_for, error = %err, "retrying provider call");
                tokio::time::sleep(sleep_for).await;
                backoff = (backoff * 2).min(RETRY_MAX_BACKOFF);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::test_support::StubProvider;

    fn core_with_clients(clients: Vec<Arc<dyn ProviderClient>>) -> Arc<LlmCore> {
        let clients = clients
            .into_iter()
            .map(|c| (c.physical_model().clone(), c))
            .collect::<HashMap<_, _>>();
        let pool = Arc::new(ClientPool::from_clients(clients));
        let circuit_breaker = CircuitBreaker::new();
        let load_balancer = Arc::new(LoadBalancer::new(circuit_breaker.clone(), Arc::new(RateLimiterRegistry::new(None))));
        let rate_limiters = Arc::new(RateLimiterRegistry::new(None));
        Arc::new(LlmCore::new(pool, load_balancer, circuit_breaker, rate_limiters, None))
    }

    #[tokio::test]
    async fn chat_returns_echoed_content() {
        let stub: Arc<dyn ProviderClient> = Arc::new(StubProvider::new("qwen"));
        let core = core_with_clients(vec![stub]);
        let req = ChatRequest::new("hello", "qwen").skip_load_balancing();
        let content = core.chat(req).await.unwrap();
        assert!(content.contains("hello"));
    }

    #[tokio::test]
    async fn unknown_model_surfaces_unknown_model_error() {
        let core = core_with_clients(vec![]);
        let req = ChatRequest::new("hello", "qwen").skip_load_balancing();
        let err = core.chat(req).await.unwrap_err();
        assert_eq!(err.kind(), "unknown_model");
    }

    #[tokio::test]
    async fn multi_returns_one_outcome_per_model() {
        let stub: Arc<dyn ProviderClient> = Arc::new(StubProvider::new("qwen"));
        let core = core_with_clients(vec![stub]);
        let results = core.multi("hi", &["qwen".to_string()]).await;
        assert_eq!(results.len(), 1);
        assert!(results["qwen"].success);
    }

    #[tokio::test]
    async fn race_returns_first_success() {
        let stub: Arc<dyn ProviderClient> = Arc::new(StubProvider::new("qwen"));
        let core = core_with_clients(vec![stub]);
        let result = core.race("hi", &["qwen".to_string()]).await.unwrap();
        assert_eq!(result.llm, "qwen");
    }

    #[tokio::test]
    async fn stream_progressive_emits_exactly_one_terminal_per_model() {
        let stub: Arc<dyn ProviderClient> = Arc::new(StubProvider::new("qwen"));
        let core = core_with_clients(vec![stub]);
        let mut stream = core.stream_progressive("hi".into(), vec!["qwen".to_string()]).await;
        let mut terminal_count = 0;
        while let Some(event) = stream.next().await {
            if event.is_terminal() {
                terminal_count += 1;
            }
        }
        assert_eq!(terminal_count, 1);
    }
}
