//! Non-blocking usage tracking with batched flush (spec §4.7).
//!
//! Grounded on `original_source/services/token_tracker.py`'s bounded queue
//! + background batch worker; the per-request synchronous write it replaced
//! was the dominant cause of write-lock contention under load.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};
use uuid::Uuid;

use mindmap_core::config::token_tracker as config;
use mindmap_core::UsageRecord;

use crate::pricing;

/// Sink a flushed batch reaches. `mindmap-cache` implements this against its
/// sqlx pool; tests use an in-memory collector.
#[async_trait::async_trait]
pub trait UsageSink: Send + Sync {
    async fn write_batch(&self, records: &[UsageRecord]) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct TrackerStats {
    pub queued: AtomicU64,
    pub dropped: AtomicU64,
    pub flushed: AtomicU64,
    pub flush_errors: AtomicU64,
}

pub struct TokenTracker {
    sender: mpsc::Sender<UsageRecord>,
    stats: Arc<TrackerStats>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl TokenTracker {
    /// Spawn the background batch worker and return a handle. `sink` is
    /// typically `mindmap-cache`'s durable-store writer.
    pub fn spawn(sink: Arc<dyn UsageSink>) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(config::max_buffer_size());
        let stats = Arc::new(TrackerStats::default());
        let shutdown = Arc::new(tokio::sync::Notify::new());

        let worker_stats = stats.clone();
        let worker_shutdown = shutdown.clone();
        let handle = tokio::spawn(batch_worker(receiver, sink, worker_stats, worker_shutdown));

        Arc::new(Self {
            sender,
            stats,
            worker: Mutex::new(Some(handle)),
            shutdown,
        })
    }

    /// Generates a session id for grouping a batch of related LLM calls,
    /// matching the source system's `session_<16 hex chars>` shape.
    pub fn generate_session_id() -> String {
        format!("session_{}", Uuid::new_v4().simple().to_string().chars().take(16).collect::<String>())
    }

    /// Queue a usage record for batched write. Non-blocking: on overflow the
    /// record is dropped with a warning rather than applying backpressure to
    /// the caller (spec §4.7, §5 "TokenTracker: backpressure is refusal").
    pub fn track(&self, record: UsageRecord) -> bool {
        if !config::enabled() {
            return false;
        }
        match self.sender.try_send(record) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    model_alias = %record.model_alias,
                    tokens = record.total_tokens,
                    "token tracker queue full, dropping usage record"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("token tracker worker is gone, dropping usage record");
                false
            }
        }
    }

    /// Build and queue a `UsageRecord` from raw call outcome fields,
    /// computing cost locally from the static pricing table.
    #[allow(clippy::too_many_arguments)]
    pub fn track_usage(
        &self,
        model_alias: &str,
        input_tokens: u32,
        output_tokens: u32,
        request_type: &str,
        tracking: &mindmap_core::Tracking,
        response_time_ms: u64,
        success: bool,
    ) -> bool {
        let pricing = pricing::price_for(model_alias);
        let (input_cost, output_cost, total_cost) = pricing::cost_for(model_alias, input_tokens, output_tokens);

        let record = UsageRecord {
            user_id: tracking.user_id.clone(),
            org_id: tracking.org_id.clone(),
            session_id: tracking.session_id.clone().unwrap_or_else(Self::generate_session_id),
            conversation_id: tracking.conversation_id.clone(),
            model_provider: pricing.provider.to_string(),
            model_name: pricing::model_name_for(model_alias),
            model_alias: model_alias.to_string(),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            input_cost,
            output_cost,
            total_cost,
            request_type: request_type.to_string(),
            diagram_type: tracking.diagram_type.clone(),
            endpoint_path: tracking.endpoint_path.clone(),
            success,
            response_time_ms,
            created_at: chrono::Utc::now(),
        };

        self.track(record)
    }

    pub fn stats_snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.stats.queued.load(Ordering::Relaxed),
            self.stats.dropped.load(Ordering::Relaxed),
            self.stats.flushed.load(Ordering::Relaxed),
            self.stats.flush_errors.load(Ordering::Relaxed),
        )
    }

    /// Signal the worker to drain remaining records and stop, then wait for
    /// it to finish (spec §4.7 "on shutdown, the tracker drains the queue").
    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn batch_worker(
    mut receiver: mpsc::Receiver<UsageRecord>,
    sink: Arc<dyn UsageSink>,
    stats: Arc<TrackerStats>,
    shutdown: Arc<tokio::sync::Notify>,
) {
    let mut buffer: Vec<UsageRecord> = Vec::with_capacity(config::batch_size());
    let mut ticker = interval(Duration::from_secs(config::batch_interval_secs()));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => {
                receiver.close();
                while let Ok(record) = receiver.try_recv() {
                    buffer.push(record);
                }
                flush(&sink, &mut buffer, &stats).await;
                debug!("token tracker worker shut down");
                return;
            }

            record = receiver.recv() => {
                match record {
                    Some(record) => {
                        buffer.push(record);
                        if buffer.len() >= config::batch_size() {
                            flush(&sink, &mut buffer, &stats).await;
                        }
                    }
                    None => {
                        flush(&sink, &mut buffer, &stats).await;
                        return;
                    }
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&sink, &mut buffer, &stats).await;
                }
            }
        }
    }
}

async fn flush(sink: &Arc<dyn UsageSink>, buffer: &mut Vec<UsageRecord>, stats: &Arc<TrackerStats>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    let count = batch.len() as u64;
    let total_tokens: u32 = batch.iter().map(|r| r.total_tokens).sum();

    match sink.write_batch(&batch).await {
        Ok(()) => {
            stats.flushed.fetch_add(count, Ordering::Relaxed);
            debug!(count, total_tokens, "flushed usage batch");
        }
        Err(err) => {
            stats.flush_errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %err, count, "usage batch write failed, records lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::time::{pause, sleep};

    struct CollectingSink {
        batches: StdMutex<Vec<Vec<UsageRecord>>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self { batches: StdMutex::new(Vec::new()) })
        }
    }

    #[async_trait::async_trait]
    impl UsageSink for CollectingSink {
        async fn write_batch(&self, records: &[UsageRecord]) -> anyhow::Result<()> {
            self.batches.lock().unwrap().push(records.to_vec());
            Ok(())
        }
    }

    fn sample_record(alias: &str) -> UsageRecord {
        let (input_cost, output_cost, total_cost) = pricing::cost_for(alias, 100, 50);
        UsageRecord {
            user_id: None,
            org_id: None,
            session_id: TokenTracker::generate_session_id(),
            conversation_id: None,
            model_provider: "dashscope".into(),
            model_name: pricing::model_name_for(alias),
            model_alias: alias.into(),
            input_tokens: 100,
            output_tokens: 50,
            total_tokens: 150,
            input_cost,
            output_cost,
            total_cost,
            request_type: "diagram_generation".into(),
            diagram_type: None,
            endpoint_path: None,
            success: true,
            response_time_ms: 120,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn flushes_on_shutdown_drain() {
        let sink = CollectingSink::new();
        let tracker = TokenTracker::spawn(sink.clone());
        assert!(tracker.track(sample_record("qwen")));
        assert!(tracker.track(sample_record("kimi")));
        tracker.shutdown().await;

        let batches = sink.batches.lock().unwrap();
        let total: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn session_id_matches_expected_shape() {
        let id = TokenTracker::generate_session_id();
        assert!(id.starts_with("session_"));
        assert_eq!(id.len(), "session_".len() + 16);
    }

    #[tokio::test(start_paused = true)]
    async fn time_based_flush_fires_without_reaching_batch_size() {
        let sink = CollectingSink::new();
        let tracker = TokenTracker::spawn(sink.clone());
        assert!(tracker.track(sample_record("doubao")));

        pause();
        sleep(Duration::from_secs(config::batch_interval_secs() + 1)).await;
        tokio::task::yield_now().await;

        let flushed_before_shutdown = sink.batches.lock().unwrap().iter().map(|b| b.len()).sum::<usize>();
        tracker.shutdown().await;
        let flushed_total = sink.batches.lock().unwrap().iter().map(|b| b.len()).sum::<usize>();
        assert!(flushed_before_shutdown + flushed_total >= 1);
    }
}
