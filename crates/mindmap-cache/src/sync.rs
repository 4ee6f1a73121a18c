//! Background reconciliation worker: drains `pendingCreate`/`dirty` Redis
//! sets into the durable store (spec.md §4.8, §9).
//!
//! Lazily started by the cache on first write, not at construction — there
//! is no point running this loop for a process that never touches Redis.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{error, info, warn};

use mindmap_core::config::diagram_cache as config;

use crate::keys;
use crate::model::Diagram;
use crate::store::DurableStore;

#[derive(Default)]
pub(crate) struct SyncCounters {
    pub total_synced: AtomicU64,
    pub total_errors: AtomicU64,
}

pub(crate) struct SyncContext {
    pub redis: redis::aio::ConnectionManager,
    pub store: Arc<DurableStore>,
    pub counters: Arc<SyncCounters>,
    pub shutdown: Arc<Notify>,
}

pub(crate) async fn run(ctx: SyncContext) {
    info!("diagram cache sync worker started");
    let mut last_sync = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.notified() => {
                sync_once(&ctx).await;
                break;
            }
            _ = sleep(Duration::from_secs(30)) => {
                if last_sync.elapsed() >= Duration::from_secs(config::sync_interval_secs()) {
                    sync_once(&ctx).await;
                    last_sync = Instant::now();
                }
            }
        }
    }

    info!("diagram cache sync worker stopped");
}

async fn sync_once(ctx: &SyncContext) {
    let created = sync_pending_creates(ctx).await;
    let updated = sync_dirty(ctx).await;
    if created > 0 || updated > 0 {
        info!(created, updated, "synced diagram cache to durable store");
    }
}

async fn sync_pending_creates(ctx: &SyncContext) -> u64 {
    use redis::AsyncCommands;
    let mut conn = ctx.redis.clone();

    let entries: Vec<String> = match conn.smembers(keys::PENDING_CREATE_SET).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "failed to read pending_create set");
            return 0;
        }
    };

    let mut created = 0u64;
    for entry in entries.into_iter().take(config::sync_batch_size()) {
        let Some((user_id, diagram_id)) = keys::parse_sync_entry(&entry) else {
            let _: redis::RedisResult<()> = conn.srem(keys::PENDING_CREATE_SET, &entry).await;
            continue;
        };

        let data: Option<String> = match conn.get(keys::diagram(&user_id, &diagram_id)).await {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, entry = %entry, "failed to read diagram for pending create sync");
                ctx.counters.total_errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        let Some(data) = data else {
            // Diagram expired out of Redis before it was ever synced; nothing
            // durable to create, so just drop the pending marker.
            let _: redis::RedisResult<()> = conn.srem(keys::PENDING_CREATE_SET, &entry).await;
            continue;
        };

        let diagram: Diagram = match serde_json::from_str(&data) {
            Ok(diagram) => diagram,
            Err(e) => {
                warn!(error = %e, entry = %entry, "malformed diagram json in pending create sync");
                ctx.counters.total_errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        match ctx.store.insert_if_absent(&diagram).await {
            Ok(_) => {
                created += 1;
                let _: redis::RedisResult<()> = conn.srem(keys::PENDING_CREATE_SET, &entry).await;
            }
            Err(e) => {
                error!(error = %e, entry = %entry, "pending create sync failed");
                ctx.counters.total_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    ctx.counters.total_synced.fetch_add(created, Ordering::Relaxed);
    created
}

async fn sync_dirty(ctx: &SyncContext) -> u64 {
    use redis::AsyncCommands;
    let mut conn = ctx.redis.clone();

    let entries: Vec<String> = match conn.smembers(keys::DIRTY_SET).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "failed to read dirty set");
            return 0;
        }
    };

    let mut synced = 0u64;
    for entry in entries.into_iter().take(config::sync_batch_size()) {
        let Some((user_id, diagram_id)) = keys::parse_sync_entry(&entry) else {
            let _: redis::RedisResult<()> = conn.srem(keys::DIRTY_SET, &entry).await;
            continue;
        };

        let data: Option<String> = match conn.get(keys::diagram(&user_id, &diagram_id)).await {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, entry = %entry, "failed to read diagram for dirty sync");
                ctx.counters.total_errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        let Some(data) = data else {
            let _: redis::RedisResult<()> = conn.srem(keys::DIRTY_SET, &entry).await;
            continue;
        };

        let diagram: Diagram = match serde_json::from_str(&data) {
            Ok(diagram) => diagram,
            Err(e) => {
                warn!(error = %e, entry = %entry, "malformed diagram json in dirty sync");
                ctx.counters.total_errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        // Dirty entries overwrite every column, including is_deleted and
        // is_pinned, and also cover the case of a diagram created then
        // edited before its pendingCreate entry was drained.
        match ctx.store.upsert(&diagram).await {
            Ok(()) => {
                synced += 1;
                let _: redis::RedisResult<()> = conn.srem(keys::DIRTY_SET, &entry).await;
            }
            Err(e) => {
                error!(error = %e, entry = %entry, "dirty sync failed");
                ctx.counters.total_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    ctx.counters.total_synced.fetch_add(synced, Ordering::Relaxed);
    synced
}
