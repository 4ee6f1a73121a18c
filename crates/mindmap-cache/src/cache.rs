//! `DiagramCache`: the Redis-first, durable-store-backed diagram library
//! (spec.md §4.8).
//!
//! Every write lands in Redis first and is acknowledged immediately; a
//! background worker reconciles `pendingCreate`/`dirty` markers into the
//! durable store. Reads prefer Redis and fall back to the durable store,
//! back-filling Redis on the way out. If Redis is unavailable entirely,
//! every operation talks to the durable store directly and the background
//! worker never starts — there is nothing for it to reconcile.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};
use uuid::Uuid;

use mindmap_core::config::diagram_cache as config;

use crate::error::{CacheError, Result};
use crate::keys;
use crate::model::{sort_summaries, CacheStats, Diagram, DiagramPage, DiagramPatch, DiagramSummary, NewDiagram};
use crate::store::DurableStore;
use crate::sync::{self, SyncContext, SyncCounters};

pub struct DiagramCache {
    redis: Option<redis::aio::ConnectionManager>,
    store: Arc<DurableStore>,
    worker_started: AtomicBool,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: Arc<Notify>,
    counters: Arc<SyncCounters>,
}

impl DiagramCache {
    pub fn new(redis: Option<redis::aio::ConnectionManager>, store: Arc<DurableStore>) -> Arc<Self> {
        let storage = if redis.is_some() { "redis" } else { "durable_only" };
        info!(storage, "diagram cache initialized");
        Arc::new(Self {
            redis,
            store,
            worker_started: AtomicBool::new(false),
            worker: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
            counters: Arc::new(SyncCounters::default()),
        })
    }

    async fn ensure_worker_started(&self) {
        let Some(redis) = self.redis.clone() else {
            return;
        };
        if self.worker_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let ctx = SyncContext {
            redis,
            store: self.store.clone(),
            counters: self.counters.clone(),
            shutdown: self.shutdown.clone(),
        };
        let handle = tokio::spawn(sync::run(ctx));
        *self.worker.lock().await = Some(handle);
    }

    /// Signals the sync worker to run a final cycle and waits for it to
    /// finish. A no-op if the worker never started (no Redis, or no writes
    /// ever happened).
    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        info!(
            total_synced = self.counters.total_synced.load(Ordering::Relaxed),
            total_errors = self.counters.total_errors.load(Ordering::Relaxed),
            "diagram cache shutdown complete"
        );
    }

    async fn count_for_user(&self, user_id: &str) -> Result<i64> {
        if let Some(redis) = &self.redis {
            use redis::AsyncCommands;
            let mut conn = redis.clone();
            match conn.zcard::<_, i64>(keys::user_meta(user_id)).await {
                Ok(count) => return Ok(count),
                Err(e) => warn!(error = %e, "redis count failed, falling back to durable store"),
            }
        }
        self.store.count_for_user(user_id).await
    }

    /// Loads a diagram. Redis-first with TTL refresh on hit; falls back to
    /// the durable store and back-fills Redis on the way out. A soft-deleted
    /// diagram is still returned, with `isDeleted=true` (spec.md §8 point 8)
    /// — only `list` hides it.
    pub async fn get(&self, user_id: &str, id: Uuid) -> Result<Option<Diagram>> {
        self.ensure_worker_started().await;

        if let Some(redis) = &self.redis {
            use redis::AsyncCommands;
            let mut conn = redis.clone();
            let key = keys::diagram(user_id, &id);
            match conn.get::<_, Option<String>>(&key).await {
                Ok(Some(data)) => {
                    let diagram: Diagram = serde_json::from_str(&data)?;
                    let ttl = config::cache_ttl_secs() as i64;
                    let _: redis::RedisResult<()> = conn.expire(&key, ttl).await;
                    return Ok(Some(diagram));
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "redis get failed, falling back to durable store"),
            }
        }

        let Some(diagram) = self.store.get(id).await? else {
            return Ok(None);
        };
        if diagram.user_id != user_id {
            return Ok(None);
        }

        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            if let Ok(diagram_json) = serde_json::to_string(&diagram) {
                let ttl = config::cache_ttl_secs();
                let result: redis::RedisResult<()> = redis::pipe()
                    .atomic()
                    .set_ex(keys::diagram(user_id, &id), diagram_json, ttl)
                    .ignore()
                    .zadd(keys::user_meta(user_id), id.to_string(), diagram.updated_at.timestamp())
                    .ignore()
                    .query_async(&mut conn)
                    .await;
                if let Err(e) = result {
                    warn!(error = %e, "failed to backfill redis after durable store read");
                }
            }
        }

        Ok(Some(diagram))
    }

    pub async fn save_create(&self, user_id: &str, new: NewDiagram) -> Result<Diagram> {
        self.ensure_worker_started().await;
        validate_spec_size(&new.spec)?;

        let max_per_user = config::max_per_user();
        if self.count_for_user(user_id).await? as usize >= max_per_user {
            return Err(CacheError::QuotaExceeded(max_per_user));
        }

        let now = Utc::now();
        let diagram = Diagram {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            title: new.title,
            diagram_type: new.diagram_type,
            spec: new.spec,
            language: new.language,
            thumbnail: new.thumbnail,
            created_at: now,
            updated_at: now,
            is_deleted: false,
            is_pinned: false,
        };

        if !self.try_redis_write(user_id, &diagram, keys::PENDING_CREATE_SET).await {
            self.store.insert_if_absent(&diagram).await?;
        }
        Ok(diagram)
    }

    pub async fn save_update(&self, user_id: &str, id: Uuid, patch: DiagramPatch) -> Result<Diagram> {
        self.ensure_worker_started().await;
        let mut diagram = self.get(user_id, id).await?.ok_or(CacheError::NotFound)?;
        if diagram.is_deleted {
            return Err(CacheError::NotFound);
        }

        if let Some(title) = patch.title {
            diagram.title = title;
        }
        if let Some(spec) = patch.spec {
            validate_spec_size(&spec)?;
            diagram.spec = spec;
        }
        if let Some(language) = patch.language {
            diagram.language = language;
        }
        if patch.thumbnail.is_some() {
            diagram.thumbnail = patch.thumbnail;
        }
        diagram.updated_at = Utc::now();

        if !self.try_redis_write(user_id, &diagram, keys::DIRTY_SET).await {
            self.store.upsert(&diagram).await?;
        }
        Ok(diagram)
    }

    pub async fn delete(&self, user_id: &str, id: Uuid) -> Result<()> {
        self.ensure_worker_started().await;
        let mut diagram = self.get(user_id, id).await?.ok_or(CacheError::NotFound)?;
        diagram.is_deleted = true;
        diagram.updated_at = Utc::now();

        if !self.try_redis_delete(user_id, &diagram).await {
            self.store.upsert(&diagram).await?;
        }
        Ok(())
    }

    pub async fn pin(&self, user_id: &str, id: Uuid, pinned: bool) -> Result<()> {
        self.ensure_worker_started().await;
        let mut diagram = self.get(user_id, id).await?.ok_or(CacheError::NotFound)?;
        if diagram.is_deleted {
            return Err(CacheError::NotFound);
        }
        diagram.is_pinned = pinned;
        diagram.updated_at = Utc::now();

        if !self.try_redis_write(user_id, &diagram, keys::DIRTY_SET).await {
            self.store.upsert(&diagram).await?;
        }
        Ok(())
    }

    /// Clones a diagram's spec/title under the same owner (SPEC_FULL §C.4).
    /// Reuses `save_create`, which re-checks the quota before inserting.
    pub async fn duplicate(&self, user_id: &str, source_id: Uuid) -> Result<Diagram> {
        self.ensure_worker_started().await;
        let source = self.get(user_id, source_id).await?.ok_or(CacheError::NotFound)?;
        if source.is_deleted {
            return Err(CacheError::NotFound);
        }

        let mut title = format!("{} (Copy)", source.title);
        if title.chars().count() > 200 {
            title = format!("{}...", title.chars().take(197).collect::<String>());
        }

        self.save_create(
            user_id,
            NewDiagram {
                title,
                diagram_type: source.diagram_type,
                spec: source.spec,
                language: source.language,
                thumbnail: source.thumbnail,
            },
        )
        .await
    }

    pub async fn list(&self, user_id: &str, page: usize, page_size: usize) -> Result<DiagramPage> {
        self.ensure_worker_started().await;
        let page = page.max(1);
        let page_size = page_size.max(1);
        let max_diagrams = config::max_per_user();

        if let Some(redis) = &self.redis {
            use redis::AsyncCommands;
            let mut conn = redis.clone();
            match conn.get::<_, Option<String>>(keys::user_list(user_id)).await {
                Ok(Some(cached)) => {
                    if let Ok(items) = serde_json::from_str::<Vec<DiagramSummary>>(&cached) {
                        let total = items.len();
                        return Ok(paginate(items, total, page, page_size, max_diagrams));
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "redis list cache read failed"),
            }
        }

        let mut items: Vec<DiagramSummary> =
            self.store.list_for_user(user_id).await?.iter().map(DiagramSummary::from).collect();

        for p in self.pending_creates_for_user(user_id).await.unwrap_or_default() {
            if !items.iter().any(|i| i.id == p.id) {
                items.push(p);
            }
        }
        sort_summaries(&mut items);
        let total = items.len();

        if let Some(redis) = &self.redis {
            use redis::AsyncCommands;
            let mut conn = redis.clone();
            if let Ok(json) = serde_json::to_string(&items) {
                let ttl = config::cache_ttl_secs();
                let _: redis::RedisResult<()> = conn.set_ex(keys::user_list(user_id), json, ttl).await;
            }
        }

        Ok(paginate(items, total, page, page_size, max_diagrams))
    }

    /// Fire-and-forget warm-up after login; a no-op if the list is already
    /// cached (spec.md §4.8).
    pub async fn preload_user_diagrams(&self, user_id: &str) {
        let Some(redis) = &self.redis else { return };
        use redis::AsyncCommands;
        let mut conn = redis.clone();

        match conn.exists::<_, bool>(keys::user_list(user_id)).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "preload existence check failed");
                return;
            }
        }

        let rows = match self.store.list_for_user(user_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "preload durable store read failed");
                return;
            }
        };
        let items: Vec<DiagramSummary> = rows.iter().map(DiagramSummary::from).collect();
        if let Ok(json) = serde_json::to_string(&items) {
            let ttl = config::cache_ttl_secs();
            let _: redis::RedisResult<()> = conn.set_ex(keys::user_list(user_id), json, ttl).await;
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let storage = if self.redis.is_some() { "redis" } else { "durable_only" };
        let (mut dirty_count, mut pending_create_count) = (0u64, 0u64);
        if let Some(redis) = &self.redis {
            use redis::AsyncCommands;
            let mut conn = redis.clone();
            dirty_count = conn.scard(keys::DIRTY_SET).await.unwrap_or(0);
            pending_create_count = conn.scard(keys::PENDING_CREATE_SET).await.unwrap_or(0);
        }
        CacheStats {
            storage,
            total_synced: self.counters.total_synced.load(Ordering::Relaxed),
            total_errors: self.counters.total_errors.load(Ordering::Relaxed),
            dirty_count,
            pending_create_count,
            cache_ttl_secs: config::cache_ttl_secs(),
            sync_interval_secs: config::sync_interval_secs(),
            sync_batch_size: config::sync_batch_size(),
            max_per_user: config::max_per_user(),
            max_spec_size_kb: config::max_spec_size_kb(),
        }
    }

    async fn pending_creates_for_user(&self, user_id: &str) -> Option<Vec<DiagramSummary>> {
        use redis::AsyncCommands;
        let redis = self.redis.as_ref()?;
        let mut conn = redis.clone();
        let entries: Vec<String> = conn.smembers(keys::PENDING_CREATE_SET).await.unwrap_or_default();

        let mut items = Vec::new();
        for entry in entries {
            let Some((entry_user, id)) = keys::parse_sync_entry(&entry) else {
                continue;
            };
            if entry_user != user_id {
                continue;
            }
            let data: Option<String> = conn.get(keys::diagram(user_id, &id)).await.unwrap_or(None);
            let Some(data) = data else { continue };
            let Ok(diagram) = serde_json::from_str::<Diagram>(&data) else {
                continue;
            };
            if diagram.is_deleted {
                continue;
            }
            items.push(DiagramSummary::from(&diagram));
        }
        Some(items)
    }

    /// Writes the full diagram to Redis and marks it for background sync.
    /// Returns `false` (caller falls back to the durable store directly) on
    /// any Redis failure, including "no Redis configured".
    async fn try_redis_write(&self, user_id: &str, diagram: &Diagram, sync_set: &str) -> bool {
        let Some(redis) = &self.redis else { return false };
        let mut conn = redis.clone();
        let diagram_json = match serde_json::to_string(diagram) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize diagram");
                return false;
            }
        };
        let ttl = config::cache_ttl_secs();
        let result: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .set_ex(keys::diagram(user_id, &diagram.id), diagram_json, ttl)
            .ignore()
            .zadd(keys::user_meta(user_id), diagram.id.to_string(), diagram.updated_at.timestamp())
            .ignore()
            .del(keys::user_list(user_id))
            .ignore()
            .sadd(sync_set, keys::sync_entry(user_id, &diagram.id))
            .ignore()
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "redis save failed, falling back to durable store");
                false
            }
        }
    }

    async fn try_redis_delete(&self, user_id: &str, diagram: &Diagram) -> bool {
        let Some(redis) = &self.redis else { return false };
        let mut conn = redis.clone();
        let diagram_json = match serde_json::to_string(diagram) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize diagram");
                return false;
            }
        };
        let ttl = config::cache_ttl_secs();
        let result: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .set_ex(keys::diagram(user_id, &diagram.id), diagram_json, ttl)
            .ignore()
            .zrem(keys::user_meta(user_id), diagram.id.to_string())
            .ignore()
            .del(keys::user_list(user_id))
            .ignore()
            .sadd(keys::DIRTY_SET, keys::sync_entry(user_id, &diagram.id))
            .ignore()
            .srem(keys::PENDING_CREATE_SET, keys::sync_entry(user_id, &diagram.id))
            .ignore()
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "redis delete failed, falling back to durable store");
                false
            }
        }
    }
}

fn validate_spec_size(spec: &serde_json::Value) -> Result<()> {
    let spec_json = serde_json::to_string(spec)?;
    let actual_kb = spec_json.len() as f64 / 1024.0;
    let limit_kb = config::max_spec_size_kb();
    if actual_kb > limit_kb as f64 {
        return Err(CacheError::SpecTooLarge { actual_kb, limit_kb });
    }
    Ok(())
}

fn paginate(
    items: Vec<DiagramSummary>,
    total: usize,
    page: usize,
    page_size: usize,
    max_diagrams: usize,
) -> DiagramPage {
    let offset = (page - 1) * page_size;
    let diagrams: Vec<DiagramSummary> = items.into_iter().skip(offset).take(page_size).collect();
    let has_more = offset + diagrams.len() < total;
    DiagramPage { diagrams, total, page, page_size, has_more, max_diagrams }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_within_limit_is_accepted() {
        let spec = serde_json::json!({"nodes": ["a", "b", "c"]});
        assert!(validate_spec_size(&spec).is_ok());
    }

    #[test]
    fn oversized_spec_is_rejected() {
        let huge = "x".repeat(config::max_spec_size_kb() * 1024 + 1);
        let spec = serde_json::json!({ "blob": huge });
        assert!(matches!(validate_spec_size(&spec), Err(CacheError::SpecTooLarge { .. })));
    }

    fn summary(id: Uuid) -> DiagramSummary {
        DiagramSummary {
            id,
            title: "t".into(),
            diagram_type: "bubble_map".into(),
            thumbnail: None,
            updated_at: Utc::now(),
            is_pinned: false,
        }
    }

    #[test]
    fn paginate_reports_has_more_until_last_page() {
        let items: Vec<_> = (0..5).map(|_| summary(Uuid::new_v4())).collect();
        let page = paginate(items, 5, 1, 2, 20);
        assert_eq!(page.diagrams.len(), 2);
        assert!(page.has_more);
    }

    #[test]
    fn paginate_past_last_page_is_empty_but_reports_total() {
        let items: Vec<_> = (0..5).map(|_| summary(Uuid::new_v4())).collect();
        let page = paginate(items, 5, 10, 2, 20);
        assert_eq!(page.diagrams.len(), 0);
        assert_eq!(page.total, 5);
        assert!(!page.has_more);
    }
}
