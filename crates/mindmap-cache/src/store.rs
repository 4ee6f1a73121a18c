//! The relational store of record behind the Redis cache (spec.md §6).
//!
//! Redis is authoritative for reads; this is where the background sync
//! worker and `UsageSink::write_batch` land their writes. Schema is created
//! idempotently at connect time rather than through a migration framework —
//! migrations are out of scope (spec.md §4.8 Non-goals).

use chrono::{DateTime, Utc};
use mindmap_core::UsageRecord;
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use mindmap_core::config::database as db_config;

use crate::error::Result;
use crate::model::Diagram;

pub struct DurableStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct DiagramRow {
    id: Uuid,
    user_id: String,
    title: String,
    diagram_type: String,
    spec: String,
    language: String,
    thumbnail: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    is_deleted: bool,
    is_pinned: bool,
}

impl DiagramRow {
    fn into_diagram(self) -> Result<Diagram> {
        Ok(Diagram {
            id: self.id,
            user_id: self.user_id,
            title: self.title,
            diagram_type: self.diagram_type,
            spec: serde_json::from_str(&self.spec)?,
            language: self.language,
            thumbnail: self.thumbnail,
            created_at: self.created_at,
            updated_at: self.updated_at,
            is_deleted: self.is_deleted,
            is_pinned: self.is_pinned,
        })
    }
}

impl DurableStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(db_config::pool_size() + db_config::max_overflow())
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS diagrams (
                id UUID PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                diagram_type TEXT NOT NULL,
                spec TEXT NOT NULL,
                language TEXT NOT NULL,
                thumbnail TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
                is_pinned BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS diagrams_user_idx ON diagrams (user_id, is_deleted)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS token_usage (
                id BIGSERIAL PRIMARY KEY,
                user_id TEXT,
                org_id TEXT,
                session_id TEXT NOT NULL,
                conversation_id TEXT,
                model_provider TEXT NOT NULL,
                model_name TEXT NOT NULL,
                model_alias TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                input_cost DOUBLE PRECISION NOT NULL,
                output_cost DOUBLE PRECISION NOT NULL,
                total_cost DOUBLE PRECISION NOT NULL,
                request_type TEXT NOT NULL,
                diagram_type TEXT,
                endpoint_path TEXT,
                success BOOLEAN NOT NULL,
                response_time_ms BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_for_user(&self, user_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM diagrams WHERE user_id = $1 AND is_deleted = FALSE",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn exists(&self, id: Uuid) -> Result<bool> {
        let found: Option<i32> = sqlx::query_scalar::<_, i32>("SELECT 1 FROM diagrams WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Diagram>> {
        let row: Option<DiagramRow> = sqlx::query_as(
            r#"SELECT id, user_id, title, diagram_type, spec, language, thumbnail,
               created_at, updated_at, is_deleted, is_pinned
               FROM diagrams WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DiagramRow::into_diagram).transpose()
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Diagram>> {
        let rows: Vec<DiagramRow> = sqlx::query_as(
            r#"SELECT id, user_id, title, diagram_type, spec, language, thumbnail,
               created_at, updated_at, is_deleted, is_pinned
               FROM diagrams WHERE user_id = $1 AND is_deleted = FALSE
               ORDER BY is_pinned DESC, updated_at DESC"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DiagramRow::into_diagram).collect()
    }

    /// Inserts a new row. Returns `false` without error if the id already
    /// exists, so the sync worker can treat a retried `pendingCreate` entry
    /// as already handled.
    pub async fn insert_if_absent(&self, d: &Diagram) -> Result<bool> {
        if self.exists(d.id).await? {
            return Ok(false);
        }
        let spec = serde_json::to_string(&d.spec)?;
        let result = sqlx::query(
            r#"INSERT INTO diagrams
               (id, user_id, title, diagram_type, spec, language, thumbnail,
                created_at, updated_at, is_deleted, is_pinned)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               ON CONFLICT (id) DO NOTHING"#,
        )
        .bind(d.id)
        .bind(&d.user_id)
        .bind(&d.title)
        .bind(&d.diagram_type)
        .bind(&spec)
        .bind(&d.language)
        .bind(&d.thumbnail)
        .bind(d.created_at)
        .bind(d.updated_at)
        .bind(d.is_deleted)
        .bind(d.is_pinned)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Inserts or fully overwrites a row, for the `dirty`-set sync path
    /// where Redis is already authoritative for the content.
    pub async fn upsert(&self, d: &Diagram) -> Result<()> {
        let spec = serde_json::to_string(&d.spec)?;
        sqlx::query(
            r#"INSERT INTO diagrams
               (id, user_id, title, diagram_type, spec, language, thumbnail,
                created_at, updated_at, is_deleted, is_pinned)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               ON CONFLICT (id) DO UPDATE SET
                 title = EXCLUDED.title,
                 diagram_type = EXCLUDED.diagram_type,
                 spec = EXCLUDED.spec,
                 language = EXCLUDED.language,
                 thumbnail = EXCLUDED.thumbnail,
                 updated_at = EXCLUDED.updated_at,
                 is_deleted = EXCLUDED.is_deleted,
                 is_pinned = EXCLUDED.is_pinned"#,
        )
        .bind(d.id)
        .bind(&d.user_id)
        .bind(&d.title)
        .bind(&d.diagram_type)
        .bind(&spec)
        .bind(&d.language)
        .bind(&d.thumbnail)
        .bind(d.created_at)
        .bind(d.updated_at)
        .bind(d.is_deleted)
        .bind(d.is_pinned)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// One bulk `INSERT ... VALUES (...),(...),...` per flush, never one
    /// statement per record (spec.md §4.8 flush path: a 500-record flush is
    /// one round trip, not 500).
    pub async fn insert_usage_batch(&self, records: &[UsageRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO token_usage
               (user_id, org_id, session_id, conversation_id, model_provider,
                model_name, model_alias, input_tokens, output_tokens, total_tokens,
                input_cost, output_cost, total_cost, request_type, diagram_type,
                endpoint_path, success, response_time_ms, created_at) ",
        );

        builder.push_values(records, |mut row, r| {
            row.push_bind(&r.user_id)
                .push_bind(&r.org_id)
                .push_bind(&r.session_id)
                .push_bind(&r.conversation_id)
                .push_bind(&r.model_provider)
                .push_bind(&r.model_name)
                .push_bind(&r.model_alias)
                .push_bind(r.input_tokens as i32)
                .push_bind(r.output_tokens as i32)
                .push_bind(r.total_tokens as i32)
                .push_bind(r.input_cost)
                .push_bind(r.output_cost)
                .push_bind(r.total_cost)
                .push_bind(&r.request_type)
                .push_bind(&r.diagram_type)
                .push_bind(&r.endpoint_path)
                .push_bind(r.success)
                .push_bind(r.response_time_ms as i64)
                .push_bind(r.created_at);
        });

        builder.build().execute(&self.pool).await?;
        Ok(())
    }
}
