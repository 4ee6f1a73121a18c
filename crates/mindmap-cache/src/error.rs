//! Error type for the diagram cache (spec.md §7).

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("diagram not found")]
    NotFound,

    #[error("diagram limit reached ({0} per user)")]
    QuotaExceeded(usize),

    #[error("diagram spec too large: {actual_kb:.1}KB exceeds {limit_kb}KB limit")]
    SpecTooLarge { actual_kb: f64, limit_kb: usize },

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;
