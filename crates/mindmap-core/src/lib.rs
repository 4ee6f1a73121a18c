//! Core types shared across the orchestration core.
//!
//! This crate defines the data model (messages, chat requests/results,
//! streaming chunks, usage records), the error taxonomy, and the
//! environment-driven configuration helpers consumed by `mindmap-llm` and
//! `mindmap-cache`. It owns nothing that talks to a network or a database.

pub mod config;
pub mod error;
pub mod message;
pub mod model;
pub mod tracing_init;

pub use error::{classify_error, CoreError, HealthErrorCategory, Result};
pub use message::{Content, Message, MessageRole};
pub use model::{
    ChatRequest, ChatResult, LogicalModel, PhysicalModel, ProgressiveEvent, ProgressiveEventKind,
    StreamChunk, TokenUsage, Tracking, UsageRecord,
};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{endpoints, env_vars};
    pub use crate::error::{classify_error, CoreError, HealthErrorCategory, Result};
    pub use crate::message::{Content, Message, MessageRole};
    pub use crate::model::{
        ChatRequest, ChatResult, LogicalModel, PhysicalModel, ProgressiveEvent,
        ProgressiveEventKind, StreamChunk, TokenUsage, Tracking, UsageRecord,
    };
}
