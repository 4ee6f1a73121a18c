//! Diagram persistence: the Redis-first `DiagramCache`, its durable
//! relational store, and the background worker that reconciles the two
//! (spec.md §4.8).
//!
//! This crate also supplies `mindmap-llm`'s [`UsageSink`](mindmap_llm::token_tracker::UsageSink)
//! implementation, so token-usage records land in the same database as
//! diagrams.

pub mod cache;
pub mod error;
pub mod keys;
pub mod model;
pub mod store;
pub mod sync;
pub mod usage_sink;

pub use cache::DiagramCache;
pub use error::{CacheError, Result};
pub use model::{CacheStats, Diagram, DiagramPage, DiagramPatch, DiagramSummary, NewDiagram};
pub use store::DurableStore;
