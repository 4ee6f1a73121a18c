//! Diagram record and list/stats value types (spec.md §3, §4.8).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A saved diagram, as stored in Redis and the durable store (spec.md §6
/// `diagrams` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagram {
    pub id: Uuid,
    pub user_id: String,
    pub title: String,
    pub diagram_type: String,
    pub spec: serde_json::Value,
    pub language: String,
    pub thumbnail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub is_pinned: bool,
}

/// Input for `DiagramCache::save_create`.
#[derive(Debug, Clone)]
pub struct NewDiagram {
    pub title: String,
    pub diagram_type: String,
    pub spec: serde_json::Value,
    pub language: String,
    pub thumbnail: Option<String>,
}

/// Input for `DiagramCache::save_update`. `None` fields keep their current
/// value; `created_at` and `is_pinned` are never touched by a patch (spec.md
/// §4.8 "merge the patch, preserve `createdAt` and `isPinned`").
#[derive(Debug, Clone, Default)]
pub struct DiagramPatch {
    pub title: Option<String>,
    pub spec: Option<serde_json::Value>,
    pub language: Option<String>,
    pub thumbnail: Option<String>,
}

/// The subset of a diagram's fields shown in a list view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagramSummary {
    pub id: Uuid,
    pub title: String,
    pub diagram_type: String,
    pub thumbnail: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub is_pinned: bool,
}

impl From<&Diagram> for DiagramSummary {
    fn from(d: &Diagram) -> Self {
        Self {
            id: d.id,
            title: d.title.clone(),
            diagram_type: d.diagram_type.clone(),
            thumbnail: d.thumbnail.clone(),
            updated_at: d.updated_at,
            is_pinned: d.is_pinned,
        }
    }
}

/// A paginated `list` result (spec.md §4.8 read path).
#[derive(Debug, Clone, Serialize)]
pub struct DiagramPage {
    pub diagrams: Vec<DiagramSummary>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
    pub max_diagrams: usize,
}

/// Operator-facing cache statistics (SPEC_FULL §C.5).
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub storage: &'static str,
    pub total_synced: u64,
    pub total_errors: u64,
    pub dirty_count: u64,
    pub pending_create_count: u64,
    pub cache_ttl_secs: u64,
    pub sync_interval_secs: u64,
    pub sync_batch_size: usize,
    pub max_per_user: usize,
    pub max_spec_size_kb: usize,
}

/// Sorts in place the way `list` requires: pinned first, then newest first,
/// then `id` to make same-timestamp ties deterministic across calls (spec.md
/// §4.8 step 4, index key `(isPinned, updatedAt, id)`).
pub fn sort_summaries(items: &mut [DiagramSummary]) {
    items.sort_by(|a, b| {
        b.is_pinned
            .cmp(&a.is_pinned)
            .then(b.updated_at.cmp(&a.updated_at))
            .then(a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(title: &str, pinned: bool, updated_secs_ago: i64) -> DiagramSummary {
        DiagramSummary {
            id: Uuid::new_v4(),
            title: title.into(),
            diagram_type: "bubble_map".into(),
            thumbnail: None,
            updated_at: Utc::now() - chrono::Duration::seconds(updated_secs_ago),
            is_pinned: pinned,
        }
    }

    #[test]
    fn pinned_sorts_before_unpinned_regardless_of_age() {
        let mut items = vec![summary("old-pinned", true, 1000), summary("new-plain", false, 1)];
        sort_summaries(&mut items);
        assert_eq!(items[0].title, "old-pinned");
    }

    #[test]
    fn within_same_pin_state_newest_first() {
        let mut items = vec![summary("older", false, 100), summary("newer", false, 1)];
        sort_summaries(&mut items);
        assert_eq!(items[0].title, "newer");
    }

    #[test]
    fn ties_on_pin_and_timestamp_break_on_id() {
        let now = Utc::now();
        let mut a = summary("a", false, 0);
        let mut b = summary("b", false, 0);
        a.updated_at = now;
        b.updated_at = now;
        if a.id > b.id {
            std::mem::swap(&mut a, &mut b);
        }
        let expected_first = a.id;

        let mut items = vec![b.clone(), a.clone()];
        sort_summaries(&mut items);
        assert_eq!(items[0].id, expected_first);

        // Same inputs, different starting order: result must be identical.
        let mut items_reordered = vec![a, b];
        sort_summaries(&mut items_reordered);
        assert_eq!(items_reordered[0].id, expected_first);
    }
}
