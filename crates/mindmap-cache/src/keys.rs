//! Redis key layout (spec.md §6). Every key the cache touches is built here
//! so the layout lives in exactly one place.

use uuid::Uuid;

pub fn diagram(user_id: &str, diagram_id: &Uuid) -> String {
    format!("diagram:{user_id}:{diagram_id}")
}

pub fn user_meta(user_id: &str) -> String {
    format!("diagrams:user:{user_id}:meta")
}

pub fn user_list(user_id: &str) -> String {
    format!("diagrams:user:{user_id}:list")
}

pub const DIRTY_SET: &str = "diagrams:dirty";
pub const PENDING_CREATE_SET: &str = "diagrams:pending_create";

/// Entries in `DIRTY_SET` / `PENDING_CREATE_SET` are `"{userId}:{diagramId}"`.
pub fn sync_entry(user_id: &str, diagram_id: &Uuid) -> String {
    format!("{user_id}:{diagram_id}")
}

pub fn parse_sync_entry(entry: &str) -> Option<(String, Uuid)> {
    let (user_id, id) = entry.rsplit_once(':')?;
    let diagram_id = Uuid::parse_str(id).ok()?;
    Some((user_id.to_string(), diagram_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_entry_round_trips() {
        let id = Uuid::new_v4();
        let entry = sync_entry("user-42", &id);
        assert_eq!(parse_sync_entry(&entry), Some(("user-42".to_string(), id)));
    }

    #[test]
    fn parse_sync_entry_rejects_garbage() {
        assert_eq!(parse_sync_entry("not-an-entry"), None);
        assert_eq!(parse_sync_entry("user:not-a-uuid"), None);
    }
}
