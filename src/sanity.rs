//! Sanity checker.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::{AllDocsOptions, Database};
use crate::error::Result;
use crate::model::{NoteMeta, NoteType};

/// Notes whose `children` could not be fully resolved during a read or a
/// sanity check. Has no eviction by design; drained by
/// [`crate::Engine::drain_corrupted_entries`].
#[derive(Default)]
pub struct CorruptedEntries {
    inner: Mutex<HashMap<String, ()>>,
}

impl CorruptedEntries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, id: &str) {
        self.inner.lock().insert(id.to_owned(), ());
    }

    pub fn clear_one(&self, id: &str) {
        self.inner.lock().remove(id);
    }

    pub fn drain(&self) -> Vec<String> {
        self.inner.lock().drain().map(|(k, _)| k).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains_key(id)
    }
}

/// `sanCheck(note)`: for `{plain, newnote}`, verifies every child leaf id
/// exists via a single `allDocs(keys=children)` call.
pub async fn san_check(
    db: &Arc<dyn Database>,
    corrupted: &CorruptedEntries,
    note: &NoteMeta,
) -> Result<bool> {
    if matches!(note.kind, NoteType::Notes) || note.children.is_empty() {
        return Ok(true);
    }
    let keys = note.children.iter().map(|c| c.as_str().to_owned()).collect();
    let rows = db
        .all_docs(AllDocsOptions {
            keys: Some(keys),
            include_docs: false,
            ..Default::default()
        })
        .await?;
    if rows.iter().any(|r| r.error.is_some()) {
        corrupted.mark(&note.id);
        return Ok(false);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupted_entries_have_no_eviction_until_drained() {
        let c = CorruptedEntries::new();
        c.mark("a.md");
        c.mark("b.md");
        assert!(c.contains("a.md"));
        let drained = c.drain();
        assert_eq!(drained.len(), 2);
        assert!(!c.contains("a.md"));
    }

    #[test]
    fn clear_one_removes_single_entry() {
        let c = CorruptedEntries::new();
        c.mark("a.md");
        c.mark("b.md");
        c.clear_one("a.md");
        assert!(!c.contains("a.md"));
        assert!(c.contains("b.md"));
    }
}
