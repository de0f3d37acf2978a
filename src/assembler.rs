//! Document assembler.
//!
//! Two read surfaces (`get_meta`, `get_entry`) and one write surface
//! (`put_entry`), plus `delete_entry` and `delete_by_prefix`, all gated by
//! the file filter (§4.9) and serialized per-id by the write lock (§5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;

use crate::cache::HashCache;
use crate::chunk;
use crate::config::Config;
use crate::db::{AllDocsOptions, Database};
use crate::error::{Error, Result};
use crate::filter::FileFilter;
use crate::ids::{is_leaf_id, LeafId};
use crate::leaf_store::LeafStore;
use crate::lock::LockRegistry;
use crate::model::{Entry, Leaf, NewNote, NoteMeta, NoteType};
use crate::replication::ChunkCollector;
use crate::sanity::CorruptedEntries;
use crate::waiter::Waiter;

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// An explicit target revision; combined with
    /// [`Config::delete_metadata_of_deleted_files`], forces a hard delete.
    pub explicit_revision: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub include_deleted: bool,
    /// When `true`, missing children are awaited via the leaf-arrival
    /// waiter instead of failing immediately (only consulted when
    /// `read_chunks_online` is off).
    pub wait_for_ready: bool,
}

/// Whether a document that previously existed under one of the legacy
/// note types should have its revision carried forward onto a new write.
fn carries_forward_revision(kind: NoteType) -> bool {
    matches!(kind, NoteType::Notes | NoteType::Newnote | NoteType::Plain)
}

pub struct Assembler {
    db: Arc<dyn Database>,
    remote: RwLock<Option<Arc<dyn Database>>>,
    chunk_collector: ChunkCollector,
    cache: Arc<HashCache>,
    waiter: Arc<Waiter>,
    filter: Arc<FileFilter>,
    locks: Arc<LockRegistry>,
    corrupted: Arc<CorruptedEntries>,
    config: Config,
    need_scanning: AtomicBool,
}

impl Assembler {
    pub fn new(
        db: Arc<dyn Database>,
        cache: Arc<HashCache>,
        waiter: Arc<Waiter>,
        filter: Arc<FileFilter>,
        locks: Arc<LockRegistry>,
        corrupted: Arc<CorruptedEntries>,
        config: Config,
    ) -> Self {
        Self {
            db,
            remote: RwLock::new(None),
            chunk_collector: ChunkCollector::new(),
            cache,
            waiter,
            filter,
            locks,
            corrupted,
            config,
            need_scanning: AtomicBool::new(false),
        }
    }

    /// Supplies the remote handle `get_entry`'s online read path falls back
    /// to for children missing from the local database. Unset until the
    /// host application has connected a remote (`tryCreateRemoteDatabase`).
    pub fn set_remote(&self, remote: Arc<dyn Database>) {
        *self.remote.write() = Some(remote);
    }

    pub fn clear_remote(&self) {
        *self.remote.write() = None;
    }

    pub fn needs_scanning(&self) -> bool {
        self.need_scanning.load(Ordering::Acquire)
    }

    fn clear_needs_scanning(&self) {
        self.need_scanning.store(false, Ordering::Release);
    }

    fn mark_needs_scanning(&self) {
        self.need_scanning.store(true, Ordering::Release);
    }

    /// `getMeta(id)` — metadata only, empty `data`. Returns `None` on 404
    /// or a leaf-typed document, or on a tombstoned entry when
    /// `include_deleted` is false.
    pub async fn get_meta(&self, id: &str, opts: &GetOptions) -> Result<Option<NoteMeta>> {
        if !self.filter.is_target_file(id) {
            return Ok(None);
        }
        if is_leaf_id(id) {
            return Ok(None);
        }
        let doc = match self.db.get(id).await {
            Ok(doc) => doc,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let meta: NoteMeta = match serde_json::from_value(doc) {
            Ok(m) => m,
            // Unknown/forward-incompatible variant: absent, not an error.
            Err(_) => return Ok(None),
        };
        if meta.deleted && !opts.include_deleted {
            return Ok(None);
        }
        Ok(Some(meta))
    }

    /// `getEntry(id)` — as [`Self::get_meta`], but also materializes `data`.
    pub async fn get_entry(&self, id: &str, opts: &GetOptions) -> Result<Option<Entry>> {
        let Some(meta) = self.get_meta(id, opts).await? else {
            return Ok(None);
        };

        if meta.is_leafless_legacy() {
            let data = meta.inline_data.clone().unwrap_or_default();
            return Ok(Some(Entry { meta, data }));
        }

        let data = if self.config.read_chunks_online {
            self.collect_children_locally(&meta.children).await
        } else {
            self.collect_children_sequentially(&meta.children, opts.wait_for_ready).await
        };

        match data {
            Some(data) => {
                self.corrupted.clear_one(id);
                Ok(Some(Entry { meta, data }))
            }
            None => {
                self.corrupted.mark(id);
                self.mark_needs_scanning();
                Ok(None)
            }
        }
    }

    /// Local `allDocs(keys=children)` with fallback to the connected remote
    /// for any ids missing locally (see [`ChunkCollector`]).
    async fn collect_children_locally(&self, children: &[LeafId]) -> Option<String> {
        let remote = self.remote.read().clone();
        self.chunk_collector
            .collect(&self.db, remote.as_ref(), children)
            .await
            .ok()
            .flatten()
    }

    async fn collect_children_sequentially(
        &self,
        children: &[LeafId],
        wait_for_ready: bool,
    ) -> Option<String> {
        let mut out = String::new();
        for child in children {
            match self.db.get(child.as_str()).await {
                Ok(doc) => {
                    let leaf: Leaf = serde_json::from_value(doc).ok()?;
                    out.push_str(&leaf.data);
                }
                Err(Error::NotFound(_)) if wait_for_ready => {
                    self.waiter.wait_for_leaf(child).await.ok()?;
                    let doc = self.db.get(child.as_str()).await.ok()?;
                    let leaf: Leaf = serde_json::from_value(doc).ok()?;
                    out.push_str(&leaf.data);
                }
                Err(_) => return None,
            }
        }
        Some(out)
    }

    /// `putEntry(note, saveAsBigChunk?)`.
    pub async fn put_entry(&self, note: &NewNote, save_as_big_chunk: bool) -> Result<()> {
        if !self.filter.is_target_file(&note.id) {
            return Ok(());
        }

        let plain_text = is_plain_text_id(&note.id);
        let passphrase = self.config.passphrase.as_deref();
        let mut store = LeafStore::new(&self.db, &self.cache, self.config.encrypt, passphrase);

        let mut children = Vec::new();
        for piece in chunk::split(
            &note.data,
            self.config.normalized_chunk_size_multiplier(),
            plain_text,
            save_as_big_chunk,
        ) {
            children.push(store.put_leaf(piece).await?);
        }
        store.flush().await?;

        let _guard = self.locks.acquire(&note.id).await;

        let previous_rev = match self.db.get(&note.id).await {
            Ok(doc) => serde_json::from_value::<NoteMeta>(doc)
                .ok()
                .filter(|m| carries_forward_revision(m.kind))
                .and_then(|m| m.rev),
            Err(_) => None,
        };

        let meta = NoteMeta {
            id: note.id.clone(),
            kind: NoteType::Newnote,
            ctime: note.ctime,
            mtime: note.mtime,
            size: note.data.len() as u64,
            children,
            inline_data: None,
            deleted: false,
            rev: previous_rev,
        };
        let doc = json!(meta);
        self.db.put(&note.id, doc, true).await?;
        self.corrupted.clear_one(&note.id);
        Ok(())
    }

    /// `deleteEntry(id, opt?)`.
    pub async fn delete_entry(&self, id: &str, opt: Option<DeleteOptions>) -> Result<bool> {
        let _guard = self.locks.acquire(id).await;

        if is_leaf_id(id) {
            return Err(Error::Unclassified(format!("refusing to delete a leaf via deleteEntry: {id}")));
        }

        let doc = match self.db.get(id).await {
            Ok(doc) => doc,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let mut meta: NoteMeta = match serde_json::from_value(doc) {
            Ok(m) => m,
            Err(_) => return Ok(false),
        };

        if matches!(meta.kind, NoteType::Notes) {
            // Legacy flat form: a genuine CouchDB-style tombstone rather
            // than our soft-delete flag.
            let doc = json!({ "id": id, "_deleted": true });
            self.db.put(id, doc, true).await?;
            return Ok(true);
        }

        let opt = opt.unwrap_or_default();
        let hard_delete =
            self.config.delete_metadata_of_deleted_files || opt.explicit_revision.is_some();

        meta.deleted = true;
        meta.mtime = current_time_millis();
        if let Some(rev) = opt.explicit_revision {
            meta.rev = Some(rev);
        }

        let doc = json!(DeletedMeta {
            meta: &meta,
            hard_delete,
        });
        self.db.put(id, doc, true).await?;
        Ok(true)
    }

    /// `deleteByPrefix(prefix)` — pages through `allDocs` in batches of
    /// 100, collecting ids matching `prefix` or `"/" + prefix` (excluding
    /// leaves), deleting each under its own lock and tolerating 404s.
    pub async fn delete_by_prefix(&self, prefix: &str) -> Result<u64> {
        const PAGE_SIZE: u32 = 100;
        let mut deleted = 0u64;
        let mut start_key: Option<String> = None;
        let alt_prefix = format!("/{prefix}");

        loop {
            let rows = self
                .db
                .all_docs(AllDocsOptions {
                    keys: None,
                    include_docs: false,
                    start_key: start_key.clone(),
                    limit: Some(PAGE_SIZE),
                })
                .await?;
            if rows.is_empty() {
                break;
            }
            let page_len = rows.len();
            for row in &rows {
                if is_leaf_id(&row.id) {
                    continue;
                }
                if row.id.starts_with(prefix) || row.id.starts_with(&alt_prefix) {
                    match self.delete_entry(&row.id, None).await {
                        Ok(true) => deleted += 1,
                        Ok(false) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            start_key = rows.last().map(|r| r.id.clone());
            if (page_len as u32) < PAGE_SIZE {
                break;
            }
        }
        Ok(deleted)
    }
}

#[derive(serde::Serialize)]
struct DeletedMeta<'a> {
    #[serde(flatten)]
    meta: &'a NoteMeta,
    /// Either `deleteMetadataOfDeletedFiles` or an explicit target revision
    /// alone is enough to force a hard delete.
    #[serde(rename = "_hard_delete")]
    hard_delete: bool,
}

fn current_time_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Structured-text heuristic used to pick plain-text vs binary chunking.
fn is_plain_text_id(id: &str) -> bool {
    const TEXT_EXTENSIONS: &[&str] = &["md", "txt", "markdown", "canvas", "json"];
    match id.rsplit_once('.') {
        Some((_, ext)) => TEXT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_extension_detection() {
        assert!(is_plain_text_id("notes/a.md"));
        assert!(is_plain_text_id("notes/a.MD"));
        assert!(!is_plain_text_id("attachments/a.png"));
        assert!(!is_plain_text_id("noext"));
    }

    #[test]
    fn revision_carries_forward_only_for_legacy_kinds() {
        assert!(carries_forward_revision(NoteType::Notes));
        assert!(carries_forward_revision(NoteType::Newnote));
        assert!(carries_forward_revision(NoteType::Plain));
    }
}
