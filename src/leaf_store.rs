//! Leaf store.
//!
//! `put_leaf` dedups by content hash, resolving collisions by probing an
//! increasing numeric suffix, and defers all actual writes to a single
//! bulk call per note.

use std::hash::Hasher;
use std::sync::Arc;

use serde_json::json;
use twox_hash::XxHash32;

use crate::cache::HashCache;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::ids::{LeafBaseId, LeafId};
use crate::model::{Leaf, LeafTag};

/// `h32(piece)`: a 32-bit non-cryptographic digest, hex-encoded.
fn h32(piece: &str) -> String {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(piece.as_bytes());
    format!("{:08x}", hasher.finish() as u32)
}

/// `h32_raw(piece) XOR h32_raw(passphrase)`, hex-encoded — the encrypted
/// variant of the leaf hash.
fn h32_encrypted(piece: &str, passphrase: &str) -> String {
    let mut piece_hasher = XxHash32::with_seed(0);
    piece_hasher.write(piece.as_bytes());
    let piece_hash = piece_hasher.finish() as u32;

    let mut pass_hasher = XxHash32::with_seed(0);
    pass_hasher.write(passphrase.as_bytes());
    let pass_hash = pass_hasher.finish() as u32;

    format!("{:08x}", piece_hash ^ pass_hash)
}

/// A leaf whose id has been reserved locally but not yet written to the
/// database; collected per-note and flushed in a single `bulk_docs` call.
struct PendingLeaf {
    id: LeafId,
    data: String,
}

/// Drives the hashing/collision-probing/caching algorithm for a single
/// note's set of pieces, and batches the resulting writes.
pub struct LeafStore<'a> {
    db: &'a Arc<dyn Database>,
    cache: &'a HashCache,
    encrypt: bool,
    passphrase: Option<&'a str>,
    pending: Vec<PendingLeaf>,
}

impl<'a> LeafStore<'a> {
    pub fn new(
        db: &'a Arc<dyn Database>,
        cache: &'a HashCache,
        encrypt: bool,
        passphrase: Option<&'a str>,
    ) -> Self {
        Self {
            db,
            cache,
            encrypt,
            passphrase,
            pending: Vec::new(),
        }
    }

    /// `putLeaf(piece) -> leafId`. Never touches the database directly;
    /// new leaves are collected in `self.pending` until [`Self::flush`] is
    /// called.
    pub async fn put_leaf(&mut self, piece: &str) -> Result<LeafId> {
        if let Some(id) = self.cache.get(piece) {
            return Ok(id);
        }

        let hex = if self.encrypt {
            h32_encrypted(piece, self.passphrase.unwrap_or_default())
        } else {
            h32(piece)
        };
        let base = LeafBaseId::base(&hex, self.encrypt);

        let mut q = 0u32;
        let id = loop {
            let candidate = base.candidate(q);
            match self.db.get(candidate.as_str()).await {
                Err(Error::NotFound(_)) => {
                    // Not written yet locally. Another piece earlier in this
                    // same note's batch may already have reserved this exact
                    // id with different content (a collision within one
                    // flush) — if so, keep probing.
                    if self
                        .pending
                        .iter()
                        .any(|p| p.id == candidate && p.data != piece)
                    {
                        q += 1;
                    } else {
                        break candidate;
                    }
                }
                Ok(doc) => {
                    let existing: Leaf = serde_json::from_value(doc)
                        .map_err(|e| Error::Unclassified(e.to_string()))?;
                    if existing.data == piece {
                        self.cache.set(piece, candidate.clone());
                        return Ok(candidate);
                    }
                    q += 1;
                }
                Err(other) => return Err(other),
            }
        };

        self.pending.push(PendingLeaf {
            id: id.clone(),
            data: piece.to_owned(),
        });
        self.cache.set(piece, id.clone());
        Ok(id)
    }

    /// Issues a single bulk write for every leaf reserved since the last
    /// flush. Per-item 409 conflicts are tolerated silently (another writer
    /// won the race); any other non-ok status aborts the write.
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let docs: Vec<_> = self
            .pending
            .iter()
            .map(|p| {
                json!(Leaf {
                    id: p.id.clone(),
                    kind: LeafTag::Leaf,
                    data: p.data.clone(),
                })
            })
            .collect();
        let results = self.db.bulk_docs(docs).await?;
        for result in results {
            if !result.ok && !result.conflict {
                return Err(Error::Unclassified(format!(
                    "bulk leaf write failed for {}",
                    result.id
                )));
            }
        }
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use crossbeam_channel::Receiver;

    use crate::db::{
        AllDocsOptions, AllDocsRow, BulkResult, ChangeEvent, ChangeFilter, DbInfo, PutResult,
        ReplicationEvent, ReplicationHandle, ReplicationOptions,
    };

    /// A fake occupying every base candidate id (suffix `0`) with content
    /// that never matches what `put_leaf` is asked to store, forcing the
    /// collision-suffix probe to advance at least once regardless of what
    /// `h32` actually produces for the test payload.
    #[derive(Default)]
    struct CollidingDatabase {
        docs: StdMutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl Database for CollidingDatabase {
        async fn get(&self, id: &str) -> Result<serde_json::Value> {
            let docs = self.docs.lock().unwrap();
            match docs.get(id) {
                Some(data) => Ok(json!(Leaf { id: LeafId(id.to_owned()), kind: LeafTag::Leaf, data: data.clone() })),
                None => Err(Error::NotFound(id.to_owned())),
            }
        }

        async fn put(&self, _id: &str, _doc: serde_json::Value, _force: bool) -> Result<PutResult> {
            unreachable!("leaf store never calls put directly, only bulk_docs")
        }

        async fn bulk_docs(&self, docs: Vec<serde_json::Value>) -> Result<Vec<BulkResult>> {
            let mut stored = self.docs.lock().unwrap();
            let mut results = Vec::with_capacity(docs.len());
            for doc in docs {
                let leaf: Leaf = serde_json::from_value(doc).unwrap();
                let id = leaf.id.as_str().to_owned();
                stored.insert(id.clone(), leaf.data);
                results.push(BulkResult { id, ok: true, conflict: false, rev: Some("1".to_owned()) });
            }
            Ok(results)
        }

        async fn all_docs(&self, _opts: AllDocsOptions) -> Result<Vec<AllDocsRow>> {
            Ok(Vec::new())
        }

        fn subscribe_changes(&self, _filter: ChangeFilter) -> Receiver<ChangeEvent> {
            crossbeam_channel::unbounded().1
        }

        fn replicate(&self, _remote: Arc<dyn Database>, _opts: ReplicationOptions) -> Box<dyn ReplicationHandle> {
            unreachable!("not exercised by this fixture")
        }

        async fn info(&self) -> Result<DbInfo> {
            Ok(DbInfo::default())
        }

        async fn destroy(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn collision_at_base_candidate_advances_the_suffix() {
        let hex = h32("the piece that goes in");
        let occupied_id = LeafId::base(&hex, false).candidate(0);

        let db: Arc<dyn Database> = Arc::new(CollidingDatabase::default());
        futures::executor::block_on(db.bulk_docs(vec![json!(Leaf {
            id: occupied_id.clone(),
            kind: LeafTag::Leaf,
            data: "unrelated content already sitting at the base id".to_owned(),
        })]))
        .unwrap();

        let cache = HashCache::new(8);
        let mut store = LeafStore::new(&db, &cache, false, None);
        let id = futures::executor::block_on(store.put_leaf("the piece that goes in")).unwrap();

        assert_ne!(id, occupied_id);
        assert_eq!(id, LeafBaseId::candidate(&LeafId::base(&hex, false), 1));
    }

    #[test]
    fn h32_is_deterministic() {
        assert_eq!(h32("hello"), h32("hello"));
        assert_ne!(h32("hello"), h32("world"));
    }

    #[test]
    fn encrypted_hash_depends_on_passphrase() {
        let a = h32_encrypted("hello", "secret1");
        let b = h32_encrypted("hello", "secret2");
        assert_ne!(a, b);
    }

    #[test]
    fn encrypted_hash_is_symmetric_in_xor() {
        // XOR(a, b) == XOR(b, a); sanity check the commutativity we rely on
        // for the "same payload, same settings, same leaf id" invariant.
        let piece_hash = {
            let mut h = XxHash32::with_seed(0);
            h.write(b"payload");
            h.finish() as u32
        };
        let pass_hash = {
            let mut h = XxHash32::with_seed(0);
            h.write(b"pass");
            h.finish() as u32
        };
        assert_eq!(piece_hash ^ pass_hash, pass_hash ^ piece_hash);
    }
}
