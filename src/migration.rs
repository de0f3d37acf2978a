//! Bootstrap / migration.
//!
//! Runs once per local database generation: ensures the `NodeInfo`
//! singleton exists, publishes design documents, and — if an
//! old-generation database is supplied — copies its non-leaf documents
//! across before the engine is considered ready.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::info;
use serde_json::json;

use crate::db::{
    ChangeFilter, Checkpoint, Database, ReplicationEvent, ReplicationMode, ReplicationOptions,
    SchemaHooks,
};
use crate::error::{Error, Result};
use crate::ids::{generate_nodeid, is_leaf_id, NODEINFO_DOCID};
use crate::model::NodeInfo;
use crate::waiter::Waiter;

/// `batch_size`/`batches_limit` for the one-shot old-generation-to-new-
/// generation copy, distinct from the operator's configured replication
/// pacing for remote sync.
const OLD_GENERATION_BATCH_SIZE: u32 = 25;
const OLD_GENERATION_BATCHES_LIMIT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The old-generation database had no documents; nothing to copy.
    SkippedEmpty,
    /// Every non-leaf document from the old generation was copied across.
    Copied { documents: u64 },
    /// No old-generation database was supplied: a brand new install.
    FreshBootstrap,
}

/// Tracks whether bootstrap/migration has completed; [`crate::Engine`]
/// consults [`Migrator::is_ready`] before serving reads or writes.
pub struct Migrator {
    ready: AtomicBool,
}

impl Migrator {
    pub fn new() -> Self {
        Self { ready: AtomicBool::new(false) }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub async fn bootstrap(
        &self,
        new_db: &Arc<dyn Database>,
        old_db: Option<&Arc<dyn Database>>,
        schema: &Arc<dyn SchemaHooks>,
    ) -> Result<MigrationOutcome> {
        self.set_ready(false);

        self.ensure_node_info(new_db).await?;
        schema.put_design_documents(new_db.as_ref())?;

        let outcome = match old_db {
            None => MigrationOutcome::FreshBootstrap,
            Some(old) => self.migrate_from_old(old, new_db).await?,
        };

        self.set_ready(true);
        Ok(outcome)
    }

    async fn ensure_node_info(&self, db: &Arc<dyn Database>) -> Result<()> {
        match db.get(NODEINFO_DOCID).await {
            Ok(_) => Ok(()),
            Err(Error::NotFound(_)) => {
                let info = NodeInfo { nodeid: generate_nodeid(), v20220607: true };
                db.put(NODEINFO_DOCID, json!(info), true).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Replicates the old-generation database onto the new generation via
    /// the abstract `Database::replicate` one-shot push, at the reduced
    /// `batch_size=25, batches_limit=10` used for this copy, logging
    /// progress as change events arrive.
    async fn migrate_from_old(
        &self,
        old: &Arc<dyn Database>,
        new_db: &Arc<dyn Database>,
    ) -> Result<MigrationOutcome> {
        let info = old.info().await?;
        if info.doc_count == 0 {
            return Ok(MigrationOutcome::SkippedEmpty);
        }

        let opts = ReplicationOptions {
            mode: ReplicationMode::PushOnly,
            live: false,
            retry: false,
            batch_size: OLD_GENERATION_BATCH_SIZE,
            batches_limit: OLD_GENERATION_BATCHES_LIMIT,
            heartbeat_ms: None,
            push_checkpoint: Checkpoint::Target,
            pull_checkpoint: Checkpoint::Target,
            push_filter: None,
            pull_filter: None,
        };
        let handle = old.replicate(new_db.clone(), opts);
        let events = handle.events().clone();

        let mut copied = 0u64;
        loop {
            match events.recv() {
                Ok(ReplicationEvent::Change { docs, .. }) => {
                    copied += docs.len() as u64;
                    info!("migration: copied {copied} documents from old generation so far");
                }
                Ok(ReplicationEvent::Complete) => break,
                Ok(ReplicationEvent::Error(msg)) => return Err(Error::Unclassified(msg)),
                Ok(ReplicationEvent::Denied(msg)) => return Err(Error::Unclassified(msg)),
                Ok(_) => {}
                Err(_) => break,
            }
        }
        Ok(MigrationOutcome::Copied { documents: copied })
    }

    /// `resetDatabase()` — destroys the new-generation database, clearing
    /// the ready flag. The caller is responsible for recreating it via the
    /// `LocalDatabaseFactory` and re-running [`Self::bootstrap`].
    pub async fn reset_database(&self, db: &Arc<dyn Database>) -> Result<()> {
        self.set_ready(false);
        db.destroy().await
    }

    /// `resetLocalOldDatabase()` — destroys only the old-generation
    /// database; the new generation's ready state is untouched.
    pub async fn reset_local_old_database(&self, old_db: &Arc<dyn Database>) -> Result<()> {
        old_db.destroy().await
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscribes to the new-generation database's changes feed, forwarding
/// every non-deleted leaf arrival to [`Waiter::leaf_arrived`] so in-flight
/// `wait_for_leaf` calls can resolve. Runs for the lifetime of the
/// underlying channel; dropping the database's side of that channel ends
/// the thread.
pub fn subscribe_leaf_changes(db: &Arc<dyn Database>, waiter: Arc<Waiter>) -> JoinHandle<()> {
    let changes = db.subscribe_changes(ChangeFilter::TypeEquals("leaf"));
    std::thread::spawn(move || {
        for event in changes.iter() {
            if !event.deleted && is_leaf_id(&event.id) {
                waiter.leaf_arrived(&crate::ids::LeafId(event.id));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_migrator_is_not_ready() {
        let m = Migrator::new();
        assert!(!m.is_ready());
    }
}
