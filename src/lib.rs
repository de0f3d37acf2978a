//! A bidirectionally replicated, content-addressed document store for
//! small structured records ("notes"), chunked, deduplicated, optionally
//! encrypted, and synchronized against a remote replica of a multi-master
//! document database.
//!
//! The crate root wires the ten components together behind [`Engine`], the
//! single entry point a host application constructs per local database
//! name — the core explicitly disallows more than one instance per local
//! database name.

pub mod assembler;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod ids;
pub mod leaf_store;
pub mod lock;
pub mod migration;
pub mod milestone;
pub mod model;
pub mod replication;
pub mod sanity;
pub mod waiter;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::info;
use parking_lot::RwLock;

use crate::assembler::{Assembler, DeleteOptions, GetOptions};
use crate::cache::HashCache;
use crate::config::Config;
use crate::db::{Database, Hooks, LocalDatabaseOptions, ReplicationEvent, RemoteAuth};
use crate::error::{Error, Result};
use crate::filter::FileFilter;
use crate::lock::LockRegistry;
use crate::migration::{subscribe_leaf_changes, MigrationOutcome, Migrator};
use crate::milestone::MilestoneNegotiator;
use crate::model::{Entry, NewNote, NoteMeta};
use crate::replication::ReplicationCoordinator;
use crate::sanity::{san_check, CorruptedEntries};
use crate::waiter::Waiter;

/// A local database generation's name suffix, appended to the
/// caller-supplied base name: `<dbname>-livesync-v2` for the current
/// generation, `<dbname>-livesync` for the one it migrates from.
const NEW_GENERATION_SUFFIX: &str = "-livesync-v2";
const OLD_GENERATION_SUFFIX: &str = "-livesync";

/// Bound on the hash cache; not exposed as end-user configuration, fixed
/// here the way the leaf store's other internal constants are.
const HASH_CACHE_CAPACITY: usize = 1024;

/// Result of [`Engine::initialize_database`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitializeOutcome {
    pub migration: MigrationOutcome,
}

/// Everything an engine instance shares across the lifetime of one local
/// database name: the new-generation handle, the components built on top
/// of it, and the bootstrap/replication state machines.
pub struct Engine {
    hooks: Hooks,
    config: RwLock<Config>,
    db: Arc<dyn Database>,
    cache: Arc<HashCache>,
    waiter: Arc<Waiter>,
    filter: Arc<FileFilter>,
    locks: Arc<LockRegistry>,
    corrupted: Arc<CorruptedEntries>,
    assembler: Assembler,
    migrator: Migrator,
    nodeid: RwLock<Option<String>>,
    replication: ReplicationCoordinator,
    leaf_listener: RwLock<Option<JoinHandle<()>>>,
    ready: AtomicBool,
}

impl Engine {
    /// `initializeDatabase()`. Opens the new-generation local database,
    /// checks for an old-generation one, migrates it if non-empty, ensures
    /// node info exists, publishes design documents, subscribes the
    /// leaf-change listener, and marks the engine ready.
    pub fn initialize_database(dbname: &str, config: Config, hooks: Hooks) -> Result<Arc<Engine>> {
        let filter = FileFilter::new(
            config.sync_only_regex.as_deref(),
            config.sync_ignore_regex.as_deref(),
        )?;

        let new_db = hooks.local_factory.create(
            &format!("{dbname}{NEW_GENERATION_SUFFIX}"),
            LocalDatabaseOptions {
                revs_limit: Some(100),
                deterministic_revs: true,
                auto_compaction: !config.use_history,
                skip_setup: false,
            },
        )?;

        let cache = Arc::new(HashCache::new(HASH_CACHE_CAPACITY));
        let waiter = Arc::new(Waiter::new());
        let filter = Arc::new(filter);
        let locks = Arc::new(LockRegistry::new());
        let corrupted = Arc::new(CorruptedEntries::new());

        let assembler = Assembler::new(
            new_db.clone(),
            cache.clone(),
            waiter.clone(),
            filter.clone(),
            locks.clone(),
            corrupted.clone(),
            config.clone(),
        );

        let migrator = Migrator::new();
        let replication = ReplicationCoordinator::new(config.clone());

        let engine = Arc::new(Engine {
            hooks,
            config: RwLock::new(config),
            db: new_db,
            cache,
            waiter,
            filter,
            locks,
            corrupted,
            assembler,
            migrator,
            nodeid: RwLock::new(None),
            replication,
            leaf_listener: RwLock::new(None),
            ready: AtomicBool::new(false),
        });

        futures::executor::block_on(engine.bootstrap(dbname))?;

        Ok(engine)
    }

    async fn bootstrap(&self, dbname: &str) -> Result<InitializeOutcome> {
        let old_db = self
            .hooks
            .local_factory
            .create(
                &format!("{dbname}{OLD_GENERATION_SUFFIX}"),
                LocalDatabaseOptions {
                    skip_setup: true,
                    ..Default::default()
                },
            )
            .ok();

        let old_db = match &old_db {
            Some(db) => match db.info().await {
                Ok(info) if info.doc_count > 0 => {
                    let config = self.config.read().clone();
                    if config.encrypt {
                        if let Some(passphrase) = &config.passphrase {
                            self.hooks
                                .encryption
                                .enable_encryption(db.as_ref(), passphrase, true)?;
                        }
                    }
                    Some(db.clone())
                }
                Ok(_) => None,
                Err(_) => None,
            },
            None => None,
        };

        let outcome = match self
            .migrator
            .bootstrap(&self.db, old_db.as_ref(), &self.hooks.schema)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                info!("migration failed: {e}");
                return Err(Error::MigrationFailure);
            }
        };

        if let MigrationOutcome::Copied { .. } = outcome {
            if let Some(old) = &old_db {
                old.destroy().await?;
            }
        }

        let info: NodeInfoSnapshot = self.read_node_info().await?;
        *self.nodeid.write() = Some(info.nodeid);

        let handle = subscribe_leaf_changes(&self.db, self.waiter.clone());
        *self.leaf_listener.write() = Some(handle);

        self.ready.store(true, Ordering::Release);

        Ok(InitializeOutcome { migration: outcome })
    }

    async fn read_node_info(&self) -> Result<NodeInfoSnapshot> {
        let doc = self.db.get(crate::ids::NODEINFO_DOCID).await?;
        let info: crate::model::NodeInfo =
            serde_json::from_value(doc).map_err(|e| Error::Unclassified(e.to_string()))?;
        Ok(NodeInfoSnapshot { nodeid: info.nodeid })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && self.migrator.is_ready()
    }

    fn require_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    /// `getDBEntryMeta(id)`.
    pub async fn get_db_entry_meta(&self, id: &str, include_deleted: bool) -> Result<Option<NoteMeta>> {
        self.require_ready()?;
        self.assembler
            .get_meta(id, &GetOptions { include_deleted, wait_for_ready: false })
            .await
    }

    /// `getDBEntry(id)`.
    pub async fn get_db_entry(&self, id: &str, opts: GetOptions) -> Result<Option<Entry>> {
        self.require_ready()?;
        self.assembler.get_entry(id, &opts).await
    }

    /// `putDBEntry(note, saveAsBigChunk?)`.
    pub async fn put_db_entry(&self, note: &NewNote, save_as_big_chunk: bool) -> Result<()> {
        self.require_ready()?;
        self.assembler.put_entry(note, save_as_big_chunk).await
    }

    /// `deleteDBEntry(id, opt?)`.
    pub async fn delete_db_entry(&self, id: &str, opt: Option<DeleteOptions>) -> Result<bool> {
        self.require_ready()?;
        self.assembler.delete_entry(id, opt).await
    }

    /// `deleteDBEntryPrefix(prefix)`.
    pub async fn delete_db_entry_prefix(&self, prefix: &str) -> Result<u64> {
        self.require_ready()?;
        self.assembler.delete_by_prefix(prefix).await
    }

    /// `isTargetFile(path)`.
    pub fn is_target_file(&self, path: &str) -> bool {
        self.filter.is_target_file(path)
    }

    /// `sanCheck(note)`.
    pub async fn san_check(&self, note: &NoteMeta) -> Result<bool> {
        san_check(&self.db, &self.corrupted, note).await
    }

    /// Drains the set of note ids whose children could not be fully
    /// resolved since the last drain.
    pub fn drain_corrupted_entries(&self) -> Vec<String> {
        self.corrupted.drain()
    }

    pub fn needs_scanning(&self) -> bool {
        self.assembler.needs_scanning()
    }

    /// `tryCreateRemoteDatabase()` — connects to the configured remote and
    /// publishes design documents onto it.
    pub fn try_create_remote_database(&self) -> Result<Arc<dyn Database>> {
        let config = self.config.read();
        let auth = RemoteAuth {
            username: config.couch_db_user.clone(),
            password: config.couch_db_password.clone(),
        };
        let remote = self.hooks.remote.connect(
            &config.couch_db_uri,
            &auth,
            config.disable_request_uri,
            config.encrypt.then(|| config.passphrase.as_deref()).flatten(),
        )?;
        self.hooks.schema.put_design_documents(remote.as_ref())?;
        self.assembler.set_remote(remote.clone());
        Ok(remote)
    }

    /// `tryResetRemoteDatabase()`.
    pub async fn try_reset_remote_database(&self, remote: &Arc<dyn Database>) -> Result<()> {
        remote.destroy().await
    }

    fn nodeid(&self) -> Result<String> {
        self.nodeid.read().clone().ok_or(Error::NotReady)
    }

    /// `markRemoteLocked(flag)`.
    pub async fn mark_remote_locked(&self, remote: &Arc<dyn Database>, locked: bool, now: i64) -> Result<()> {
        let negotiator = MilestoneNegotiator::new(self.nodeid()?);
        negotiator.mark_locked(remote, locked, now).await
    }

    /// `markRemoteResolved()`.
    pub async fn mark_remote_resolved(&self, remote: &Arc<dyn Database>, now: i64) -> Result<()> {
        let negotiator = MilestoneNegotiator::new(self.nodeid()?);
        negotiator.mark_resolved(remote, now).await
    }

    /// `openReplication({keepAlive, showResult, cb})`. Blocks the calling
    /// thread for the duration of the replication (or indefinitely when
    /// `keep_alive` is set); call from a dedicated worker if the host
    /// application needs this to run in the background.
    pub fn open_replication(
        &self,
        remote: Arc<dyn Database>,
        keep_alive: bool,
        on_event: impl FnMut(&ReplicationEvent) + Send + 'static,
        now: i64,
    ) -> Result<()> {
        self.require_ready()?;
        let nodeid = self.nodeid()?;
        self.replication.start(
            self.db.clone(),
            remote,
            &nodeid,
            keep_alive,
            &self.hooks.transport,
            on_event,
            now,
        )
    }

    /// `replicateAllToServer()` — a one-shot, non-live replication.
    pub fn replicate_all_to_server(&self, remote: Arc<dyn Database>, now: i64) -> Result<()> {
        self.open_replication(remote, false, |_| {}, now)
    }

    /// `closeReplication()`.
    pub fn close_replication(&self) {
        self.replication.close();
    }

    /// `isVersionUpgradable()` — true when the operator has flagged a
    /// pending version upgrade via `versionUpFlash`.
    pub fn is_version_upgradable(&self) -> bool {
        !self.config.read().version_up_flash.is_empty()
    }

    /// `resetDatabase()` — destroys and recreates the local database, then
    /// re-runs bootstrap.
    pub async fn reset_database(self: &Arc<Self>, dbname: &str) -> Result<()> {
        self.migrator.reset_database(&self.db).await?;
        self.bootstrap(dbname).await?;
        Ok(())
    }

    /// `resetLocalOldDatabase()`.
    pub async fn reset_local_old_database(&self, old_db: &Arc<dyn Database>) -> Result<()> {
        self.migrator.reset_local_old_database(old_db).await
    }

    /// `close()` / `onunload()` — cancels the leaf-change listener and
    /// closes the local database.
    pub async fn close(&self) -> Result<()> {
        self.replication.close();
        drop(self.leaf_listener.write().take());
        self.db.close().await
    }
}

struct NodeInfoSnapshot {
    nodeid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_generation_suffix_matches_spec_naming() {
        assert_eq!(NEW_GENERATION_SUFFIX, "-livesync-v2");
        assert_eq!(OLD_GENERATION_SUFFIX, "-livesync");
    }
}
