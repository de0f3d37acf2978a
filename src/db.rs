//! Abstract collaborators: the document database primitive, the remote
//! connector, the path<->id mapping, schema/version hooks, the encryption
//! transform and the transport-layer backoff signal.
//!
//! None of these are implemented by this crate against a real database or
//! network transport — the host application supplies concrete
//! implementations. They are gathered into one [`Hooks`] capability record
//! per the "Abstract handle pattern" design note, rather than threaded
//! through the engine as separate constructor arguments.

use std::sync::Arc;

use async_trait::async_trait;
use crossbeam_channel::Receiver;
use serde_json::Value;

use crate::error::Result;

pub type DocId = String;
pub type Revision = String;

#[derive(Debug, Clone, Default)]
pub struct DbInfo {
    pub doc_count: u64,
    pub update_seq: String,
}

#[derive(Debug, Clone, Default)]
pub struct AllDocsOptions {
    pub keys: Option<Vec<DocId>>,
    pub include_docs: bool,
    pub start_key: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct AllDocsRow {
    pub id: DocId,
    pub doc: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub ok: bool,
    pub rev: Revision,
}

#[derive(Debug, Clone)]
pub struct BulkResult {
    pub id: DocId,
    pub ok: bool,
    /// `true` for a 409 conflict specifically, so the leaf store can tell a
    /// tolerable conflict apart from any other failure.
    pub conflict: bool,
    pub rev: Option<Revision>,
}

/// Filter applied to a live changes subscription.
#[derive(Debug, Clone)]
pub enum ChangeFilter {
    All,
    /// Only documents whose `type` field equals the given tag.
    TypeEquals(&'static str),
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub id: DocId,
    pub doc: Option<Value>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Source,
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Bidirectional, checkpoint=target.
    Sync,
    /// Checkpoint=target, optional `replicate/pull` filter.
    PullOnly,
    /// Optional `replicate/push` filter.
    PushOnly,
}

#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    pub mode: ReplicationMode,
    pub live: bool,
    pub retry: bool,
    pub batch_size: u32,
    pub batches_limit: u32,
    pub heartbeat_ms: Option<u64>,
    pub push_checkpoint: Checkpoint,
    pub pull_checkpoint: Checkpoint,
    pub push_filter: Option<String>,
    pub pull_filter: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    Active,
    Change { direction: Direction, docs: Vec<Value> },
    Paused,
    Complete,
    Denied(String),
    Error(String),
}

/// A running (or completed) replication. The coordinator drains
/// [`ReplicationHandle::events`] and may [`ReplicationHandle::cancel`] it.
pub trait ReplicationHandle: Send {
    fn events(&self) -> &Receiver<ReplicationEvent>;
    fn cancel(&self);
}

/// The document database primitive the core consumes through an abstract
/// handle (`get, put, bulkDocs, allDocs, changes, replicate, sync, info,
/// destroy, close`).
#[async_trait]
pub trait Database: Send + Sync {
    async fn get(&self, id: &str) -> Result<Value>;
    async fn put(&self, id: &str, doc: Value, force: bool) -> Result<PutResult>;
    async fn bulk_docs(&self, docs: Vec<Value>) -> Result<Vec<BulkResult>>;
    async fn all_docs(&self, opts: AllDocsOptions) -> Result<Vec<AllDocsRow>>;
    /// Live changes subscription; unsubscribing is done by dropping the
    /// receiver (mirrors `removeAllListeners` + `cancel` on the JS side).
    fn subscribe_changes(&self, filter: ChangeFilter) -> Receiver<ChangeEvent>;
    fn replicate(
        &self,
        remote: Arc<dyn Database>,
        opts: ReplicationOptions,
    ) -> Box<dyn ReplicationHandle>;
    async fn info(&self) -> Result<DbInfo>;
    async fn destroy(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct LocalDatabaseOptions {
    pub revs_limit: Option<u32>,
    pub deterministic_revs: bool,
    pub auto_compaction: bool,
    pub skip_setup: bool,
}

/// `createLocalDatabase(name, opts)`.
pub trait LocalDatabaseFactory: Send + Sync {
    fn create(&self, name: &str, opts: LocalDatabaseOptions) -> Result<Arc<dyn Database>>;
}

/// Path<->id bijection; left abstract since mapping a filesystem path to a
/// document id is host-application policy, not this crate's concern.
pub trait PathMapper: Send + Sync {
    fn path_to_id(&self, path: &str) -> DocId;
    fn id_to_path(&self, id: &str) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct RemoteAuth {
    pub username: String,
    pub password: String,
}

/// `connectRemote(uri, auth, disableRequestURI, passphraseOrFalse)`.
pub trait RemoteConnector: Send + Sync {
    fn connect(
        &self,
        uri: &str,
        auth: &RemoteAuth,
        disable_request_uri: bool,
        passphrase: Option<&str>,
    ) -> Result<Arc<dyn Database>>;
}

/// `enableEncryption(db, passphrase, legacyFlag)`.
pub trait EncryptionHook: Send + Sync {
    fn enable_encryption(&self, db: &dyn Database, passphrase: &str, legacy: bool) -> Result<()>;
}

/// `checkRemoteVersion` / `putDesignDocuments`.
pub trait SchemaHooks: Send + Sync {
    fn check_remote_version(&self, db: &dyn Database, expected_version: i32) -> Result<bool>;
    fn put_design_documents(&self, db: &dyn Database) -> Result<()>;
}

/// `getLastPostFailedBySize()` — transport-layer signal consumed by the
/// replication coordinator's adaptive backoff.
pub trait TransportSignals: Send + Sync {
    fn get_last_post_failed_by_size(&self) -> bool;
}

/// The capability record passed to the engine constructor, gathering every
/// abstract collaborator the core depends on.
#[derive(Clone)]
pub struct Hooks {
    pub local_factory: Arc<dyn LocalDatabaseFactory>,
    pub paths: Arc<dyn PathMapper>,
    pub remote: Arc<dyn RemoteConnector>,
    pub encryption: Arc<dyn EncryptionHook>,
    pub schema: Arc<dyn SchemaHooks>,
    pub transport: Arc<dyn TransportSignals>,
}
