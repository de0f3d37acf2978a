//! Crate-wide error type.
//!
//! Only the error kinds enumerated in the design's "Error Handling Design"
//! section ever escape to a caller. `NotFound` and `Conflict` are absorbed
//! internally (see [`crate::assembler`] and [`crate::leaf_store`]) and never
//! constructed here except in the few call sites that must finally report
//! them upward (e.g. a `getEntry` on a document that was never written).

use thiserror::Error;

use crate::ids::LeafId;

/// Crate-wide result alias, mirroring the per-module `Result` aliases the
/// storage engine this crate grew from defines in each of its own
/// sub-modules.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The remote or local store signalled that a document does not exist.
    /// Most call sites absorb this into an `Option`/`bool` instead of
    /// propagating it; it is only public so that low-level helpers can
    /// report it to the layer that decides whether to absorb it.
    #[error("document not found: {0}")]
    NotFound(String),

    /// A note's `children` could not be fully resolved during a read.
    #[error("corrupted entry {id}: leaf {leaf} could not be resolved")]
    Corruption { id: String, leaf: LeafId },

    /// A bulk leaf write hit a per-item conflict (409). Tolerated silently
    /// by [`crate::leaf_store::LeafStore::put_leaf`] batches; surfaced here
    /// only for diagnostics.
    #[error("conflicting write for leaf {0}")]
    Conflict(LeafId),

    /// The transport layer rejected a batch as too large.
    #[error("batch rejected as too large (batch_size={batch_size}, batches_limit={batches_limit})")]
    SizeRejected { batch_size: u32, batches_limit: u32 },

    /// Replication gave up after reducing batch parameters to the floor.
    #[error("cannot replicate at any lower batch size, giving up")]
    CannotReplicateLower,

    /// This node's chunk-format version range does not intersect the
    /// fleet-wide accepted range.
    #[error("incompatible chunk version {current} outside accepted range [{min}, {max}]")]
    VersionIncompatible { current: i32, min: i32, max: i32 },

    /// The remote milestone is locked and this node is not an accepted node.
    #[error("remote database is locked and this device has not been accepted; rebuild or unlock required")]
    RemoteLockedAndDeviceNotAccepted,

    /// Migrating an old-generation database into the new generation failed.
    #[error("migration from the old generation database failed; drop it manually and retry")]
    MigrationFailure,

    /// A `waitForLeaf` call exceeded `LEAF_WAIT_TIMEOUT`.
    #[error("timed out waiting for leaf {0} to arrive")]
    LeafWaitTimeout(LeafId),

    /// Another replication is already running; the engine enforces a
    /// try-acquire singleton `syncHandler`.
    #[error("a replication is already in progress")]
    ReplicationBusy,

    /// A bootstrap/migration is in progress; the engine must not be
    /// considered "ready" concurrently with it.
    #[error("engine is not ready: bootstrap/migration in progress or failed")]
    NotReady,

    /// Errors from the abstract database/remote collaborators that this
    /// crate does not otherwise classify. Logged at `warn` and propagated
    /// verbatim to the caller of the current operation.
    #[error("unclassified backend error: {0}")]
    Unclassified(String),
}

impl Error {
    /// True for the handful of kinds that local recovery absorbs rather
    /// than ever handing to a caller. Used by call sites that want to
    /// assert they never leak an absorbed kind.
    pub fn is_locally_recoverable(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::Conflict(_))
    }
}
