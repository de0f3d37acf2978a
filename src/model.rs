//! The data model: every document kind sharing the single id-keyed
//! namespace, modeled as a tagged sum type.
//!
//! Reads must tolerate an unknown variant for forward compatibility; see
//! [`Document::kind_tag`] and the `#[serde(other)]` fallback on
//! [`NoteType`].

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::ids::LeafId;

/// Discriminator for the three note document flavors the assembler
/// understands, plus the legacy flat form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteType {
    Plain,
    Newnote,
    /// Legacy flat form: inline `data`, no `children`. Read, never written.
    Notes,
}

/// A single immutable, content-addressed chunk of a note's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    pub id: LeafId,
    #[serde(rename = "type")]
    pub kind: LeafTag,
    pub data: String,
}

/// Marker so a leaf document's `type` field round-trips as the literal
/// string `"leaf"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeafTag {
    Leaf,
}

/// Metadata form of a note: everything except the materialized payload.
/// `data` is reconstituted separately by the assembler and is
/// therefore not a field here — [`Entry`] carries both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteMeta {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NoteType,
    pub ctime: i64,
    pub mtime: i64,
    pub size: u64,
    /// Ordered leaf ids; concatenating their `data` reconstitutes the
    /// payload. Empty (and meaningless) for the legacy `"notes"` form.
    #[serde(default)]
    pub children: Vec<LeafId>,
    /// Inline payload carried only by the legacy `"notes"` form, stored
    /// under the same `data` key the flat legacy document used.
    #[serde(default, rename = "data")]
    pub inline_data: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    pub rev: Option<String>,
}

impl NoteMeta {
    pub fn is_leafless_legacy(&self) -> bool {
        matches!(self.kind, NoteType::Notes)
    }
}

/// A fully materialized note: metadata plus the concatenated payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub meta: NoteMeta,
    pub data: String,
}

/// A note as supplied by a caller of `putEntry`, before chunking.
#[derive(Debug, Clone)]
pub struct NewNote {
    pub id: String,
    pub data: String,
    pub ctime: i64,
    pub mtime: i64,
}

/// Singleton node-info document, created on first bootstrap of a local
/// database generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub nodeid: String,
    #[serde(rename = "v20220607")]
    pub v20220607: bool,
}

/// Per-node advertised chunk-format version range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkVersionRange {
    pub min: i32,
    pub max: i32,
    pub current: i32,
}

/// Singleton milestone document, stored on the remote, advertising each
/// node's supported chunk-format version range and lock state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub created: i64,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub accepted_nodes: BTreeSet<String>,
    #[serde(default)]
    pub node_chunk_info: HashMap<String, ChunkVersionRange>,
}

impl Milestone {
    pub fn default_at(now: i64) -> Self {
        Self {
            created: now,
            locked: false,
            accepted_nodes: BTreeSet::new(),
            node_chunk_info: HashMap::new(),
        }
    }
}
