//! Document id conventions: the two persisted singletons and the leaf id
//! format (`"h:" + hash [+ collision suffix]`).

use std::fmt;

use rand::Rng;

/// Singleton id of the node-info document, created once per local database
/// generation.
pub const NODEINFO_DOCID: &str = "_local/nodeinfo";

/// Singleton id of the milestone document, stored on the remote.
pub const MILSTONE_DOCID: &str = "_local/obsidian_livesync_milestone";

/// Prefix shared by every leaf document id.
pub const LEAF_PREFIX: &str = "h:";

/// A leaf's id: `"h:" + hashPrefix + collisionSuffix`, or `"h:+" +
/// hexXorHash + collisionSuffix` when the store is encrypting content (the
/// leading `+` after the `h:` prefix marks an encrypted hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct LeafId(pub String);

impl LeafId {
    /// Build the base id (collision suffix `0`, i.e. no suffix at all) for
    /// a given hex digest. `encrypted` selects the `"h:+"` variant.
    pub fn base(hex_digest: &str, encrypted: bool) -> LeafBaseId {
        LeafBaseId {
            hex_digest: hex_digest.to_owned(),
            encrypted,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeafId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A leaf id without its collision suffix yet resolved; [`LeafBaseId::candidate`]
/// produces the `q`-th id to probe for collision resolution.
#[derive(Debug, Clone)]
pub struct LeafBaseId {
    hex_digest: String,
    encrypted: bool,
}

impl LeafBaseId {
    pub fn candidate(&self, q: u32) -> LeafId {
        let sign = if self.encrypted { "+" } else { "" };
        let suffix = if q == 0 {
            String::new()
        } else {
            q.to_string()
        };
        LeafId(format!("{LEAF_PREFIX}{sign}{}{}", self.hex_digest, suffix))
    }
}

/// Returns true if `id` is a leaf id (used to exclude leaves from prefix
/// deletion and `allDocs` scans).
pub fn is_leaf_id(id: &str) -> bool {
    id.starts_with(LEAF_PREFIX)
}

const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A fresh, random 10-character base-36 node identifier, generated on first
/// bootstrap of a local database generation.
pub fn generate_nodeid() -> String {
    let mut rng = rand::thread_rng();
    (0..10)
        .map(|_| {
            let idx = rng.gen_range(0..BASE36_ALPHABET.len());
            BASE36_ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_zero_has_no_suffix() {
        let base = LeafId::base("deadbeef", false);
        assert_eq!(base.candidate(0).as_str(), "h:deadbeef");
        assert_eq!(base.candidate(1).as_str(), "h:deadbeef1");
        assert_eq!(base.candidate(2).as_str(), "h:deadbeef2");
    }

    #[test]
    fn encrypted_candidate_uses_plus_sign() {
        let base = LeafId::base("cafef00d", true);
        assert_eq!(base.candidate(0).as_str(), "h:+cafef00d");
    }

    #[test]
    fn nodeid_is_ten_base36_chars() {
        let id = generate_nodeid();
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() && c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn leaf_id_detection() {
        assert!(is_leaf_id("h:deadbeef"));
        assert!(!is_leaf_id("a.md"));
    }
}
