//! Milestone negotiator.
//!
//! Cross-node chunk-format version range intersection and lock
//! enforcement, driven by the remote's singleton milestone document.

use std::sync::Arc;

use serde_json::json;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::ids::MILSTONE_DOCID;
use crate::model::{ChunkVersionRange, Milestone};

#[derive(Debug, Clone, Copy)]
pub struct VersionRange {
    pub min: i32,
    pub max: i32,
    pub current: i32,
}

/// Outcome of a connection-check: the negotiated global range, mirrored
/// back for diagnostics, plus whether this node was rejected as locked-out.
#[derive(Debug, Clone, Copy)]
pub struct NegotiationOutcome {
    pub global_min: i32,
    pub global_max: i32,
}

/// Stateless apart from this node's own identity: every method takes the
/// remote database handle to negotiate against, since a node may connect
/// to a different remote across calls (`tryCreateRemoteDatabase`,
/// `openReplication`, …) while keeping one negotiator for its lifetime.
pub struct MilestoneNegotiator {
    nodeid: String,
}

impl MilestoneNegotiator {
    pub fn new(nodeid: String) -> Self {
        Self { nodeid }
    }

    async fn fetch_or_default(&self, remote: &Arc<dyn Database>, now: i64) -> Result<Milestone> {
        match remote.get(MILSTONE_DOCID).await {
            Ok(doc) => serde_json::from_value(doc).map_err(|e| Error::Unclassified(e.to_string())),
            Err(Error::NotFound(_)) => Ok(Milestone::default_at(now)),
            Err(e) => Err(e),
        }
    }

    async fn write(&self, remote: &Arc<dyn Database>, milestone: &Milestone) -> Result<()> {
        remote.put(MILSTONE_DOCID, json!(milestone), true).await?;
        Ok(())
    }

    /// Runs a full connection-check: fetch-or-default, merge in this
    /// node's current range, recompute the global intersection, and fail
    /// in order — version check before the lock check.
    pub async fn check(
        &self,
        remote: &Arc<dyn Database>,
        local: VersionRange,
        ignore_version_check: bool,
        now: i64,
    ) -> Result<NegotiationOutcome> {
        let mut milestone = self.fetch_or_default(remote, now).await?;

        let needs_update = match milestone.node_chunk_info.get(&self.nodeid) {
            Some(existing) => existing.min != local.min || existing.max != local.max,
            None => true,
        };
        if needs_update {
            milestone.node_chunk_info.insert(
                self.nodeid.clone(),
                ChunkVersionRange {
                    min: local.min,
                    max: local.max,
                    current: local.current,
                },
            );
            self.write(remote, &milestone).await?;
        }

        let outcome = global_range(&milestone);

        if local.current >= 0 && !ignore_version_check {
            if local.current < outcome.global_min || local.current > outcome.global_max {
                return Err(Error::VersionIncompatible {
                    current: local.current,
                    min: outcome.global_min,
                    max: outcome.global_max,
                });
            }
        }

        if milestone.locked && !milestone.accepted_nodes.contains(&self.nodeid) {
            return Err(Error::RemoteLockedAndDeviceNotAccepted);
        }

        Ok(outcome)
    }

    /// `markLocked(flag)` — explicitly writes the milestone; locking
    /// replaces `accepted_nodes` with just this node.
    pub async fn mark_locked(&self, remote: &Arc<dyn Database>, locked: bool, now: i64) -> Result<()> {
        let mut milestone = self.fetch_or_default(remote, now).await?;
        milestone.locked = locked;
        if locked {
            milestone.accepted_nodes.clear();
            milestone.accepted_nodes.insert(self.nodeid.clone());
        }
        self.write(remote, &milestone).await
    }

    /// `markResolved()` — adds this node to `accepted_nodes`.
    pub async fn mark_resolved(&self, remote: &Arc<dyn Database>, now: i64) -> Result<()> {
        let mut milestone = self.fetch_or_default(remote, now).await?;
        milestone.accepted_nodes.insert(self.nodeid.clone());
        self.write(remote, &milestone).await
    }
}

/// `globalMin = max over accepted_nodes of node.min`, `globalMax = min over
/// accepted_nodes of node.max`; nodes absent from `node_chunk_info` force
/// both to 0.
fn global_range(milestone: &Milestone) -> NegotiationOutcome {
    if milestone.accepted_nodes.is_empty() {
        // No accepted nodes yet (first-ever connection): fall back to this
        // milestone's advertised node ranges as a whole, so a brand new
        // fleet can still negotiate a sane range instead of 0/0.
        let mut global_min = i32::MIN;
        let mut global_max = i32::MAX;
        if milestone.node_chunk_info.is_empty() {
            return NegotiationOutcome { global_min: 0, global_max: 0 };
        }
        for range in milestone.node_chunk_info.values() {
            global_min = global_min.max(range.min);
            global_max = global_max.min(range.max);
        }
        return NegotiationOutcome { global_min, global_max };
    }

    let mut global_min = i32::MIN;
    let mut global_max = i32::MAX;
    for node in &milestone.accepted_nodes {
        match milestone.node_chunk_info.get(node) {
            Some(range) => {
                global_min = global_min.max(range.min);
                global_max = global_max.min(range.max);
            }
            None => {
                global_min = 0;
                global_max = 0;
                break;
            }
        }
    }
    NegotiationOutcome { global_min, global_max }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn milestone_with(nodes: Vec<(&str, i32, i32)>, accepted: Vec<&str>) -> Milestone {
        let mut node_chunk_info = HashMap::new();
        for (id, min, max) in nodes {
            node_chunk_info.insert(id.to_owned(), ChunkVersionRange { min, max, current: max });
        }
        Milestone {
            created: 0,
            locked: false,
            accepted_nodes: accepted.into_iter().map(String::from).collect(),
            node_chunk_info,
        }
    }

    #[test]
    fn global_range_is_intersection_of_accepted_nodes() {
        let m = milestone_with(vec![("a", 0, 4), ("b", 1, 3)], vec!["a", "b"]);
        let out = global_range(&m);
        assert_eq!(out.global_min, 1);
        assert_eq!(out.global_max, 3);
        assert!(out.global_max >= out.global_min);
    }

    #[test]
    fn accepted_node_absent_from_info_forces_zero() {
        let m = milestone_with(vec![("a", 0, 4)], vec!["a", "missing"]);
        let out = global_range(&m);
        assert_eq!((out.global_min, out.global_max), (0, 0));
    }

    #[test]
    fn no_accepted_nodes_falls_back_to_all_advertised_ranges() {
        let m = milestone_with(vec![("other", 3, 4)], vec![]);
        let out = global_range(&m);
        assert_eq!((out.global_min, out.global_max), (3, 4));
    }
}
