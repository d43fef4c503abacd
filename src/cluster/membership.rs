use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::core::NodeId;

/// Heartbeat record for one peer. For the local node the heartbeat is
/// strictly increasing while the node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEntry {
    pub heartbeat: u64,
    pub last_updated_ms: i64,
}

/// Snapshot exchanged by the gossip protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    pub sender: NodeId,
    pub membership: HashMap<NodeId, MembershipEntry>,
    pub failed: HashSet<NodeId>,
}

/// A peer's lifecycle as seen from this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unknown,
    Live,
    /// No heartbeat refresh for at least one gossip interval, but the failure
    /// threshold has not expired yet.
    Suspect,
    Failed,
}

/// Ring/membership changes produced by a gossip exchange, so the caller can
/// mirror them onto the hash ring.
#[derive(Debug, Default)]
pub struct MembershipDelta {
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

impl MembershipDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Local membership view: heartbeat table plus the set of nodes whose failure
/// this node has observed (propagated via gossip so failures spread even to
/// peers the failed node never gossiped with).
#[derive(Debug, Default)]
pub struct MembershipTable {
    entries: HashMap<NodeId, MembershipEntry>,
    known_failed: HashSet<NodeId>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node_id: &str, now_ms: i64) {
        self.entries.entry(node_id.to_string()).or_insert(MembershipEntry {
            heartbeat: 0,
            last_updated_ms: now_ms,
        });
    }

    /// Take over a peer entry learned out-of-band (the join handshake),
    /// stamping it with local time.
    pub fn adopt(&mut self, node_id: &str, heartbeat: u64, now_ms: i64) {
        self.entries.insert(
            node_id.to_string(),
            MembershipEntry {
                heartbeat,
                last_updated_ms: now_ms,
            },
        );
    }

    /// Advance the local node's own heartbeat.
    pub fn beat(&mut self, self_id: &str, now_ms: i64) {
        let entry = self.entries.entry(self_id.to_string()).or_insert(MembershipEntry {
            heartbeat: 0,
            last_updated_ms: now_ms,
        });
        entry.heartbeat += 1;
        entry.last_updated_ms = now_ms;
    }

    pub fn snapshot(&self) -> HashMap<NodeId, MembershipEntry> {
        self.entries.clone()
    }

    pub fn known_failed(&self) -> HashSet<NodeId> {
        self.known_failed.clone()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.entries.keys().cloned().collect()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.entries.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, node_id: &str) -> Option<MembershipEntry> {
        self.entries.get(node_id).copied()
    }

    /// Forget a previously observed failure. Called when the peer re-joins
    /// through the explicit join handshake.
    pub fn clear_failed(&mut self, node_id: &str) {
        if self.known_failed.remove(node_id) {
            info!(node_id, "cleared failure record for rejoining node");
        }
    }

    /// Merge a gossip snapshot into the local view, returning the node ids
    /// that must be added to or removed from the hash ring.
    pub fn apply_snapshot(
        &mut self,
        self_id: &str,
        message: &GossipMessage,
        now_ms: i64,
    ) -> MembershipDelta {
        let mut delta = MembershipDelta::default();

        // A failed node is dead to us until it explicitly re-joins; ignore
        // anything it still manages to send.
        if self.known_failed.contains(&message.sender) {
            debug!(sender = %message.sender, "ignoring gossip from failed node");
            return delta;
        }

        // Failures observed elsewhere in the cluster.
        for failed in &message.failed {
            if failed == self_id {
                continue;
            }
            if self.entries.remove(failed).is_some() {
                info!(
                    node_id = %failed,
                    reported_by = %message.sender,
                    "removing node from membership due to reported failure"
                );
                delta.removed.push(failed.clone());
            }
            self.known_failed.insert(failed.clone());
        }

        // The sender itself: take the max heartbeat and refresh its entry.
        let sender_heartbeat = message
            .membership
            .get(&message.sender)
            .map(|entry| entry.heartbeat)
            .unwrap_or(0);
        match self.entries.get_mut(&message.sender) {
            Some(local) => {
                if sender_heartbeat > local.heartbeat {
                    local.heartbeat = sender_heartbeat;
                }
                local.last_updated_ms = now_ms;
            }
            None => {
                self.entries.insert(
                    message.sender.clone(),
                    MembershipEntry {
                        heartbeat: sender_heartbeat,
                        last_updated_ms: now_ms,
                    },
                );
                delta.added.push(message.sender.clone());
            }
        }

        // Everything else in the snapshot.
        for (node_id, remote) in &message.membership {
            if node_id == self_id || node_id == &message.sender {
                continue;
            }
            if self.known_failed.contains(node_id) {
                continue;
            }
            match self.entries.get_mut(node_id) {
                Some(local) => {
                    if remote.heartbeat > local.heartbeat {
                        local.heartbeat = remote.heartbeat;
                        local.last_updated_ms = now_ms;
                    }
                }
                None => {
                    self.entries.insert(
                        node_id.clone(),
                        MembershipEntry {
                            heartbeat: remote.heartbeat,
                            last_updated_ms: now_ms,
                        },
                    );
                    delta.added.push(node_id.clone());
                }
            }
        }

        delta
    }

    /// Remove every non-self peer whose entry is older than the failure
    /// threshold, recording it in `known_failed` for propagation. Returns the
    /// ids that were expired.
    pub fn sweep_failures(
        &mut self,
        self_id: &str,
        now_ms: i64,
        failure_threshold_ms: i64,
    ) -> Vec<NodeId> {
        let expired: Vec<NodeId> = self
            .entries
            .iter()
            .filter(|(node_id, entry)| {
                node_id.as_str() != self_id
                    && now_ms - entry.last_updated_ms > failure_threshold_ms
            })
            .map(|(node_id, _)| node_id.clone())
            .collect();

        for node_id in &expired {
            self.entries.remove(node_id);
            self.known_failed.insert(node_id.clone());
            info!(node_id = %node_id, "node detected as failed and removed from membership");
        }
        expired
    }

    pub fn peer_state(
        &self,
        node_id: &str,
        now_ms: i64,
        gossip_interval_ms: i64,
        failure_threshold_ms: i64,
    ) -> PeerState {
        if self.known_failed.contains(node_id) {
            return PeerState::Failed;
        }
        let Some(entry) = self.entries.get(node_id) else {
            return PeerState::Unknown;
        };
        let age_ms = now_ms - entry.last_updated_ms;
        if age_ms > failure_threshold_ms {
            PeerState::Failed
        } else if age_ms > gossip_interval_ms {
            PeerState::Suspect
        } else {
            PeerState::Live
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender: &str, entries: &[(&str, u64)], failed: &[&str]) -> GossipMessage {
        GossipMessage {
            sender: sender.to_string(),
            membership: entries
                .iter()
                .map(|(id, heartbeat)| {
                    (
                        id.to_string(),
                        MembershipEntry {
                            heartbeat: *heartbeat,
                            last_updated_ms: 0,
                        },
                    )
                })
                .collect(),
            failed: failed.iter().map(|id| id.to_string()).collect(),
        }
    }

    #[test]
    fn beat_strictly_increases() {
        let mut table = MembershipTable::new();
        table.beat("a", 10);
        table.beat("a", 20);
        assert_eq!(table.entry("a").unwrap().heartbeat, 2);
        assert_eq!(table.entry("a").unwrap().last_updated_ms, 20);
    }

    #[test]
    fn snapshot_adds_unknown_nodes() {
        let mut table = MembershipTable::new();
        table.beat("a", 0);

        let delta = table.apply_snapshot("a", &message("b", &[("b", 3), ("c", 1)], &[]), 100);
        let mut added = delta.added.clone();
        added.sort();
        assert_eq!(added, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(table.entry("b").unwrap().heartbeat, 3);
        assert_eq!(table.entry("c").unwrap().heartbeat, 1);
    }

    #[test]
    fn snapshot_takes_max_heartbeat() {
        let mut table = MembershipTable::new();
        table.beat("a", 0);
        table.apply_snapshot("a", &message("b", &[("b", 5)], &[]), 100);

        // An older heartbeat must not regress the entry.
        table.apply_snapshot("a", &message("b", &[("b", 2)], &[]), 200);
        let entry = table.entry("b").unwrap();
        assert_eq!(entry.heartbeat, 5);
        assert_eq!(entry.last_updated_ms, 200);
    }

    #[test]
    fn reported_failures_are_removed_and_propagated() {
        let mut table = MembershipTable::new();
        table.beat("a", 0);
        table.apply_snapshot("a", &message("b", &[("b", 1), ("c", 1)], &[]), 0);

        let delta = table.apply_snapshot("a", &message("b", &[("b", 2)], &["c"]), 100);
        assert_eq!(delta.removed, vec!["c".to_string()]);
        assert!(!table.contains("c"));
        assert!(table.known_failed().contains("c"));

        // A later snapshot that still lists "c" must not resurrect it.
        let delta = table.apply_snapshot("a", &message("b", &[("b", 3), ("c", 9)], &[]), 200);
        assert!(delta.is_empty());
        assert!(!table.contains("c"));
    }

    #[test]
    fn gossip_from_failed_node_is_ignored() {
        let mut table = MembershipTable::new();
        table.beat("a", 0);
        table.apply_snapshot("a", &message("b", &[("b", 1)], &["c"]), 0);

        let delta = table.apply_snapshot("a", &message("c", &[("c", 50)], &[]), 100);
        assert!(delta.is_empty());
        assert!(!table.contains("c"));
    }

    #[test]
    fn sweep_expires_stale_entries() {
        let mut table = MembershipTable::new();
        table.beat("a", 0);
        table.apply_snapshot("a", &message("b", &[("b", 1)], &[]), 0);

        assert!(table.sweep_failures("a", 1_000, 2_000).is_empty());
        let expired = table.sweep_failures("a", 3_000, 2_000);
        assert_eq!(expired, vec!["b".to_string()]);
        assert!(table.known_failed().contains("b"));
        // Self is never expired.
        assert!(table.contains("a"));
    }

    #[test]
    fn peer_state_transitions() {
        let mut table = MembershipTable::new();
        table.beat("a", 0);
        table.apply_snapshot("a", &message("b", &[("b", 1)], &[]), 0);

        assert_eq!(table.peer_state("x", 0, 300, 2_000), PeerState::Unknown);
        assert_eq!(table.peer_state("b", 100, 300, 2_000), PeerState::Live);
        assert_eq!(table.peer_state("b", 900, 300, 2_000), PeerState::Suspect);
        assert_eq!(table.peer_state("b", 2_500, 300, 2_000), PeerState::Failed);

        table.sweep_failures("a", 2_500, 2_000);
        assert_eq!(table.peer_state("b", 2_600, 300, 2_000), PeerState::Failed);
        table.clear_failed("b");
        assert_eq!(table.peer_state("b", 2_600, 300, 2_000), PeerState::Unknown);
    }
}
