use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

use crate::core::NodeId;

/// Consistent hash ring mapping 128-bit positions to node ids, with a fixed
/// number of virtual nodes per physical node for distribution uniformity.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Virtual nodes per physical node.
    replicas: usize,
    /// Hash position -> physical node id.
    ring: BTreeMap<u128, NodeId>,
}

impl HashRing {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            ring: BTreeMap::new(),
        }
    }

    fn hash_key(key: &str) -> u128 {
        u128::from_be_bytes(md5::compute(key.as_bytes()).0)
    }

    pub fn add_node(&mut self, node_id: &str) {
        for i in 0..self.replicas {
            let virtual_key = format!("{}:{}", node_id, i);
            self.ring.insert(Self::hash_key(&virtual_key), node_id.to_string());
        }
        info!(node_id, replicas = self.replicas, "added node to hash ring");
    }

    pub fn remove_node(&mut self, node_id: &str) {
        self.ring.retain(|_, id| id != node_id);
        warn!(node_id, "removed node from hash ring");
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.ring.values().any(|id| id == node_id)
    }

    /// Unique physical nodes currently on the ring.
    pub fn nodes(&self) -> HashSet<NodeId> {
        self.ring.values().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Walk clockwise from the key's position, collecting up to `n` distinct
    /// physical nodes. Returns every node if fewer than `n` exist. The walk is
    /// a pure function of the key and ring content.
    pub fn locate(&self, key: &str, n: usize) -> Vec<NodeId> {
        if self.ring.is_empty() || n == 0 {
            return Vec::new();
        }

        let position = Self::hash_key(key);
        let mut replicas: Vec<NodeId> = Vec::with_capacity(n);
        for node_id in self
            .ring
            .range(position..)
            .chain(self.ring.range(..position))
            .map(|(_, id)| id)
        {
            if !replicas.iter().any(|existing| existing == node_id) {
                replicas.push(node_id.clone());
                if replicas.len() == n {
                    break;
                }
            }
        }
        replicas
    }
}
