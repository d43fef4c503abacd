use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::core::NodeId;

/// Causal relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    Before,
    After,
    Equal,
    Concurrent,
}

/// Per-node counters used to order events across the cluster. The clock is
/// the client-visible `context`: callers cache it from reads and echo it back
/// on writes to preserve causality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    clocks: HashMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    pub fn counter(&self, node_id: &str) -> u64 {
        self.clocks.get(node_id).copied().unwrap_or(0)
    }

    pub fn entries(&self) -> &HashMap<NodeId, u64> {
        &self.clocks
    }

    pub fn increment(&mut self, node_id: &str) {
        *self.clocks.entry(node_id.to_string()).or_insert(0) += 1;
    }

    /// Take the pointwise maximum of both clocks.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node_id, counter) in &other.clocks {
            let current = self.clocks.entry(node_id.clone()).or_insert(0);
            *current = (*current).max(*counter);
        }
    }

    pub fn compare(&self, other: &VectorClock) -> Causality {
        let mut self_greater = false;
        let mut other_greater = false;

        let mut all_nodes: HashSet<&NodeId> = self.clocks.keys().collect();
        all_nodes.extend(other.clocks.keys());

        for node_id in all_nodes {
            let self_counter = self.counter(node_id);
            let other_counter = other.counter(node_id);
            if self_counter > other_counter {
                self_greater = true;
            } else if other_counter > self_counter {
                other_greater = true;
            }
        }

        match (self_greater, other_greater) {
            (true, false) => Causality::After,
            (false, true) => Causality::Before,
            (false, false) => Causality::Equal,
            (true, true) => Causality::Concurrent,
        }
    }
}

impl<const N: usize> From<[(&str, u64); N]> for VectorClock {
    fn from(entries: [(&str, u64); N]) -> Self {
        Self {
            clocks: entries
                .into_iter()
                .map(|(node, counter)| (node.to_string(), counter))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_and_counter() {
        let mut clock = VectorClock::new();
        assert_eq!(clock.counter("n1"), 0);
        clock.increment("n1");
        clock.increment("n1");
        assert_eq!(clock.counter("n1"), 2);
    }

    #[test]
    fn concurrent_clocks_detected() {
        let a = VectorClock::from([("n1", 1)]);
        let b = VectorClock::from([("n2", 1)]);
        assert_eq!(a.compare(&b), Causality::Concurrent);

        let mut merged = a.clone();
        merged.merge(&b);
        assert_eq!(merged, VectorClock::from([("n1", 1), ("n2", 1)]));
    }

    #[test]
    fn compare_is_antisymmetric() {
        let a = VectorClock::from([("n1", 1)]);
        let b = VectorClock::from([("n1", 2), ("n2", 1)]);
        assert_eq!(a.compare(&b), Causality::Before);
        assert_eq!(b.compare(&a), Causality::After);
    }

    #[test]
    fn equal_is_distinct_from_concurrent() {
        let a = VectorClock::from([("n1", 3), ("n2", 1)]);
        let b = a.clone();
        assert_eq!(a.compare(&b), Causality::Equal);
    }

    #[test]
    fn missing_entries_read_as_zero() {
        let a = VectorClock::from([("n1", 1), ("n2", 1)]);
        let b = VectorClock::from([("n1", 1)]);
        assert_eq!(a.compare(&b), Causality::After);
    }

    #[test]
    fn merge_is_idempotent_and_associative() {
        let a = VectorClock::from([("n1", 2), ("n2", 1)]);
        let b = VectorClock::from([("n2", 3)]);
        let c = VectorClock::from([("n3", 1)]);

        let mut self_merge = a.clone();
        self_merge.merge(&a);
        assert_eq!(self_merge, a);

        let mut left = a.clone();
        left.merge(&b);
        left.merge(&c);

        let mut bc = b.clone();
        bc.merge(&c);
        let mut right = a.clone();
        right.merge(&bc);

        assert_eq!(left, right);
    }
}
