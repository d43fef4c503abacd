use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cluster::vector_clock::{Causality, VectorClock};
use crate::core::{current_time_millis, NodeId};

/// One version of a key. A key holds a set of these; more than one means the
/// versions were written concurrently and the conflict is surfaced to readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Value,
    pub clock: VectorClock,
    pub timestamp: i64,
}

impl VersionedValue {
    pub fn new(value: Value, clock: VectorClock) -> Self {
        Self {
            value,
            clock,
            timestamp: current_time_millis(),
        }
    }
}

/// Result of a local read: every sibling value, the clock of the most
/// recently written sibling, that sibling's wall-clock timestamp, and the
/// merge of every sibling's clock (what a resolution has to dominate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRead {
    pub values: Vec<Value>,
    pub context: VectorClock,
    pub newest_ts: i64,
    pub merged: VectorClock,
}

impl StoreRead {
    pub fn is_conflict(&self) -> bool {
        self.values.len() > 1
    }
}

/// Per-node local store keyed by string, holding concurrent versions
/// (siblings) under vector-clock control. Owned exclusively by its node; all
/// operations serialize on one lock.
#[derive(Debug)]
pub struct VersionedStore {
    node_id: NodeId,
    data: Mutex<HashMap<String, Vec<VersionedValue>>>,
}

impl VersionedStore {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            data: Mutex::new(HashMap::new()),
        }
    }

    /// Store a value. `context` is the caller's last-seen clock; the new
    /// version's clock is `context` advanced by this node. Returns the clock
    /// of the surviving write (the stale-write case returns the sibling that
    /// superseded it).
    pub async fn put(&self, key: &str, value: Value, context: Option<&VectorClock>) -> VectorClock {
        let mut clock = context.cloned().unwrap_or_default();
        clock.increment(&self.node_id);
        let version = VersionedValue::new(value, clock);
        self.apply_version(key, version).await
    }

    /// Apply a fully formed version as-is, without advancing the local clock.
    /// Replication uses this so every replica converges on the coordinator's
    /// clock instead of minting conflicting ones.
    pub async fn sync_version(&self, key: &str, version: VersionedValue) -> VectorClock {
        self.apply_version(key, version).await
    }

    async fn apply_version(&self, key: &str, version: VersionedValue) -> VectorClock {
        let mut data = self.data.lock().await;
        let siblings = data.entry(key.to_string()).or_default();
        let current = std::mem::take(siblings);

        let mut survivors: Vec<VersionedValue> = Vec::with_capacity(current.len() + 1);
        for existing in current {
            match version.clock.compare(&existing.clock) {
                // The new write supersedes this sibling.
                Causality::After => {}
                // The new write is stale; the existing version wins outright.
                Causality::Before => {
                    let context = existing.clock.clone();
                    *siblings = vec![existing];
                    return context;
                }
                Causality::Concurrent | Causality::Equal => survivors.push(existing),
            }
        }

        let context = version.clock.clone();
        survivors.push(version);
        *siblings = survivors;
        context
    }

    pub async fn get(&self, key: &str) -> Option<StoreRead> {
        let data = self.data.lock().await;
        let siblings = data.get(key).filter(|siblings| !siblings.is_empty())?;

        let newest = siblings
            .iter()
            .max_by_key(|version| version.timestamp)?;
        let mut merged = VectorClock::new();
        for version in siblings.iter() {
            merged.merge(&version.clock);
        }
        Some(StoreRead {
            values: siblings.iter().map(|version| version.value.clone()).collect(),
            context: newest.clock.clone(),
            newest_ts: newest.timestamp,
            merged,
        })
    }

    /// Remove the key outright. No tombstones: replication of deletes is the
    /// coordinator's problem, not the store's.
    pub async fn delete(&self, key: &str) -> bool {
        let mut data = self.data.lock().await;
        let removed = data.remove(key);
        if let Some(versions) = &removed {
            debug!(
                node_id = %self.node_id,
                key,
                versions = versions.len(),
                "deleted key from local store"
            );
        }
        removed.is_some()
    }

    /// Collapse a conflicted key to a single caller-chosen value whose clock
    /// merges every sibling's clock, advanced by this node.
    pub async fn resolve(&self, key: &str, value: Value) -> VectorClock {
        let mut data = self.data.lock().await;
        let siblings = data.entry(key.to_string()).or_default();

        let mut merged = VectorClock::new();
        for version in siblings.iter() {
            merged.merge(&version.clock);
        }
        merged.increment(&self.node_id);

        *siblings = vec![VersionedValue::new(value, merged.clone())];
        merged
    }

    pub async fn keys(&self) -> Vec<String> {
        self.data.lock().await.keys().cloned().collect()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.data.lock().await.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get_single_version() {
        let store = VersionedStore::new("n1");
        let clock = store.put("k", json!(1), None).await;
        assert_eq!(clock.counter("n1"), 1);

        let read = store.get("k").await.unwrap();
        assert!(!read.is_conflict());
        assert_eq!(read.values, vec![json!(1)]);
        assert_eq!(read.context, clock);
    }

    #[tokio::test]
    async fn causal_update_replaces_predecessor() {
        let store = VersionedStore::new("n1");
        let first = store.put("k", json!(1), None).await;
        store.put("k", json!(2), Some(&first)).await;

        let read = store.get("k").await.unwrap();
        assert_eq!(read.values, vec![json!(2)]);
    }

    #[tokio::test]
    async fn concurrent_writes_become_siblings() {
        let store = VersionedStore::new("n1");
        let base = store.put("k", json!(1), None).await;

        // Two writes from the same observed state on different nodes.
        let mut clock_a = base.clone();
        clock_a.increment("n2");
        store
            .sync_version("k", VersionedValue::new(json!(5), clock_a))
            .await;

        let mut clock_b = base.clone();
        clock_b.increment("n3");
        store
            .sync_version("k", VersionedValue::new(json!(10), clock_b))
            .await;

        let read = store.get("k").await.unwrap();
        assert!(read.is_conflict());
        assert_eq!(read.values.len(), 2);
        assert!(read.values.contains(&json!(5)));
        assert!(read.values.contains(&json!(10)));
    }

    #[tokio::test]
    async fn stale_write_is_discarded() {
        let store = VersionedStore::new("n1");
        let first = store.put("k", json!(1), None).await;
        let second = store.put("k", json!(2), Some(&first)).await;

        // Replay a version older than what the store already holds.
        let mut stale = VectorClock::new();
        stale.increment("n1");
        let returned = store
            .sync_version("k", VersionedValue::new(json!(0), stale))
            .await;

        assert_eq!(returned, second);
        let read = store.get("k").await.unwrap();
        assert_eq!(read.values, vec![json!(2)]);
    }

    #[tokio::test]
    async fn resolve_collapses_siblings_with_merged_clock() {
        let store = VersionedStore::new("n1");
        store
            .sync_version("k", VersionedValue::new(json!(5), VectorClock::from([("n2", 1)])))
            .await;
        store
            .sync_version("k", VersionedValue::new(json!(10), VectorClock::from([("n3", 1)])))
            .await;
        assert!(store.get("k").await.unwrap().is_conflict());

        let merged = store.resolve("k", json!(10)).await;
        assert_eq!(merged.counter("n2"), 1);
        assert_eq!(merged.counter("n3"), 1);
        assert_eq!(merged.counter("n1"), 1);

        let read = store.get("k").await.unwrap();
        assert!(!read.is_conflict());
        assert_eq!(read.values, vec![json!(10)]);
        assert_eq!(read.context, merged);
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let store = VersionedStore::new("n1");
        store.put("k", json!(1), None).await;
        assert!(store.delete("k").await);
        assert!(!store.delete("k").await);
        assert!(store.get("k").await.is_none());
    }
}
