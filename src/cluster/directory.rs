use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::cluster::membership::{GossipMessage, MembershipEntry};
use crate::cluster::vector_clock::VectorClock;
use crate::cluster::versioned_store::{StoreRead, VersionedValue};
use crate::core::NodeId;
use crate::error::AppResult;

/// A read as seen by clients: either a clean value or the full sibling list
/// when concurrent writes were never reconciled. The context is echoed back
/// on the next put to preserve causality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReadValue {
    Single(Value),
    Conflict(Vec<Value>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRead {
    pub value: ReadValue,
    pub context: VectorClock,
}

impl ClientRead {
    pub fn is_conflict(&self) -> bool {
        matches!(self.value, ReadValue::Conflict(_))
    }

    pub fn values(&self) -> Vec<&Value> {
        match &self.value {
            ReadValue::Single(value) => vec![value],
            ReadValue::Conflict(values) => values.iter().collect(),
        }
    }
}

/// Peer contract between nodes. `put`/`get`/`delete` are the coordinator
/// operations clients call; the `replica_*` family applies to the local store
/// only and is what coordinators call on each other.
#[async_trait]
pub trait NodeRpc: Send + Sync + fmt::Debug {
    fn node_id(&self) -> &str;
    fn is_running(&self) -> bool;

    async fn put(&self, key: &str, value: Value, context: Option<VectorClock>) -> AppResult<()>;
    async fn get(&self, key: &str) -> AppResult<Option<ClientRead>>;
    async fn delete(&self, key: &str) -> AppResult<bool>;
    async fn resolve(&self, key: &str, value: Value) -> AppResult<VectorClock>;

    async fn replica_put(&self, key: &str, version: VersionedValue) -> AppResult<VectorClock>;
    async fn replica_get(&self, key: &str) -> AppResult<Option<StoreRead>>;
    async fn replica_delete(&self, key: &str) -> AppResult<bool>;

    async fn receive_gossip(&self, message: GossipMessage) -> AppResult<()>;
    async fn ring_nodes(&self) -> AppResult<HashSet<NodeId>>;
    async fn membership_view(&self) -> AppResult<HashMap<NodeId, MembershipEntry>>;
    async fn node_joined(&self, node_id: &str) -> AppResult<()>;
}

/// Explicit registry of reachable peers, injected into every node. Peers are
/// discovered through membership plus this directory only. Pairs of nodes can
/// be partitioned from each other to exercise conflict paths.
#[derive(Debug, Default)]
pub struct NodeDirectory {
    nodes: RwLock<HashMap<NodeId, Arc<dyn NodeRpc>>>,
    blocked: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl NodeDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, node: Arc<dyn NodeRpc>) {
        let node_id = node.node_id().to_string();
        self.nodes.write().await.insert(node_id.clone(), node);
        info!(node_id, "registered node in directory");
    }

    pub async fn deregister(&self, node_id: &str) {
        if self.nodes.write().await.remove(node_id).is_some() {
            info!(node_id, "deregistered node from directory");
        }
    }

    /// Resolve a peer as seen from `caller`. Returns `None` when the target
    /// is unregistered or the pair is partitioned.
    pub async fn lookup_from(&self, caller: &str, target: &str) -> Option<Arc<dyn NodeRpc>> {
        if self
            .blocked
            .read()
            .await
            .contains(&(caller.to_string(), target.to_string()))
        {
            return None;
        }
        self.nodes.read().await.get(target).cloned()
    }

    pub async fn lookup(&self, target: &str) -> Option<Arc<dyn NodeRpc>> {
        self.nodes.read().await.get(target).cloned()
    }

    pub async fn ids(&self) -> Vec<NodeId> {
        self.nodes.read().await.keys().cloned().collect()
    }

    /// Sever the link between two nodes in both directions.
    pub async fn partition(&self, a: &str, b: &str) {
        let mut blocked = self.blocked.write().await;
        blocked.insert((a.to_string(), b.to_string()));
        blocked.insert((b.to_string(), a.to_string()));
        warn!(a, b, "partitioned nodes");
    }

    pub async fn heal(&self, a: &str, b: &str) {
        let mut blocked = self.blocked.write().await;
        blocked.remove(&(a.to_string(), b.to_string()));
        blocked.remove(&(b.to_string(), a.to_string()));
        info!(a, b, "healed partition");
    }
}
