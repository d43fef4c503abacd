// Cluster node: local versioned store, ring/membership views, quorum
// coordinator, and the gossip loop for failure detection.

use async_trait::async_trait;
use futures::future::join_all;
use lru::LruCache;
use rand::seq::IndexedRandom;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cluster::directory::{ClientRead, NodeDirectory, NodeRpc, ReadValue};
use crate::cluster::hash_ring::HashRing;
use crate::cluster::membership::{GossipMessage, MembershipEntry, MembershipTable, PeerState};
use crate::cluster::vector_clock::VectorClock;
use crate::cluster::versioned_store::{StoreRead, VersionedStore, VersionedValue};
use crate::config::ClusterConfig;
use crate::core::{current_time_millis, NodeId};
use crate::error::{AppError, AppResult};

const ROUTE_CACHE_CAPACITY: usize = 10_000;

/// A server in the replicated key-value store. Owns its local store; shares
/// ring and membership views that gossip and join handlers keep current.
pub struct Node {
    node_id: NodeId,
    store: VersionedStore,
    ring: Arc<RwLock<HashRing>>,
    membership: Arc<RwLock<MembershipTable>>,
    directory: Arc<NodeDirectory>,
    config: ClusterConfig,
    running: Arc<AtomicBool>,
    /// Key -> responsible-node routing cache, cleared on any ring change.
    route_cache: Arc<Mutex<LruCache<String, Vec<NodeId>>>>,
    gossip_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id)
            .field("running", &self.is_running())
            .field("config", &self.config)
            .finish()
    }
}

impl Node {
    /// Create a standalone node (the first of a cluster) and register it in
    /// the directory.
    pub async fn new(
        node_id: impl Into<NodeId>,
        directory: Arc<NodeDirectory>,
        config: ClusterConfig,
    ) -> AppResult<Arc<Self>> {
        config.validate()?;
        let node_id = node_id.into();

        let mut ring = HashRing::new(config.ring_replicas);
        ring.add_node(&node_id);

        let mut membership = MembershipTable::new();
        membership.insert(&node_id, current_time_millis());

        let node = Arc::new(Self {
            node_id: node_id.clone(),
            store: VersionedStore::new(node_id.clone()),
            ring: Arc::new(RwLock::new(ring)),
            membership: Arc::new(RwLock::new(membership)),
            directory: directory.clone(),
            config,
            running: Arc::new(AtomicBool::new(false)),
            route_cache: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(ROUTE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ))),
            gossip_task: Mutex::new(None),
        });
        directory.register(node.clone()).await;
        info!(node_id = %node.node_id, "node created");
        Ok(node)
    }

    /// Join an existing cluster through a coordinator: pull its ring and
    /// membership, insert ourselves into both, then announce the join.
    pub async fn join(
        node_id: impl Into<NodeId>,
        directory: Arc<NodeDirectory>,
        coordinator_id: &str,
        config: ClusterConfig,
    ) -> AppResult<Arc<Self>> {
        let node = Self::new(node_id, directory.clone(), config).await?;

        let coordinator = directory.lookup(coordinator_id).await.ok_or_else(|| {
            AppError::Transport(format!("coordinator {} is unreachable", coordinator_id))
        })?;
        let remote_ring = coordinator.ring_nodes().await?;
        let remote_membership = coordinator.membership_view().await?;

        {
            let mut ring = node.ring.write().await;
            for peer in &remote_ring {
                if peer != &node.node_id {
                    ring.add_node(peer);
                }
            }
        }
        {
            let now = current_time_millis();
            let mut membership = node.membership.write().await;
            for (peer, entry) in &remote_membership {
                if peer != &node.node_id {
                    membership.adopt(peer, entry.heartbeat, now);
                }
            }
        }
        node.clear_route_cache().await;

        coordinator.node_joined(&node.node_id).await?;
        info!(
            node_id = %node.node_id,
            coordinator = coordinator_id,
            peers = remote_ring.len(),
            "joined cluster"
        );
        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.node_id
    }

    /// Start the background gossip loop (heartbeats + failure detection).
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(node_id = %self.node_id, "node already running");
            return;
        }
        let context = GossipContext {
            node_id: self.node_id.clone(),
            ring: self.ring.clone(),
            membership: self.membership.clone(),
            directory: self.directory.clone(),
            route_cache: self.route_cache.clone(),
            config: self.config.clone(),
            running: self.running.clone(),
        };
        let handle = tokio::spawn(run_gossip_loop(context));
        *self.gossip_task.lock().await = Some(handle);
        info!(node_id = %self.node_id, "node started");
    }

    /// Stop the node. Peer calls start failing immediately, which is what
    /// lets the rest of the cluster detect the failure.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.gossip_task.lock().await.take() {
            handle.abort();
        }
        info!(node_id = %self.node_id, "node stopped");
    }

    async fn clear_route_cache(&self) {
        self.route_cache.lock().await.clear();
    }

    /// Ordered replica set for a key, through the routing cache.
    async fn responsible_for(&self, key: &str) -> Vec<NodeId> {
        if let Some(cached) = self.route_cache.lock().await.get(key) {
            return cached.clone();
        }
        let nodes = self.ring.read().await.locate(key, self.config.replication_n);
        self.route_cache
            .lock()
            .await
            .put(key.to_string(), nodes.clone());
        nodes
    }

    fn deadline(&self) -> Duration {
        Duration::from_millis(self.config.replication_timeout_ms)
    }

    async fn peer(&self, target: &str) -> AppResult<Arc<dyn NodeRpc>> {
        self.directory
            .lookup_from(&self.node_id, target)
            .await
            .ok_or_else(|| AppError::Transport(format!("node {} is unreachable", target)))
    }

    async fn call_replica_put(
        &self,
        target: &str,
        key: &str,
        version: VersionedValue,
    ) -> AppResult<VectorClock> {
        let peer = self.peer(target).await?;
        timeout(self.deadline(), peer.replica_put(key, version))
            .await
            .map_err(|_| AppError::Transport(format!("replica put to {} timed out", target)))?
    }

    async fn call_replica_get(&self, target: &str, key: &str) -> AppResult<Option<StoreRead>> {
        let peer = self.peer(target).await?;
        timeout(self.deadline(), peer.replica_get(key))
            .await
            .map_err(|_| AppError::Transport(format!("replica get from {} timed out", target)))?
    }

    async fn call_replica_delete(&self, target: &str, key: &str) -> AppResult<bool> {
        let peer = self.peer(target).await?;
        timeout(self.deadline(), peer.replica_delete(key))
            .await
            .map_err(|_| AppError::Transport(format!("replica delete on {} timed out", target)))?
    }

    /// Quorum write. Applies locally when this node is responsible, then
    /// replicates to the rest of the replica set; succeeds once W replicas
    /// hold the version. Forwards to the key's coordinator otherwise.
    pub async fn put(
        &self,
        key: &str,
        value: Value,
        context: Option<VectorClock>,
    ) -> AppResult<()> {
        let responsible = self.responsible_for(key).await;
        if responsible.is_empty() {
            return Err(AppError::NoResponsibleNodes(key.to_string()));
        }

        if !responsible.contains(&self.node_id) {
            let coordinator_id = responsible[0].clone();
            debug!(key, coordinator = %coordinator_id, "forwarding put to coordinator");
            let peer = self.peer(&coordinator_id).await?;
            return timeout(self.deadline(), peer.put(key, value, context))
                .await
                .map_err(|_| {
                    AppError::Transport(format!("forwarded put to {} timed out", coordinator_id))
                })?;
        }

        let new_clock = self.store.put(key, value.clone(), context.as_ref()).await;
        let version = VersionedValue::new(value, new_clock);
        let mut successful_writes = 1usize;

        let replications = responsible
            .iter()
            .filter(|peer| peer.as_str() != self.node_id)
            .map(|peer| self.call_replica_put(peer, key, version.clone()));
        for result in join_all(replications).await {
            match result {
                Ok(_) => successful_writes += 1,
                Err(err) => debug!(key, %err, "replica write failed"),
            }
        }

        if successful_writes >= self.config.write_quorum {
            Ok(())
        } else {
            warn!(
                key,
                achieved = successful_writes,
                required = self.config.write_quorum,
                "write quorum not reached"
            );
            Err(AppError::QuorumNotReached {
                required: self.config.write_quorum,
                achieved: successful_writes,
            })
        }
    }

    /// Quorum read. Gathers from every reachable responsible replica,
    /// flattens and deduplicates sibling values, and reports a conflict when
    /// more than one distinct value survives.
    pub async fn get(&self, key: &str) -> AppResult<Option<ClientRead>> {
        let responsible = self.responsible_for(key).await;
        if responsible.is_empty() {
            return Err(AppError::NoResponsibleNodes(key.to_string()));
        }

        let mut reads: Vec<StoreRead> = Vec::new();
        if responsible.contains(&self.node_id) {
            if let Some(read) = self.store.get(key).await {
                reads.push(read);
            }
        }

        let remote = responsible
            .iter()
            .filter(|peer| peer.as_str() != self.node_id)
            .map(|peer| self.call_replica_get(peer, key));
        for result in join_all(remote).await {
            match result {
                Ok(Some(read)) => reads.push(read),
                Ok(None) => {}
                Err(err) => debug!(key, %err, "replica read failed"),
            }
        }

        if reads.is_empty() {
            return Ok(None);
        }
        if reads.len() < self.config.read_quorum {
            warn!(
                key,
                achieved = reads.len(),
                required = self.config.read_quorum,
                "read quorum not met; returning gathered replicas"
            );
        }

        let mut values: Vec<Value> = Vec::new();
        for read in &reads {
            for value in &read.values {
                if !values.contains(value) {
                    values.push(value.clone());
                }
            }
        }
        let context = reads
            .iter()
            .max_by_key(|read| read.newest_ts)
            .map(|read| read.context.clone())
            .unwrap_or_default();

        let value = if values.len() == 1 {
            ReadValue::Single(values.remove(0))
        } else {
            ReadValue::Conflict(values)
        };
        Ok(Some(ClientRead { value, context }))
    }

    /// Delete on every responsible replica; succeeds if at least one replica
    /// held and removed the key. Clients follow with a verification read.
    pub async fn delete(&self, key: &str) -> AppResult<bool> {
        let responsible = self.responsible_for(key).await;
        if responsible.is_empty() {
            return Err(AppError::NoResponsibleNodes(key.to_string()));
        }

        let mut successful_deletes = 0usize;
        if responsible.contains(&self.node_id) && self.store.delete(key).await {
            successful_deletes += 1;
        }

        let remote = responsible
            .iter()
            .filter(|peer| peer.as_str() != self.node_id)
            .map(|peer| self.call_replica_delete(peer, key));
        for result in join_all(remote).await {
            match result {
                Ok(true) => successful_deletes += 1,
                Ok(false) => {}
                Err(err) => debug!(key, %err, "replica delete failed"),
            }
        }

        info!(
            key,
            deletes = successful_deletes,
            replicas = responsible.len(),
            "delete completed"
        );
        Ok(successful_deletes > 0)
    }

    /// Collapse a conflicted key to one caller-chosen value. The replacement
    /// clock merges every sibling clock gathered from the replica set, so the
    /// resolution dominates all of them everywhere.
    pub async fn resolve(&self, key: &str, value: Value) -> AppResult<VectorClock> {
        let responsible = self.responsible_for(key).await;
        if responsible.is_empty() {
            return Err(AppError::NoResponsibleNodes(key.to_string()));
        }

        let mut merged = VectorClock::new();
        if responsible.contains(&self.node_id) {
            if let Some(read) = self.store.get(key).await {
                merged.merge(&read.merged);
            }
        }
        let remote = responsible
            .iter()
            .filter(|peer| peer.as_str() != self.node_id)
            .map(|peer| self.call_replica_get(peer, key));
        for result in join_all(remote).await {
            if let Ok(Some(read)) = result {
                merged.merge(&read.merged);
            }
        }
        merged.increment(&self.node_id);

        let version = VersionedValue::new(value, merged.clone());
        if responsible.contains(&self.node_id) {
            self.store.sync_version(key, version.clone()).await;
        }
        let remote = responsible
            .iter()
            .filter(|peer| peer.as_str() != self.node_id)
            .map(|peer| self.call_replica_put(peer, key, version.clone()));
        for result in join_all(remote).await {
            if let Err(err) = result {
                debug!(key, %err, "replica resolve write failed");
            }
        }
        Ok(merged)
    }

    // View accessors, used by peers during join and by operators/tests.

    pub async fn membership_ids(&self) -> Vec<NodeId> {
        self.membership.read().await.ids()
    }

    pub async fn known_failed(&self) -> HashSet<NodeId> {
        self.membership.read().await.known_failed()
    }

    pub async fn ring_contains(&self, node_id: &str) -> bool {
        self.ring.read().await.contains(node_id)
    }

    pub async fn peer_state(&self, node_id: &str) -> PeerState {
        self.membership.read().await.peer_state(
            node_id,
            current_time_millis(),
            self.config.gossip_interval_ms as i64,
            self.config.failure_threshold_ms,
        )
    }

    pub async fn local_keys(&self) -> Vec<String> {
        self.store.keys().await
    }

    pub async fn local_read(&self, key: &str) -> Option<StoreRead> {
        self.store.get(key).await
    }
}

#[async_trait]
impl NodeRpc for Node {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn put(&self, key: &str, value: Value, context: Option<VectorClock>) -> AppResult<()> {
        self.ensure_running()?;
        Node::put(self, key, value, context).await
    }

    async fn get(&self, key: &str) -> AppResult<Option<ClientRead>> {
        self.ensure_running()?;
        Node::get(self, key).await
    }

    async fn delete(&self, key: &str) -> AppResult<bool> {
        self.ensure_running()?;
        Node::delete(self, key).await
    }

    async fn resolve(&self, key: &str, value: Value) -> AppResult<VectorClock> {
        self.ensure_running()?;
        Node::resolve(self, key, value).await
    }

    async fn replica_put(&self, key: &str, version: VersionedValue) -> AppResult<VectorClock> {
        self.ensure_running()?;
        Ok(self.store.sync_version(key, version).await)
    }

    async fn replica_get(&self, key: &str) -> AppResult<Option<StoreRead>> {
        self.ensure_running()?;
        Ok(self.store.get(key).await)
    }

    async fn replica_delete(&self, key: &str) -> AppResult<bool> {
        self.ensure_running()?;
        Ok(self.store.delete(key).await)
    }

    async fn receive_gossip(&self, message: GossipMessage) -> AppResult<()> {
        if !self.is_running() {
            return Ok(());
        }
        let delta = {
            let mut membership = self.membership.write().await;
            membership.apply_snapshot(&self.node_id, &message, current_time_millis())
        };
        if !delta.is_empty() {
            let mut ring = self.ring.write().await;
            for node_id in &delta.removed {
                ring.remove_node(node_id);
            }
            for node_id in &delta.added {
                ring.add_node(node_id);
            }
            drop(ring);
            self.clear_route_cache().await;
            info!(
                node_id = %self.node_id,
                added = ?delta.added,
                removed = ?delta.removed,
                "membership changed via gossip"
            );
        }
        Ok(())
    }

    async fn ring_nodes(&self) -> AppResult<HashSet<NodeId>> {
        Ok(self.ring.read().await.nodes())
    }

    async fn membership_view(&self) -> AppResult<HashMap<NodeId, MembershipEntry>> {
        Ok(self.membership.read().await.snapshot())
    }

    async fn node_joined(&self, node_id: &str) -> AppResult<()> {
        {
            let mut membership = self.membership.write().await;
            membership.clear_failed(node_id);
            membership.insert(node_id, current_time_millis());
        }
        {
            let mut ring = self.ring.write().await;
            if !ring.contains(node_id) {
                ring.add_node(node_id);
            }
        }
        self.clear_route_cache().await;
        info!(node_id, "node joined the cluster");
        Ok(())
    }
}

impl Node {
    fn ensure_running(&self) -> AppResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(AppError::Transport(format!(
                "node {} is not running",
                self.node_id
            )))
        }
    }
}

struct GossipContext {
    node_id: NodeId,
    ring: Arc<RwLock<HashRing>>,
    membership: Arc<RwLock<MembershipTable>>,
    directory: Arc<NodeDirectory>,
    route_cache: Arc<Mutex<LruCache<String, Vec<NodeId>>>>,
    config: ClusterConfig,
    running: Arc<AtomicBool>,
}

async fn run_gossip_loop(context: GossipContext) {
    let mut gossip_tick =
        tokio::time::interval(Duration::from_millis(context.config.gossip_interval_ms));
    let mut failure_tick = tokio::time::interval(Duration::from_millis(
        context.config.failure_check_interval_ms,
    ));
    // The first tick of an interval fires immediately; consume both so the
    // loop starts on a full period.
    gossip_tick.tick().await;
    failure_tick.tick().await;

    loop {
        if !context.running.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = gossip_tick.tick() => gossip_round(&context).await,
            _ = failure_tick.tick() => failure_sweep(&context).await,
        }
    }
}

/// One heartbeat: bump our counter and send the membership snapshot to up to
/// `gossip_fanout` random peers. Per-peer errors are logged and swallowed.
async fn gossip_round(context: &GossipContext) {
    let message = {
        let mut membership = context.membership.write().await;
        membership.beat(&context.node_id, current_time_millis());
        GossipMessage {
            sender: context.node_id.clone(),
            membership: membership.snapshot(),
            failed: membership.known_failed(),
        }
    };

    let targets: Vec<NodeId> = {
        let peers: Vec<NodeId> = message
            .membership
            .keys()
            .filter(|id| id.as_str() != context.node_id)
            .cloned()
            .collect();
        let count = context.config.gossip_fanout.min(peers.len());
        let mut rng = rand::rng();
        peers.choose_multiple(&mut rng, count).cloned().collect()
    };

    for target in targets {
        match context.directory.lookup_from(&context.node_id, &target).await {
            Some(peer) => {
                if let Err(err) = peer.receive_gossip(message.clone()).await {
                    debug!(target = %target, %err, "gossip send failed");
                }
            }
            None => debug!(target = %target, "gossip target unreachable"),
        }
    }
}

/// Expire peers whose entries outlived the failure threshold and drop their
/// virtual nodes from the ring.
async fn failure_sweep(context: &GossipContext) {
    let expired = {
        let mut membership = context.membership.write().await;
        membership.sweep_failures(
            &context.node_id,
            current_time_millis(),
            context.config.failure_threshold_ms,
        )
    };
    if expired.is_empty() {
        return;
    }

    let mut ring = context.ring.write().await;
    for node_id in &expired {
        ring.remove_node(node_id);
    }
    drop(ring);
    context.route_cache.lock().await.clear();
    info!(
        node_id = %context.node_id,
        failed = ?expired,
        "removed failed nodes from ring"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> ClusterConfig {
        ClusterConfig::default()
    }

    async fn cluster(
        directory: &Arc<NodeDirectory>,
        ids: &[&str],
        config: ClusterConfig,
    ) -> Vec<Arc<Node>> {
        let mut nodes = Vec::new();
        let first = Node::new(ids[0], directory.clone(), config.clone())
            .await
            .unwrap();
        first.start().await;
        nodes.push(first);
        for id in &ids[1..] {
            let node = Node::join(*id, directory.clone(), ids[0], config.clone())
                .await
                .unwrap();
            node.start().await;
            nodes.push(node);
        }
        nodes
    }

    #[tokio::test]
    async fn put_and_get_round_trip() {
        let directory = NodeDirectory::new();
        let nodes = cluster(&directory, &["a", "b", "c"], test_config()).await;

        nodes[0].put("user:1", json!("alice"), None).await.unwrap();
        let read = nodes[1].get("user:1").await.unwrap().unwrap();
        assert!(!read.is_conflict());
        assert_eq!(read.values(), vec![&json!("alice")]);

        for node in &nodes {
            node.stop().await;
        }
    }

    #[tokio::test]
    async fn write_lands_on_quorum_of_replicas() {
        let directory = NodeDirectory::new();
        let nodes = cluster(&directory, &["a", "b", "c"], test_config()).await;

        nodes[0].put("k", json!(1), None).await.unwrap();
        let mut holders = 0;
        for node in &nodes {
            if node.local_read("k").await.is_some() {
                holders += 1;
            }
        }
        assert!(holders >= test_config().write_quorum);

        for node in &nodes {
            node.stop().await;
        }
    }

    #[tokio::test]
    async fn quorum_failure_surfaces() {
        let directory = NodeDirectory::new();
        // A lone node cannot meet W=2 when N=3.
        let node = Node::new("solo", directory.clone(), test_config())
            .await
            .unwrap();
        node.start().await;

        match node.put("k", json!(1), None).await {
            Err(AppError::QuorumNotReached { required, achieved }) => {
                assert_eq!(required, 2);
                assert_eq!(achieved, 1);
            }
            other => panic!("expected QuorumNotReached, got {:?}", other),
        }
        node.stop().await;
    }

    #[tokio::test]
    async fn join_converges_ring_and_membership() {
        let directory = NodeDirectory::new();
        let nodes = cluster(&directory, &["a", "b", "c"], test_config()).await;

        // "b" only learns about "c" through gossip; give the views a moment
        // to converge.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        'outer: loop {
            let mut converged = true;
            for node in &nodes {
                for id in ["a", "b", "c"] {
                    if !node.ring_contains(id).await {
                        converged = false;
                    }
                }
                if node.membership_ids().await.len() != 3 {
                    converged = false;
                }
            }
            if converged {
                break 'outer;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "cluster views did not converge"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for node in &nodes {
            node.stop().await;
        }
    }

    #[tokio::test]
    async fn delete_requires_a_holder() {
        let directory = NodeDirectory::new();
        let nodes = cluster(&directory, &["a", "b", "c"], test_config()).await;

        assert!(!nodes[0].delete("missing").await.unwrap());
        nodes[0].put("k", json!(1), None).await.unwrap();
        assert!(nodes[0].delete("k").await.unwrap());
        assert!(nodes[0].get("k").await.unwrap().is_none());

        for node in &nodes {
            node.stop().await;
        }
    }
}
