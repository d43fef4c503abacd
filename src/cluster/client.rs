// Client interface for the replicated store. Caches the vector-clock
// context of every key it touches and echoes it back on subsequent writes,
// so causally descendant updates replace instead of conflict.

use rand::seq::IndexedRandom;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cluster::directory::{NodeDirectory, ReadValue};
use crate::cluster::vector_clock::VectorClock;
use crate::core::NodeId;
use crate::error::{AppError, AppResult};

/// Thin store client. Connects through the directory, tries nodes in random
/// order, and keeps a per-key context cache.
#[derive(Debug)]
pub struct KvClient {
    directory: Arc<NodeDirectory>,
    nodes: Mutex<Vec<NodeId>>,
    context_cache: Mutex<HashMap<String, VectorClock>>,
}

impl KvClient {
    pub fn new(directory: Arc<NodeDirectory>) -> Self {
        Self {
            directory,
            nodes: Mutex::new(Vec::new()),
            context_cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn add_node(&self, node_id: impl Into<NodeId>) {
        let node_id = node_id.into();
        let mut nodes = self.nodes.lock().await;
        if !nodes.contains(&node_id) {
            nodes.push(node_id);
        }
    }

    /// Connection targets in random order, so load spreads across the
    /// cluster.
    async fn shuffled_nodes(&self) -> Vec<NodeId> {
        let nodes = self.nodes.lock().await;
        let mut rng = rand::rng();
        nodes
            .choose_multiple(&mut rng, nodes.len())
            .cloned()
            .collect()
    }

    pub async fn put(&self, key: &str, value: Value) -> AppResult<()> {
        let targets = self.shuffled_nodes().await;
        if targets.is_empty() {
            return Err(AppError::Transport(
                "no nodes available for put operation".to_string(),
            ));
        }

        let context = self.context_cache.lock().await.get(key).cloned();
        let mut last_error = None;
        for target in targets {
            let Some(node) = self.directory.lookup(&target).await else {
                continue;
            };
            match node.put(key, value.clone(), context.clone()).await {
                Ok(()) => {
                    // Refresh the cached context with the stored version.
                    if let Ok(Some(read)) = node.get(key).await {
                        self.context_cache
                            .lock()
                            .await
                            .insert(key.to_string(), read.context);
                    }
                    return Ok(());
                }
                Err(err) => {
                    debug!(key, node = %target, %err, "put attempt failed");
                    last_error = Some(err);
                }
            }
        }

        error!(key, "failed to put key on any node");
        Err(last_error.unwrap_or_else(|| {
            AppError::Transport("no reachable nodes for put operation".to_string())
        }))
    }

    /// Read a key. A conflicted key comes back as `ReadValue::Conflict`;
    /// callers resolve it with [`resolve`](Self::resolve).
    pub async fn get(&self, key: &str) -> AppResult<Option<ReadValue>> {
        let targets = self.shuffled_nodes().await;
        if targets.is_empty() {
            return Err(AppError::Transport(
                "no nodes available for get operation".to_string(),
            ));
        }

        for target in targets {
            let Some(node) = self.directory.lookup(&target).await else {
                continue;
            };
            match node.get(key).await {
                Ok(Some(read)) => {
                    self.context_cache
                        .lock()
                        .await
                        .insert(key.to_string(), read.context.clone());
                    return Ok(Some(read.value));
                }
                Ok(None) => return Ok(None),
                Err(err) => debug!(key, node = %target, %err, "get attempt failed"),
            }
        }
        Ok(None)
    }

    /// Delete on every reachable node so the removal propagates, then verify
    /// with a read.
    pub async fn delete(&self, key: &str) -> AppResult<bool> {
        let targets = self.shuffled_nodes().await;
        if targets.is_empty() {
            return Err(AppError::Transport(
                "no nodes available for delete operation".to_string(),
            ));
        }

        let mut deleted = false;
        for target in &targets {
            let Some(node) = self.directory.lookup(target).await else {
                continue;
            };
            match node.delete(key).await {
                Ok(true) => deleted = true,
                Ok(false) => {}
                Err(err) => debug!(key, node = %target, %err, "delete attempt failed"),
            }
        }

        if deleted {
            self.context_cache.lock().await.remove(key);
        }

        if self.get(key).await?.is_some() {
            warn!(key, "delete verification failed: key still readable");
            return Ok(false);
        }
        info!(key, deleted, "delete completed");
        Ok(deleted)
    }

    /// Resolve a conflicted key to a caller-chosen value. Any reachable node
    /// coordinates the resolution cluster-wide.
    pub async fn resolve(&self, key: &str, value: Value) -> AppResult<VectorClock> {
        let targets = self.shuffled_nodes().await;
        let mut last_error = None;
        for target in targets {
            let Some(node) = self.directory.lookup(&target).await else {
                continue;
            };
            match node.resolve(key, value.clone()).await {
                Ok(merged) => {
                    self.context_cache
                        .lock()
                        .await
                        .insert(key.to_string(), merged.clone());
                    return Ok(merged);
                }
                Err(err) => {
                    debug!(key, node = %target, %err, "resolve attempt failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            AppError::Transport("no reachable nodes for conflict resolution".to_string())
        }))
    }
}
