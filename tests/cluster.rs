// Cluster integration tests: quorum writes, conflict surfacing across a
// partition, and gossip-based failure detection.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use plexus::cluster::{KvClient, Node, NodeDirectory, ReadValue};
use plexus::config::ClusterConfig;
use plexus::AppError;

fn test_config() -> ClusterConfig {
    ClusterConfig::default()
}

async fn three_node_cluster(
    directory: &Arc<NodeDirectory>,
    config: &ClusterConfig,
) -> Vec<Arc<Node>> {
    let node_a = Node::new("A", directory.clone(), config.clone()).await.unwrap();
    node_a.start().await;
    let node_b = Node::join("B", directory.clone(), "A", config.clone())
        .await
        .unwrap();
    node_b.start().await;
    let node_c = Node::join("C", directory.clone(), "A", config.clone())
        .await
        .unwrap();
    node_c.start().await;
    vec![node_a, node_b, node_c]
}

async fn stop_all(nodes: &[Arc<Node>]) {
    for node in nodes {
        node.stop().await;
    }
}

/// Wait until every node's membership covers the whole cluster, so each can
/// coordinate writes against the full replica set.
async fn await_convergence(nodes: &[Arc<Node>]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let mut converged = true;
        for node in nodes {
            if node.membership_ids().await.len() != nodes.len() {
                converged = false;
            }
        }
        if converged {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "cluster views did not converge"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn quorum_write_persists_on_w_replicas() {
    let directory = NodeDirectory::new();
    let config = test_config();
    let nodes = three_node_cluster(&directory, &config).await;

    nodes[0].put("k", json!("v"), None).await.unwrap();

    let mut holders = 0;
    for node in &nodes {
        if node.local_read("k").await.is_some() {
            holders += 1;
        }
    }
    assert!(
        holders >= config.write_quorum,
        "write reported success but only {} replicas hold the key",
        holders
    );

    stop_all(&nodes).await;
}

#[tokio::test]
async fn concurrent_writes_across_partition_surface_siblings() {
    let directory = NodeDirectory::new();
    let nodes = three_node_cluster(&directory, &test_config()).await;
    let (node_a, node_b) = (&nodes[0], &nodes[1]);

    // Clean initial write, context observed by the client.
    node_a.put("k", json!(1), None).await.unwrap();
    let context = node_a.get("k").await.unwrap().unwrap().context;

    // Partition B away from A and C, then write concurrently on both sides
    // from the same observed state. B cannot reach quorum but still applies
    // locally.
    directory.partition("A", "B").await;
    directory.partition("B", "C").await;
    node_a.put("k", json!(5), Some(context.clone())).await.unwrap();
    match node_b.put("k", json!(10), Some(context)).await {
        Err(AppError::QuorumNotReached { .. }) => {}
        other => panic!("expected quorum failure on the minority side, got {:?}", other),
    }

    directory.heal("A", "B").await;
    directory.heal("B", "C").await;

    let read = node_a.get("k").await.unwrap().unwrap();
    assert!(read.is_conflict(), "healed read must surface the conflict");
    let values = read.values();
    assert_eq!(values.len(), 2);
    assert!(values.contains(&&json!(5)));
    assert!(values.contains(&&json!(10)));

    // Resolution collapses the siblings cluster-wide.
    let merged = node_a.resolve("k", json!(10)).await.unwrap();
    let read = node_a.get("k").await.unwrap().unwrap();
    assert!(!read.is_conflict());
    assert_eq!(read.values(), vec![&json!(10)]);
    assert_eq!(read.context, merged);

    stop_all(&nodes).await;
}

#[tokio::test]
async fn failed_node_is_detected_and_removed() {
    let directory = NodeDirectory::new();
    let nodes = three_node_cluster(&directory, &test_config()).await;
    let (node_a, node_b, node_c) = (&nodes[0], &nodes[1], &nodes[2]);

    // Give gossip a moment so everyone knows everyone.
    tokio::time::sleep(Duration::from_millis(800)).await;
    node_c.stop().await;

    // gossipInterval=300ms, failureThreshold=2s: well within 4 seconds both
    // survivors must have expelled C.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    loop {
        let mut expelled = true;
        for node in [node_a, node_b] {
            if node.membership_ids().await.contains(&"C".to_string())
                || !node.known_failed().await.contains("C")
                || node.ring_contains("C").await
            {
                expelled = false;
            }
        }
        if expelled {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "C was not expelled within 4 seconds"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    stop_all(&nodes).await;
}

#[tokio::test]
async fn rejoin_clears_failure_record() {
    let directory = NodeDirectory::new();
    let config = test_config();
    let nodes = three_node_cluster(&directory, &config).await;
    let (node_a, node_b, node_c) = (&nodes[0], &nodes[1], &nodes[2]);

    tokio::time::sleep(Duration::from_millis(800)).await;
    // Stop B as well so no surviving peer keeps re-reporting C's failure
    // while it re-joins.
    node_b.stop().await;
    node_c.stop().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    while !node_a.known_failed().await.contains("C") {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // A fresh node under the same id joins through A explicitly.
    directory.deregister("C").await;
    let node_c2 = Node::join("C", directory.clone(), "A", config.clone())
        .await
        .unwrap();
    node_c2.start().await;

    assert!(!node_a.known_failed().await.contains("C"));
    assert!(node_a.ring_contains("C").await);

    stop_all(&nodes).await;
    node_c2.stop().await;
}

#[tokio::test]
async fn client_context_cache_preserves_causality() {
    let directory = NodeDirectory::new();
    let nodes = three_node_cluster(&directory, &test_config()).await;

    await_convergence(&nodes).await;

    let client = KvClient::new(directory.clone());
    for id in ["A", "B", "C"] {
        client.add_node(id).await;
    }

    // Two successive writes through the same client must be causally
    // ordered: the second replaces the first instead of forking a sibling.
    client.put("k", json!("v1")).await.unwrap();
    client.get("k").await.unwrap();
    client.put("k", json!("v2")).await.unwrap();

    match client.get("k").await.unwrap() {
        Some(ReadValue::Single(value)) => assert_eq!(value, json!("v2")),
        other => panic!("expected a clean read, got {:?}", other),
    }

    assert!(client.delete("k").await.unwrap());
    assert!(client.get("k").await.unwrap().is_none());

    stop_all(&nodes).await;
}

#[tokio::test]
async fn client_resolves_conflicts() {
    let directory = NodeDirectory::new();
    let nodes = three_node_cluster(&directory, &test_config()).await;
    let (node_a, node_b) = (&nodes[0], &nodes[1]);
    await_convergence(&nodes).await;

    node_a.put("k", json!(1), None).await.unwrap();
    let context = node_a.get("k").await.unwrap().unwrap().context;

    directory.partition("A", "B").await;
    directory.partition("B", "C").await;
    node_a.put("k", json!(5), Some(context.clone())).await.unwrap();
    let _ = node_b.put("k", json!(10), Some(context)).await;
    directory.heal("A", "B").await;
    directory.heal("B", "C").await;

    let client = KvClient::new(directory.clone());
    for id in ["A", "B", "C"] {
        client.add_node(id).await;
    }

    match client.get("k").await.unwrap() {
        Some(ReadValue::Conflict(values)) => assert_eq!(values.len(), 2),
        other => panic!("expected a conflict, got {:?}", other),
    }

    client.resolve("k", json!(5)).await.unwrap();
    match client.get("k").await.unwrap() {
        Some(ReadValue::Single(value)) => assert_eq!(value, json!(5)),
        other => panic!("expected a resolved read, got {:?}", other),
    }

    stop_all(&nodes).await;
}

#[tokio::test]
async fn delete_succeeds_with_one_holder_and_verifies_empty() {
    let directory = NodeDirectory::new();
    let nodes = three_node_cluster(&directory, &test_config()).await;

    nodes[0].put("k", json!("v"), None).await.unwrap();
    assert!(nodes[1].delete("k").await.unwrap());

    // Verification read.
    assert!(nodes[0].get("k").await.unwrap().is_none());
    assert!(!nodes[2].delete("k").await.unwrap());

    stop_all(&nodes).await;
}
