// End-to-end walkthrough: a 3-node replicated KV cluster (quorum writes,
// conflict surfacing, failure detection) followed by the feed engine
// (publish, fanout, block filtering, celebrity pull).

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use plexus::cluster::{Node, NodeDirectory};
use plexus::config::Config;
use plexus::core::snowflake::SnowflakeGenerator;
use plexus::feed::{FeedEngine, PostType};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    println!("=== Replicated key-value store ===");
    let directory = NodeDirectory::new();
    let node_a = Node::new("node-a", directory.clone(), config.cluster.clone()).await?;
    node_a.start().await;
    let node_b = Node::join("node-b", directory.clone(), "node-a", config.cluster.clone()).await?;
    node_b.start().await;
    let node_c = Node::join("node-c", directory.clone(), "node-a", config.cluster.clone()).await?;
    node_c.start().await;

    node_a.put("user:42", json!({"name": "alice"}), None).await?;
    let read = node_b
        .get("user:42")
        .await?
        .expect("value replicated to quorum");
    println!("read from node-b: {:?}", read.values());

    println!("--- concurrent writes across a partition ---");
    let context = read.context.clone();
    directory.partition("node-a", "node-b").await;
    directory.partition("node-b", "node-c").await;
    let _ = node_a
        .put("user:42", json!({"name": "alice-v2"}), Some(context.clone()))
        .await;
    let _ = node_b
        .put("user:42", json!({"name": "alice-v3"}), Some(context))
        .await;
    directory.heal("node-a", "node-b").await;
    directory.heal("node-b", "node-c").await;

    if let Some(conflicted) = node_a.get("user:42").await? {
        println!(
            "conflict surfaced: {} sibling value(s): {:?}",
            conflicted.values().len(),
            conflicted.values()
        );
        let resolved = node_a
            .resolve("user:42", json!({"name": "alice-v3"}))
            .await?;
        println!("resolved with merged clock: {:?}", resolved.entries());
    }

    println!("--- failure detection ---");
    node_c.stop().await;
    tokio::time::sleep(Duration::from_secs(4)).await;
    println!(
        "node-a membership after stopping node-c: {:?} (failed: {:?})",
        node_a.membership_ids().await,
        node_a.known_failed().await
    );

    node_a.stop().await;
    node_b.stop().await;

    println!();
    println!("=== News feed engine ===");
    let allocator = Arc::new(SnowflakeGenerator::new(
        config.id.datacenter_id,
        config.id.machine_id,
        config.id.epoch_ms,
    )?);
    let engine = FeedEngine::new(allocator, config.feed.clone())?;

    let author = engine.create_user("author", None, None).await?;
    let reader = engine.create_user("reader", None, None).await?;
    let blocker = engine.create_user("blocker", None, None).await?;

    engine.follow(reader.user_id, author.user_id).await?;
    engine.follow(blocker.user_id, author.user_id).await?;
    engine.block(blocker.user_id, author.user_id).await?;

    let post = engine
        .publish_post(author.user_id, "hello, world", PostType::Text)
        .await?;
    engine.like_post(reader.user_id, post.post_id).await?;
    engine
        .comment_on_post(reader.user_id, post.post_id, "first!")
        .await?;

    tokio::time::sleep(Duration::from_millis(500)).await;

    let feed = engine.get_news_feed(reader.user_id, 10, 0).await?;
    println!("reader feed ({} post(s)):", feed.len());
    for item in &feed {
        println!(
            "  [{}] {:?} by {:?} (likes: {}, comments: {}, liked_by_me: {})",
            item.post.post_id,
            item.post.content,
            item.username,
            item.like_count,
            item.comment_count,
            item.liked_by_me
        );
    }

    let blocked_feed = engine.get_news_feed(blocker.user_id, 10, 0).await?;
    println!(
        "blocker feed has {} post(s) (block honored)",
        blocked_feed.len()
    );

    println!("fanout stats: {:?}", engine.dispatcher().stats().await);
    engine.shutdown().await;
    Ok(())
}
