// Fanout dispatcher: distributes newly published posts into follower feeds.
// Regular authors are pushed eagerly by a worker pool; authors over the
// celebrity threshold are flagged for pull-at-read instead.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::core::{PostId, UserId};
use crate::error::{AppError, AppResult};
use crate::feed::feed_index::FeedIndex;
use crate::feed::models::RelationshipType;
use crate::feed::social_graph::SocialGraph;

#[derive(Debug, Clone)]
pub struct FanoutTask {
    pub author_id: UserId,
    pub post_id: PostId,
    pub score_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FanoutStats {
    pub total_fanouts: u64,
    pub eager_fanouts: u64,
    pub lazy_fanouts: u64,
    pub feeds_updated: u64,
    pub skipped_blocked: u64,
    pub last_fanout_ms: f64,
    pub avg_fanout_ms: f64,
}

struct WorkerContext {
    graph: Arc<SocialGraph>,
    index: Arc<FeedIndex>,
    celebrities: Arc<RwLock<HashSet<UserId>>>,
    stats: Arc<RwLock<FanoutStats>>,
    config: FeedConfig,
}

/// Asynchronous post distribution. Publishing never traverses the follower
/// graph on the caller's task: `enqueue` appends the author's own feed and
/// hands the rest to the worker pool through a bounded FIFO.
#[derive(Debug)]
pub struct FanoutDispatcher {
    index: Arc<FeedIndex>,
    sender: RwLock<Option<mpsc::Sender<FanoutTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    celebrities: Arc<RwLock<HashSet<UserId>>>,
    stats: Arc<RwLock<FanoutStats>>,
    shutdown_grace: Duration,
}

impl FanoutDispatcher {
    pub fn new(graph: Arc<SocialGraph>, index: Arc<FeedIndex>, config: FeedConfig) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel::<FanoutTask>(config.fanout_queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let celebrities = Arc::new(RwLock::new(HashSet::new()));
        let stats = Arc::new(RwLock::new(FanoutStats::default()));

        let mut workers = Vec::with_capacity(config.fanout_workers);
        for worker_id in 0..config.fanout_workers {
            let receiver = receiver.clone();
            let context = WorkerContext {
                graph: graph.clone(),
                index: index.clone(),
                celebrities: celebrities.clone(),
                stats: stats.clone(),
                config: config.clone(),
            };
            workers.push(tokio::spawn(async move {
                loop {
                    let task = { receiver.lock().await.recv().await };
                    match task {
                        Some(task) => process_task(&context, task).await,
                        None => break,
                    }
                }
                debug!(worker_id, "fanout worker exited");
            }));
        }
        info!(workers = config.fanout_workers, "fanout dispatcher started");

        Arc::new(Self {
            index,
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(workers),
            celebrities,
            stats,
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
        })
    }

    /// Append the post to the author's own feed synchronously, then queue the
    /// follower fanout.
    pub async fn enqueue(&self, author_id: UserId, post_id: PostId, score_ms: i64) -> AppResult<()> {
        self.index.append(author_id, post_id, score_ms).await;

        let sender = self.sender.read().await;
        let Some(sender) = sender.as_ref() else {
            return Err(AppError::Internal(
                "fanout dispatcher is shut down".to_string(),
            ));
        };
        sender
            .send(FanoutTask {
                author_id,
                post_id,
                score_ms,
            })
            .await
            .map_err(|_| AppError::Internal("fanout queue closed".to_string()))?;
        debug!(author_id, post_id, "post queued for fanout");
        Ok(())
    }

    /// Whether the author is in pull-at-read mode. Readers merge such
    /// authors' posts at feed-read time.
    pub async fn is_celebrity(&self, author_id: UserId) -> bool {
        self.celebrities.read().await.contains(&author_id)
    }

    pub async fn stats(&self) -> FanoutStats {
        *self.stats.read().await
    }

    /// Refuse new enqueues, let workers drain in-flight tasks, and wait a
    /// bounded grace period for them to finish.
    pub async fn shutdown(&self) {
        let sender = self.sender.write().await.take();
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if tokio::time::timeout(self.shutdown_grace, worker).await.is_err() {
                warn!("fanout worker did not drain within the grace period");
            }
        }
        info!("fanout dispatcher stopped");
    }
}

async fn process_task(context: &WorkerContext, task: FanoutTask) {
    let started = Instant::now();
    let follower_count = context.graph.follower_count(task.author_id).await;

    if follower_count > context.config.celebrity_threshold {
        // Pull model: flag the author and let readers merge at read time.
        context.celebrities.write().await.insert(task.author_id);
        debug!(
            author_id = task.author_id,
            follower_count, "lazy fanout for celebrity author"
        );
        let mut stats = context.stats.write().await;
        stats.total_fanouts += 1;
        stats.lazy_fanouts += 1;
        finish_stats(&mut stats, started);
        return;
    }

    // The author may have dropped back below the threshold.
    context.celebrities.write().await.remove(&task.author_id);

    let followers = context.graph.followers(task.author_id).await;
    let mut feeds_updated = 0u64;
    let mut skipped_blocked = 0u64;
    for batch in followers.chunks(context.config.fanout_batch_size) {
        for follower in batch {
            if context
                .graph
                .relationship_type(*follower, task.author_id)
                .await
                == Some(RelationshipType::Block)
            {
                debug!(
                    follower = *follower,
                    post_id = task.post_id,
                    "skipping blocked author's post"
                );
                skipped_blocked += 1;
                continue;
            }
            context
                .index
                .append(*follower, task.post_id, task.score_ms)
                .await;
            feeds_updated += 1;
        }
    }

    let mut stats = context.stats.write().await;
    stats.total_fanouts += 1;
    stats.eager_fanouts += 1;
    stats.feeds_updated += feeds_updated;
    stats.skipped_blocked += skipped_blocked;
    finish_stats(&mut stats, started);
    debug!(
        author_id = task.author_id,
        post_id = task.post_id,
        feeds_updated,
        skipped_blocked,
        "eager fanout completed"
    );
}

fn finish_stats(stats: &mut FanoutStats, started: Instant) {
    let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
    stats.last_fanout_ms = elapsed_ms;
    let n = stats.total_fanouts as f64;
    stats.avg_fanout_ms = (stats.avg_fanout_ms * (n - 1.0) + elapsed_ms) / n;
}
