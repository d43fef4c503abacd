use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::{PostId, UserId};

#[derive(Debug, Default)]
struct UserFeed {
    /// Ordered `(score, post_id)`; iteration in reverse yields the feed.
    entries: BTreeSet<(i64, PostId)>,
    /// Upsert support: post id -> current score.
    by_post: HashMap<PostId, i64>,
}

/// Per-user materialized feed: an ordered set of post ids scored by the
/// post's creation time, capped at `max_feed_size` entries per user.
#[derive(Debug)]
pub struct FeedIndex {
    max_feed_size: usize,
    feeds: RwLock<HashMap<UserId, UserFeed>>,
}

impl FeedIndex {
    pub fn new(max_feed_size: usize) -> Self {
        Self {
            max_feed_size: max_feed_size.max(1),
            feeds: RwLock::new(HashMap::new()),
        }
    }

    /// Upsert `(post_id, score)` into the user's feed, then trim the oldest
    /// entries beyond the cap.
    pub async fn append(&self, user_id: UserId, post_id: PostId, score: i64) {
        let mut feeds = self.feeds.write().await;
        let feed = feeds.entry(user_id).or_default();

        if let Some(old_score) = feed.by_post.insert(post_id, score) {
            feed.entries.remove(&(old_score, post_id));
        }
        feed.entries.insert((score, post_id));

        while feed.entries.len() > self.max_feed_size {
            let Some(&oldest) = feed.entries.iter().next() else {
                break;
            };
            feed.entries.remove(&oldest);
            feed.by_post.remove(&oldest.1);
            debug!(user_id, post_id = oldest.1, "trimmed oldest feed entry");
        }
    }

    /// Post ids in descending score order (ties by descending post id),
    /// skipping `offset`, returning at most `limit`.
    pub async fn range(&self, user_id: UserId, offset: usize, limit: usize) -> Vec<PostId> {
        self.range_with_scores(user_id, offset, limit)
            .await
            .into_iter()
            .map(|(_, post_id)| post_id)
            .collect()
    }

    pub async fn range_with_scores(
        &self,
        user_id: UserId,
        offset: usize,
        limit: usize,
    ) -> Vec<(i64, PostId)> {
        self.feeds
            .read()
            .await
            .get(&user_id)
            .map(|feed| {
                feed.entries
                    .iter()
                    .rev()
                    .skip(offset)
                    .take(limit)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove a deleted post from every user's feed. Sweeps the whole table;
    /// only invoked on post deletion.
    pub async fn remove_post_everywhere(&self, post_id: PostId) -> usize {
        warn!(post_id, "sweeping all feeds to remove post");
        let mut feeds = self.feeds.write().await;
        let mut removed = 0;
        for feed in feeds.values_mut() {
            if let Some(score) = feed.by_post.remove(&post_id) {
                feed.entries.remove(&(score, post_id));
                removed += 1;
            }
        }
        removed
    }

    pub async fn len(&self, user_id: UserId) -> usize {
        self.feeds
            .read()
            .await
            .get(&user_id)
            .map(|feed| feed.entries.len())
            .unwrap_or(0)
    }

    pub async fn contains(&self, user_id: UserId, post_id: PostId) -> bool {
        self.feeds
            .read()
            .await
            .get(&user_id)
            .map(|feed| feed.by_post.contains_key(&post_id))
            .unwrap_or(false)
    }
}
