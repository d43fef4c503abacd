// Feed engine facade: user accounts, publishing, feed reads with celebrity
// pull-merge, actions, and relationship management. One-way dependencies:
// the engine drives catalog, graph, index, ledger, and dispatcher; the
// dispatcher only ever touches the graph and the index.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::FeedConfig;
use crate::core::snowflake::SnowflakeGenerator;
use crate::core::{PostId, UserId};
use crate::error::{AppError, AppResult};
use crate::feed::action_ledger::ActionLedger;
use crate::feed::content_cache::ContentCacheConfig;
use crate::feed::fanout::FanoutDispatcher;
use crate::feed::feed_index::FeedIndex;
use crate::feed::models::{ActionType, EnrichedPost, Post, PostType, RelationshipType, User};
use crate::feed::post_catalog::PostCatalog;
use crate::feed::social_graph::SocialGraph;
use crate::feed::users::UserRegistry;

#[derive(Debug)]
pub struct FeedEngine {
    config: FeedConfig,
    users: Arc<UserRegistry>,
    graph: Arc<SocialGraph>,
    catalog: Arc<PostCatalog>,
    index: Arc<FeedIndex>,
    ledger: Arc<ActionLedger>,
    dispatcher: Arc<FanoutDispatcher>,
}

impl FeedEngine {
    pub fn new(allocator: Arc<SnowflakeGenerator>, config: FeedConfig) -> AppResult<Arc<Self>> {
        config.validate()?;

        let users = Arc::new(UserRegistry::new(allocator.clone()));
        let graph = Arc::new(SocialGraph::new(allocator.clone()));
        let catalog = Arc::new(PostCatalog::new(
            allocator.clone(),
            ContentCacheConfig {
                capacity: config.content_cache_capacity,
                ttl: Duration::from_secs(config.content_cache_ttl_secs),
            },
        ));
        let index = Arc::new(FeedIndex::new(config.max_feed_size));
        let ledger = Arc::new(ActionLedger::new(allocator));
        let dispatcher = FanoutDispatcher::new(graph.clone(), index.clone(), config.clone());

        Ok(Arc::new(Self {
            config,
            users,
            graph,
            catalog,
            index,
            ledger,
            dispatcher,
        }))
    }

    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }

    // Users

    pub async fn create_user(
        &self,
        username: &str,
        email: Option<String>,
        profile_picture_url: Option<String>,
    ) -> AppResult<User> {
        self.users.create_user(username, email, profile_picture_url).await
    }

    pub async fn get_user(&self, user_id: UserId) -> Option<User> {
        self.users.get(user_id).await
    }

    // Publishing and feeds

    pub async fn publish_post(
        &self,
        user_id: UserId,
        content: &str,
        post_type: PostType,
    ) -> AppResult<Post> {
        if !self.users.contains(user_id).await {
            return Err(AppError::InvalidArgument(format!(
                "user {} does not exist",
                user_id
            )));
        }
        let post = self.catalog.insert_post(user_id, content, post_type).await?;
        self.dispatcher
            .enqueue(user_id, post.post_id, post.score_ms())
            .await?;
        info!(user_id, post_id = post.post_id, "post published");
        Ok(post)
    }

    /// The user's feed, newest first: the materialized index merged with the
    /// recent posts of any followed celebrity author, capped at
    /// `limit + offset` candidates before pagination.
    pub async fn get_news_feed(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> AppResult<Vec<EnrichedPost>> {
        let cap = limit + offset;
        let mut candidates: Vec<(i64, PostId)> =
            self.index.range_with_scores(user_id, 0, cap).await;

        for author in self
            .graph
            .friends_by_type(user_id, RelationshipType::Follow)
            .await
        {
            if self.dispatcher.is_celebrity(author).await {
                for post in self.catalog.posts_by_author(author, cap).await {
                    candidates.push((post.score_ms(), post.post_id));
                }
            }
        }

        candidates.sort_unstable_by(|a, b| b.cmp(a));
        let mut seen: HashSet<PostId> = HashSet::new();
        let ids: Vec<PostId> = candidates
            .into_iter()
            .filter(|(_, post_id)| seen.insert(*post_id))
            .take(cap)
            .skip(offset)
            .map(|(_, post_id)| post_id)
            .collect();

        let mut feed = Vec::with_capacity(ids.len());
        for post_id in ids {
            if let Some(post) = self.catalog.get_post(post_id).await {
                feed.push(self.enrich(post, user_id).await);
            }
        }
        Ok(feed)
    }

    /// Posts published by one user, newest first.
    pub async fn get_user_feed(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> AppResult<Vec<EnrichedPost>> {
        let posts = self
            .catalog
            .get_posts_by_authors(&[user_id], limit, offset)
            .await;
        let mut feed = Vec::with_capacity(posts.len());
        for post in posts {
            feed.push(self.enrich(post, user_id).await);
        }
        Ok(feed)
    }

    async fn enrich(&self, post: Post, viewer_id: UserId) -> EnrichedPost {
        let author = self.users.get(post.author_id).await;
        let like_count = self.ledger.count(post.post_id, ActionType::Like).await;
        let comment_count = self.ledger.count(post.post_id, ActionType::Comment).await;
        let share_count = self.ledger.count(post.post_id, ActionType::Share).await;
        let liked_by_me = self
            .ledger
            .has_action(viewer_id, post.post_id, ActionType::Like)
            .await;
        EnrichedPost {
            post,
            username: author.as_ref().map(|user| user.username.clone()),
            profile_picture_url: author.and_then(|user| user.profile_picture_url),
            like_count,
            comment_count,
            share_count,
            liked_by_me,
        }
    }

    // Actions

    /// Like a post. Returns whether new state was written (idempotent).
    pub async fn like_post(&self, user_id: UserId, post_id: PostId) -> AppResult<bool> {
        self.require_post(post_id).await?;
        self.ledger.add_action(user_id, post_id, ActionType::Like).await
    }

    pub async fn unlike_post(&self, user_id: UserId, post_id: PostId) -> AppResult<bool> {
        Ok(self
            .ledger
            .remove_action(user_id, post_id, ActionType::Like)
            .await)
    }

    /// Comment: a derived post of type COMMENT plus a linking action on the
    /// original. Comments do not fan out.
    pub async fn comment_on_post(
        &self,
        user_id: UserId,
        post_id: PostId,
        content: &str,
    ) -> AppResult<Post> {
        self.require_post(post_id).await?;
        let comment = self
            .catalog
            .insert_post(user_id, content, PostType::Comment)
            .await?;
        self.ledger
            .add_action(user_id, post_id, ActionType::Comment)
            .await?;
        info!(user_id, post_id, comment_id = comment.post_id, "comment created");
        Ok(comment)
    }

    /// Share: a derived post of type SHARE plus a linking action; the share
    /// itself fans out like any publication.
    pub async fn share_post(
        &self,
        user_id: UserId,
        post_id: PostId,
        content: Option<&str>,
    ) -> AppResult<Post> {
        self.require_post(post_id).await?;
        let body = content
            .map(|text| text.to_string())
            .unwrap_or_else(|| format!("Shared post {}", post_id));
        let share = self
            .catalog
            .insert_post(user_id, &body, PostType::Share)
            .await?;
        self.ledger
            .add_action(user_id, post_id, ActionType::Share)
            .await?;
        self.dispatcher
            .enqueue(user_id, share.post_id, share.score_ms())
            .await?;
        info!(user_id, post_id, share_id = share.post_id, "post shared");
        Ok(share)
    }

    /// Author-only deletion, cascading to actions, counters, every feed
    /// index, and the content cache. Deleting a missing post is a no-op.
    pub async fn delete_post(&self, user_id: UserId, post_id: PostId) -> AppResult<bool> {
        let Some(post) = self.catalog.get_post(post_id).await else {
            return Ok(false);
        };
        if post.author_id != user_id {
            return Err(AppError::InvalidArgument(format!(
                "user {} is not the author of post {}",
                user_id, post_id
            )));
        }

        self.catalog.delete_post(post_id).await;
        let actions_removed = self.ledger.remove_post_actions(post_id).await;
        let feeds_swept = self.index.remove_post_everywhere(post_id).await;
        info!(post_id, actions_removed, feeds_swept, "post deleted with cascade");
        Ok(true)
    }

    // Relationships

    /// Follow a user and pull their recent posts into the follower's feed.
    pub async fn follow(&self, user_id: UserId, friend_id: UserId) -> AppResult<bool> {
        let changed = self
            .graph
            .add_relationship(user_id, friend_id, RelationshipType::Follow)
            .await?;
        if changed {
            for post in self
                .catalog
                .posts_by_author(friend_id, self.config.backfill_batch_size)
                .await
            {
                self.index
                    .append(user_id, post.post_id, post.score_ms())
                    .await;
            }
        }
        Ok(changed)
    }

    /// Remove a FOLLOW edge. Other edge types are untouched.
    pub async fn unfollow(&self, user_id: UserId, friend_id: UserId) -> AppResult<bool> {
        match self.graph.relationship_type(user_id, friend_id).await {
            Some(RelationshipType::Follow) => {
                Ok(self.graph.delete_relationship(user_id, friend_id).await)
            }
            _ => Ok(false),
        }
    }

    /// Block a user. Existing feed entries are not purged; the block only
    /// stops future fanout.
    pub async fn block(&self, user_id: UserId, friend_id: UserId) -> AppResult<bool> {
        self.graph
            .add_relationship(user_id, friend_id, RelationshipType::Block)
            .await
    }

    /// Remove a BLOCK edge. Fails softly when no block exists.
    pub async fn unblock(&self, user_id: UserId, friend_id: UserId) -> AppResult<bool> {
        match self.graph.relationship_type(user_id, friend_id).await {
            Some(RelationshipType::Block) => {
                Ok(self.graph.delete_relationship(user_id, friend_id).await)
            }
            _ => {
                warn!(user_id, friend_id, "no block relationship to remove");
                Ok(false)
            }
        }
    }

    async fn require_post(&self, post_id: PostId) -> AppResult<Post> {
        self.catalog
            .get_post(post_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("post {} does not exist", post_id)))
    }

    // Component handles for operators and tests.

    pub fn feed_index(&self) -> &Arc<FeedIndex> {
        &self.index
    }

    pub fn dispatcher(&self) -> &Arc<FanoutDispatcher> {
        &self.dispatcher
    }

    pub fn catalog(&self) -> &Arc<PostCatalog> {
        &self.catalog
    }

    pub fn graph(&self) -> &Arc<SocialGraph> {
        &self.graph
    }

    pub fn ledger(&self) -> &Arc<ActionLedger> {
        &self.ledger
    }
}
