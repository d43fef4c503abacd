use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::core::snowflake::SnowflakeGenerator;
use crate::core::{PostId, UserId};
use crate::error::AppResult;
use crate::feed::content_cache::{ContentCache, ContentCacheConfig};
use crate::feed::models::{Post, PostType};

#[derive(Debug, Default)]
struct CatalogInner {
    posts: HashMap<PostId, Post>,
    /// Author -> post ids in publication order (snowflakes, so also id order).
    by_author: HashMap<UserId, Vec<PostId>>,
}

/// Authoritative post store with a serialized-form read cache in front.
#[derive(Debug)]
pub struct PostCatalog {
    allocator: Arc<SnowflakeGenerator>,
    cache: ContentCache,
    inner: RwLock<CatalogInner>,
}

impl PostCatalog {
    pub fn new(allocator: Arc<SnowflakeGenerator>, cache_config: ContentCacheConfig) -> Self {
        Self {
            allocator,
            cache: ContentCache::new(cache_config),
            inner: RwLock::new(CatalogInner::default()),
        }
    }

    pub async fn insert_post(
        &self,
        author_id: UserId,
        content: &str,
        post_type: PostType,
    ) -> AppResult<Post> {
        let now = Utc::now();
        let post = Post {
            post_id: self.allocator.next_id()?,
            author_id,
            content: content.to_string(),
            post_type,
            created_at: now,
            updated_at: now,
        };

        {
            let mut inner = self.inner.write().await;
            inner.by_author.entry(author_id).or_default().push(post.post_id);
            inner.posts.insert(post.post_id, post.clone());
        }
        if let Err(err) = self.cache.insert(&post).await {
            warn!(post_id = post.post_id, %err, "failed to cache post");
        }
        info!(post_id = post.post_id, author_id, ?post_type, "post created");
        Ok(post)
    }

    pub async fn get_post(&self, post_id: PostId) -> Option<Post> {
        if let Some(post) = self.cache.fetch(post_id).await {
            return Some(post);
        }
        let post = self.inner.read().await.posts.get(&post_id).cloned()?;
        if let Err(err) = self.cache.insert(&post).await {
            warn!(post_id, %err, "failed to back-fill post cache");
        }
        Some(post)
    }

    /// Newest-first posts of one author.
    pub async fn posts_by_author(&self, author_id: UserId, limit: usize) -> Vec<Post> {
        let inner = self.inner.read().await;
        inner
            .by_author
            .get(&author_id)
            .map(|ids| {
                ids.iter()
                    .rev()
                    .take(limit)
                    .filter_map(|id| inner.posts.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Newest-first merge of several authors' posts.
    pub async fn get_posts_by_authors(
        &self,
        author_ids: &[UserId],
        limit: usize,
        offset: usize,
    ) -> Vec<Post> {
        let inner = self.inner.read().await;
        let mut posts: Vec<Post> = author_ids
            .iter()
            .filter_map(|author| inner.by_author.get(author))
            .flatten()
            .filter_map(|id| inner.posts.get(id).cloned())
            .collect();
        posts.sort_by(|a, b| {
            (b.created_at, b.post_id).cmp(&(a.created_at, a.post_id))
        });
        posts.into_iter().skip(offset).take(limit).collect()
    }

    /// Remove a post. No-op returning `false` when the post does not exist;
    /// cascades to actions and feed indexes happen at the engine level.
    pub async fn delete_post(&self, post_id: PostId) -> bool {
        let removed = {
            let mut inner = self.inner.write().await;
            match inner.posts.remove(&post_id) {
                Some(post) => {
                    if let Some(ids) = inner.by_author.get_mut(&post.author_id) {
                        ids.retain(|id| *id != post_id);
                    }
                    true
                }
                None => false,
            }
        };
        if removed {
            self.cache.invalidate(post_id).await;
            info!(post_id, "post deleted");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.posts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.posts.is_empty()
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }
}
