// Serialized post cache, modelled on a distributed content cache: entries
// hold the encoded form, hydration back to a domain object is explicit and
// validated.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::PostId;
use crate::error::{AppError, AppResult};
use crate::feed::models::Post;

/// Cache entry holding the serialized post.
#[derive(Debug, Clone)]
struct CacheEntry {
    data: Vec<u8>,
    inserted_at: Instant,
    ttl: Duration,
    access_count: u64,
}

impl CacheEntry {
    fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data,
            inserted_at: Instant::now(),
            ttl,
            access_count: 0,
        }
    }

    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }

    /// Decode and validate the cached payload.
    fn hydrate(&self, expected_id: PostId) -> AppResult<Post> {
        let post: Post = bincode::deserialize(&self.data)
            .map_err(|err| AppError::DeserializationError(err.to_string()))?;
        if post.post_id != expected_id {
            return Err(AppError::DeserializationError(format!(
                "cached payload for post {} decoded as post {}",
                expected_id, post.post_id
            )));
        }
        Ok(post)
    }
}

#[derive(Debug, Clone)]
pub struct ContentCacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for ContentCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded, TTL'd cache of serialized posts.
pub struct ContentCache {
    entries: Mutex<LruCache<PostId, CacheEntry>>,
    config: ContentCacheConfig,
    metrics: Mutex<CacheMetrics>,
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("config", &self.config)
            .finish()
    }
}

impl ContentCache {
    pub fn new(config: ContentCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            config,
            metrics: Mutex::new(CacheMetrics::default()),
        }
    }

    pub async fn insert(&self, post: &Post) -> AppResult<()> {
        let data = bincode::serialize(post)
            .map_err(|err| AppError::SerializationError(err.to_string()))?;
        self.entries
            .lock()
            .await
            .put(post.post_id, CacheEntry::new(data, self.config.ttl));
        Ok(())
    }

    /// Read-through lookup. Expired or corrupt entries are dropped and
    /// reported as misses; decode failures are logged, never propagated.
    pub async fn fetch(&self, post_id: PostId) -> Option<Post> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&post_id) else {
            self.metrics.lock().await.misses += 1;
            return None;
        };

        if entry.is_expired() {
            debug!(post_id, "cached post expired");
            entries.pop(&post_id);
            self.metrics.lock().await.misses += 1;
            return None;
        }

        entry.access_count += 1;
        match entry.hydrate(post_id) {
            Ok(post) => {
                self.metrics.lock().await.hits += 1;
                Some(post)
            }
            Err(err) => {
                warn!(post_id, %err, "evicting undecodable cache entry");
                entries.pop(&post_id);
                self.metrics.lock().await.misses += 1;
                None
            }
        }
    }

    pub async fn invalidate(&self, post_id: PostId) {
        if self.entries.lock().await.pop(&post_id).is_some() {
            self.metrics.lock().await.invalidations += 1;
        }
    }

    pub async fn metrics(&self) -> CacheMetrics {
        *self.metrics.lock().await
    }
}
