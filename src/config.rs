use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use tracing::warn;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub id: IdConfig,
    pub cluster: ClusterConfig,
    pub feed: FeedConfig,
}

/// Snowflake allocator settings. The epoch is a deployment constant: once
/// chosen it must never change for ids to stay comparable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdConfig {
    pub epoch_ms: i64,
    pub datacenter_id: u8,
    pub machine_id: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Virtual nodes per physical node on the hash ring.
    pub ring_replicas: usize,
    /// Replication factor N.
    pub replication_n: usize,
    /// Write quorum W.
    pub write_quorum: usize,
    /// Read quorum R.
    pub read_quorum: usize,
    pub gossip_interval_ms: u64,
    pub failure_check_interval_ms: u64,
    pub failure_threshold_ms: i64,
    pub gossip_fanout: usize,
    /// Per-peer deadline for replication and forwarded operations.
    pub replication_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Follower count above which an author switches to pull-at-read.
    pub celebrity_threshold: usize,
    pub fanout_batch_size: usize,
    pub fanout_workers: usize,
    pub max_feed_size: usize,
    pub fanout_queue_capacity: usize,
    pub shutdown_grace_ms: u64,
    /// How many recent posts a fresh follow pulls into the follower's feed.
    pub backfill_batch_size: usize,
    pub content_cache_capacity: usize,
    pub content_cache_ttl_secs: u64,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            // Apr 30, 2025
            epoch_ms: 1_714_531_200_000,
            datacenter_id: 0,
            machine_id: 0,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            ring_replicas: 3,
            replication_n: 3,
            write_quorum: 2,
            read_quorum: 2,
            gossip_interval_ms: 300,
            failure_check_interval_ms: 1_000,
            failure_threshold_ms: 2_000,
            gossip_fanout: 3,
            replication_timeout_ms: 1_000,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            celebrity_threshold: 5_000,
            fanout_batch_size: 100,
            fanout_workers: 10,
            max_feed_size: 1_000,
            fanout_queue_capacity: 1_024,
            shutdown_grace_ms: 5_000,
            backfill_batch_size: 20,
            content_cache_capacity: 10_000,
            content_cache_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            id: IdConfig {
                epoch_ms: env_parse("ID_EPOCH_MS", IdConfig::default().epoch_ms),
                datacenter_id: env_parse("ID_DATACENTER", 0),
                machine_id: env_parse("ID_MACHINE", 0),
            },
            cluster: ClusterConfig {
                ring_replicas: env_parse("RING_REPLICAS", 3),
                replication_n: env_parse("REPLICATION_N", 3),
                write_quorum: env_parse("WRITE_QUORUM", 2),
                read_quorum: env_parse("READ_QUORUM", 2),
                gossip_interval_ms: env_parse("GOSSIP_INTERVAL_MS", 300),
                failure_check_interval_ms: env_parse("FAILURE_CHECK_INTERVAL_MS", 1_000),
                failure_threshold_ms: env_parse("FAILURE_THRESHOLD_MS", 2_000),
                gossip_fanout: env_parse("GOSSIP_FANOUT", 3),
                replication_timeout_ms: env_parse("REPLICATION_TIMEOUT_MS", 1_000),
            },
            feed: FeedConfig {
                celebrity_threshold: env_parse("CELEBRITY_THRESHOLD", 5_000),
                fanout_batch_size: env_parse("FANOUT_BATCH_SIZE", 100),
                fanout_workers: env_parse("FANOUT_WORKERS", 10),
                max_feed_size: env_parse("MAX_FEED_SIZE", 1_000),
                fanout_queue_capacity: env_parse("FANOUT_QUEUE_CAPACITY", 1_024),
                shutdown_grace_ms: env_parse("SHUTDOWN_GRACE_MS", 5_000),
                backfill_batch_size: env_parse("BACKFILL_BATCH_SIZE", 20),
                content_cache_capacity: env_parse("CONTENT_CACHE_CAPACITY", 10_000),
                content_cache_ttl_secs: env_parse("CONTENT_CACHE_TTL_SECS", 24 * 60 * 60),
            },
        };
        Ok(config)
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.ring_replicas == 0 {
            return Err(AppError::Configuration(
                "ring_replicas must be at least 1".to_string(),
            ));
        }
        if self.replication_n == 0 {
            return Err(AppError::Configuration(
                "replication factor N must be at least 1".to_string(),
            ));
        }
        if self.write_quorum == 0 || self.read_quorum == 0 {
            return Err(AppError::Configuration(
                "read and write quorums must be at least 1".to_string(),
            ));
        }
        if self.write_quorum > self.replication_n || self.read_quorum > self.replication_n {
            return Err(AppError::Configuration(format!(
                "quorums (W={}, R={}) cannot exceed the replication factor N={}",
                self.write_quorum, self.read_quorum, self.replication_n
            )));
        }
        if self.write_quorum + self.read_quorum <= self.replication_n {
            warn!(
                "W + R <= N ({} + {} <= {}): reads may be stale even without failures",
                self.write_quorum, self.read_quorum, self.replication_n
            );
        }
        Ok(())
    }
}

impl FeedConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.fanout_workers == 0 {
            return Err(AppError::Configuration(
                "fanout_workers must be at least 1".to_string(),
            ));
        }
        if self.fanout_batch_size == 0 {
            return Err(AppError::Configuration(
                "fanout_batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_feed_size == 0 {
            return Err(AppError::Configuration(
                "max_feed_size must be at least 1".to_string(),
            ));
        }
        if self.fanout_queue_capacity == 0 {
            return Err(AppError::Configuration(
                "fanout_queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
