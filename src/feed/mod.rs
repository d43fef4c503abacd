// News feed engine: social graph, post catalog, fanout, and feed indexes.

pub mod action_ledger;
pub mod content_cache;
pub mod engine;
pub mod fanout;
pub mod feed_index;
pub mod models;
pub mod post_catalog;
pub mod social_graph;
pub mod users;

pub use action_ledger::ActionLedger;
pub use content_cache::{ContentCache, ContentCacheConfig};
pub use engine::FeedEngine;
pub use fanout::{FanoutDispatcher, FanoutStats, FanoutTask};
pub use feed_index::FeedIndex;
pub use models::{
    Action, ActionType, EnrichedPost, Post, PostType, Relationship, RelationshipType, User,
};
pub use post_catalog::PostCatalog;
pub use social_graph::SocialGraph;
pub use users::UserRegistry;
