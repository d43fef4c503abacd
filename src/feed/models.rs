use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{PostId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostType {
    Text,
    Image,
    Video,
    Comment,
    Share,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Friend,
    Follow,
    Block,
    Mute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Like,
    Comment,
    Share,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub username: String,
    pub email: Option<String>,
    pub profile_picture_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub post_id: PostId,
    pub author_id: UserId,
    pub content: String,
    pub post_type: PostType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    /// Feed-index score: creation time in milliseconds.
    pub fn score_ms(&self) -> i64 {
        self.created_at.timestamp_millis()
    }
}

/// Directed edge between two users. The `(user_id, friend_id)` pair is
/// unique; the latest write for the pair wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub relationship_id: u64,
    pub user_id: UserId,
    pub friend_id: UserId,
    pub relationship_type: RelationshipType,
    pub created_at: DateTime<Utc>,
}

/// A user's action on a post. The `(user_id, post_id, action_type)` triple
/// is unique; creation is idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub action_id: u64,
    pub user_id: UserId,
    pub post_id: PostId,
    pub action_type: ActionType,
    pub created_at: DateTime<Utc>,
}

/// Feed payload: the post plus author info, action counters, and whether the
/// requesting user liked it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedPost {
    pub post: Post,
    pub username: Option<String>,
    pub profile_picture_url: Option<String>,
    pub like_count: u64,
    pub comment_count: u64,
    pub share_count: u64,
    pub liked_by_me: bool,
}
