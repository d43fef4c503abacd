use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::core::snowflake::SnowflakeGenerator;
use crate::core::UserId;
use crate::error::{AppError, AppResult};
use crate::feed::models::{Relationship, RelationshipType};

#[derive(Debug, Default)]
struct GraphInner {
    /// `(user, friend)` -> edge; the pair is unique, latest write wins.
    edges: HashMap<(UserId, UserId), Relationship>,
    /// author -> users with a FOLLOW edge toward them.
    followers: HashMap<UserId, BTreeSet<UserId>>,
}

impl GraphInner {
    fn index_follow(&mut self, user: UserId, friend: UserId, rtype: RelationshipType) {
        if rtype == RelationshipType::Follow {
            self.followers.entry(friend).or_default().insert(user);
        }
    }

    fn unindex_follow(&mut self, user: UserId, friend: UserId, rtype: RelationshipType) {
        if rtype == RelationshipType::Follow {
            if let Some(set) = self.followers.get_mut(&friend) {
                set.remove(&user);
                if set.is_empty() {
                    self.followers.remove(&friend);
                }
            }
        }
    }
}

/// Directed relationship edges between users, with a maintained follower
/// index so fanout never scans the whole edge table.
#[derive(Debug)]
pub struct SocialGraph {
    allocator: Arc<SnowflakeGenerator>,
    inner: RwLock<GraphInner>,
}

impl SocialGraph {
    pub fn new(allocator: Arc<SnowflakeGenerator>) -> Self {
        Self {
            allocator,
            inner: RwLock::new(GraphInner::default()),
        }
    }

    /// Idempotent upsert of the `(user, friend)` edge. Returns whether any
    /// state changed.
    pub async fn add_relationship(
        &self,
        user: UserId,
        friend: UserId,
        rtype: RelationshipType,
    ) -> AppResult<bool> {
        if user == friend {
            return Err(AppError::InvalidArgument(
                "users cannot have a relationship with themselves".to_string(),
            ));
        }

        let mut inner = self.inner.write().await;
        let existing = inner
            .edges
            .get(&(user, friend))
            .map(|edge| edge.relationship_type);
        if let Some(old_type) = existing {
            if old_type == rtype {
                debug!(user, friend, ?rtype, "relationship already present");
                return Ok(false);
            }
            inner.unindex_follow(user, friend, old_type);
            inner.index_follow(user, friend, rtype);
            if let Some(edge) = inner.edges.get_mut(&(user, friend)) {
                edge.relationship_type = rtype;
            }
            info!(user, friend, from = ?old_type, to = ?rtype, "relationship retyped");
            return Ok(true);
        }

        let relationship = Relationship {
            relationship_id: self.allocator.next_id()?,
            user_id: user,
            friend_id: friend,
            relationship_type: rtype,
            created_at: Utc::now(),
        };
        inner.index_follow(user, friend, rtype);
        inner.edges.insert((user, friend), relationship);
        info!(user, friend, ?rtype, "relationship created");
        Ok(true)
    }

    pub async fn relationship_type(
        &self,
        user: UserId,
        friend: UserId,
    ) -> Option<RelationshipType> {
        self.inner
            .read()
            .await
            .edges
            .get(&(user, friend))
            .map(|edge| edge.relationship_type)
    }

    pub async fn get_relationship(&self, user: UserId, friend: UserId) -> Option<Relationship> {
        self.inner.read().await.edges.get(&(user, friend)).cloned()
    }

    /// Users following `user`, in ascending id order.
    pub async fn followers(&self, user: UserId) -> Vec<UserId> {
        self.inner
            .read()
            .await
            .followers
            .get(&user)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn follower_count(&self, user: UserId) -> usize {
        self.inner
            .read()
            .await
            .followers
            .get(&user)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    /// Outgoing edges of `user` with the given type.
    pub async fn friends_by_type(&self, user: UserId, rtype: RelationshipType) -> Vec<UserId> {
        let inner = self.inner.read().await;
        let mut friends: Vec<UserId> = inner
            .edges
            .iter()
            .filter(|((from, _), edge)| *from == user && edge.relationship_type == rtype)
            .map(|((_, to), _)| *to)
            .collect();
        friends.sort_unstable();
        friends
    }

    /// Remove the `(user, friend)` edge. Returns whether it existed.
    pub async fn delete_relationship(&self, user: UserId, friend: UserId) -> bool {
        let mut inner = self.inner.write().await;
        match inner.edges.remove(&(user, friend)) {
            Some(edge) => {
                inner.unindex_follow(user, friend, edge.relationship_type);
                info!(user, friend, "relationship deleted");
                true
            }
            None => false,
        }
    }
}
