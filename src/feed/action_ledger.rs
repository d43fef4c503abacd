use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::core::snowflake::SnowflakeGenerator;
use crate::core::{PostId, UserId};
use crate::error::AppResult;
use crate::feed::models::{Action, ActionType};

#[derive(Debug, Default)]
struct LedgerInner {
    /// `(user, post, type)` -> action row. The triple is unique.
    actions: HashMap<(UserId, PostId, ActionType), Action>,
    /// Counters kept in lockstep with the rows; rebuildable by sweeping.
    counters: HashMap<(PostId, ActionType), u64>,
}

/// Likes/comments/shares with authoritative per-post counters.
#[derive(Debug)]
pub struct ActionLedger {
    allocator: Arc<SnowflakeGenerator>,
    inner: RwLock<LedgerInner>,
}

impl ActionLedger {
    pub fn new(allocator: Arc<SnowflakeGenerator>) -> Self {
        Self {
            allocator,
            inner: RwLock::new(LedgerInner::default()),
        }
    }

    /// Record an action. Idempotent: repeating the same `(user, post, type)`
    /// changes nothing and returns `false`.
    pub async fn add_action(
        &self,
        user_id: UserId,
        post_id: PostId,
        action_type: ActionType,
    ) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.actions.contains_key(&(user_id, post_id, action_type)) {
            debug!(user_id, post_id, ?action_type, "action already recorded");
            return Ok(false);
        }

        let action = Action {
            action_id: self.allocator.next_id()?,
            user_id,
            post_id,
            action_type,
            created_at: Utc::now(),
        };
        inner.actions.insert((user_id, post_id, action_type), action);
        *inner.counters.entry((post_id, action_type)).or_insert(0) += 1;
        info!(user_id, post_id, ?action_type, "action recorded");
        Ok(true)
    }

    /// Remove an action, decrementing its counter. Returns whether it existed.
    pub async fn remove_action(
        &self,
        user_id: UserId,
        post_id: PostId,
        action_type: ActionType,
    ) -> bool {
        let mut inner = self.inner.write().await;
        if inner
            .actions
            .remove(&(user_id, post_id, action_type))
            .is_none()
        {
            return false;
        }
        if let Some(count) = inner.counters.get_mut(&(post_id, action_type)) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.counters.remove(&(post_id, action_type));
            }
        }
        info!(user_id, post_id, ?action_type, "action removed");
        true
    }

    pub async fn count(&self, post_id: PostId, action_type: ActionType) -> u64 {
        self.inner
            .read()
            .await
            .counters
            .get(&(post_id, action_type))
            .copied()
            .unwrap_or(0)
    }

    pub async fn has_action(
        &self,
        user_id: UserId,
        post_id: PostId,
        action_type: ActionType,
    ) -> bool {
        self.inner
            .read()
            .await
            .actions
            .contains_key(&(user_id, post_id, action_type))
    }

    /// Actions on a post, optionally filtered by type, oldest first.
    pub async fn actions(&self, post_id: PostId, filter: Option<ActionType>) -> Vec<Action> {
        let inner = self.inner.read().await;
        let mut actions: Vec<Action> = inner
            .actions
            .values()
            .filter(|action| {
                action.post_id == post_id
                    && filter.map(|t| action.action_type == t).unwrap_or(true)
            })
            .cloned()
            .collect();
        actions.sort_by_key(|action| action.action_id);
        actions
    }

    /// Deletion cascade: drop every action row for a post along with its
    /// counters. Returns the number of rows removed.
    pub async fn remove_post_actions(&self, post_id: PostId) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.actions.len();
        inner.actions.retain(|(_, post, _), _| *post != post_id);
        inner.counters.retain(|(post, _), _| *post != post_id);
        before - inner.actions.len()
    }

    /// Recompute counters from the action rows. The result must match the
    /// live counters; tests use it as an oracle.
    pub async fn rebuild_counters(&self) -> HashMap<(PostId, ActionType), u64> {
        let inner = self.inner.read().await;
        let mut rebuilt: HashMap<(PostId, ActionType), u64> = HashMap::new();
        for (_, post_id, action_type) in inner.actions.keys() {
            *rebuilt.entry((*post_id, *action_type)).or_insert(0) += 1;
        }
        rebuilt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> ActionLedger {
        ActionLedger::new(Arc::new(SnowflakeGenerator::new(0, 3, 0).unwrap()))
    }

    #[tokio::test]
    async fn add_action_is_idempotent() {
        let ledger = ledger();
        for expect_change in [true, false, false] {
            let changed = ledger.add_action(1, 10, ActionType::Like).await.unwrap();
            assert_eq!(changed, expect_change);
        }
        assert_eq!(ledger.count(10, ActionType::Like).await, 1);
        assert_eq!(ledger.actions(10, Some(ActionType::Like)).await.len(), 1);
    }

    #[tokio::test]
    async fn remove_decrements_counter() {
        let ledger = ledger();
        ledger.add_action(1, 10, ActionType::Like).await.unwrap();
        ledger.add_action(2, 10, ActionType::Like).await.unwrap();
        assert_eq!(ledger.count(10, ActionType::Like).await, 2);

        assert!(ledger.remove_action(1, 10, ActionType::Like).await);
        assert!(!ledger.remove_action(1, 10, ActionType::Like).await);
        assert_eq!(ledger.count(10, ActionType::Like).await, 1);
        assert!(!ledger.has_action(1, 10, ActionType::Like).await);
        assert!(ledger.has_action(2, 10, ActionType::Like).await);
    }

    #[tokio::test]
    async fn counters_match_rebuilt_counters() {
        let ledger = ledger();
        for user in 1..=4 {
            ledger.add_action(user, 10, ActionType::Like).await.unwrap();
        }
        ledger.add_action(1, 10, ActionType::Share).await.unwrap();
        ledger.remove_action(2, 10, ActionType::Like).await;

        let rebuilt = ledger.rebuild_counters().await;
        assert_eq!(rebuilt.get(&(10, ActionType::Like)), Some(&3));
        assert_eq!(rebuilt.get(&(10, ActionType::Share)), Some(&1));
        assert_eq!(ledger.count(10, ActionType::Like).await, 3);
        assert_eq!(ledger.count(10, ActionType::Share).await, 1);
    }

    #[tokio::test]
    async fn post_deletion_cascade_removes_rows_and_counters() {
        let ledger = ledger();
        ledger.add_action(1, 10, ActionType::Like).await.unwrap();
        ledger.add_action(2, 10, ActionType::Comment).await.unwrap();
        ledger.add_action(1, 11, ActionType::Like).await.unwrap();

        assert_eq!(ledger.remove_post_actions(10).await, 2);
        assert_eq!(ledger.count(10, ActionType::Like).await, 0);
        assert_eq!(ledger.count(10, ActionType::Comment).await, 0);
        assert_eq!(ledger.count(11, ActionType::Like).await, 1);
    }

    #[tokio::test]
    async fn actions_filter_by_type() {
        let ledger = ledger();
        ledger.add_action(1, 10, ActionType::Like).await.unwrap();
        ledger.add_action(1, 10, ActionType::Share).await.unwrap();

        assert_eq!(ledger.actions(10, None).await.len(), 2);
        assert_eq!(ledger.actions(10, Some(ActionType::Share)).await.len(), 1);
    }
}
