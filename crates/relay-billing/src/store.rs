use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::log::ConsumeLog;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("user {0} not found")]
    UserNotFound(i64),
    #[error("token {0} not found")]
    TokenNotFound(i64),
    #[error("token {token_id} quota is not enough")]
    InsufficientTokenQuota { token_id: i64 },
    #[error("user {user_id} quota is not enough")]
    InsufficientUserQuota { user_id: i64 },
    #[error("quota store error: {0}")]
    Backend(String),
}

/// Durable balances and the consume log.
///
/// The ledger's balance cache sits in front of it; every write here is a single
/// atomic step on the store side.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn user_quota(&self, user_id: i64) -> StoreResult<i64>;

    /// Reserve `quota` on a token and its owner. Refused when either balance
    /// is short; unlimited tokens only check the owner.
    async fn pre_consume_token(&self, token_id: i64, quota: i64) -> StoreResult<()>;

    /// Apply `delta` to a token and its owner: positive consumes, negative
    /// returns quota.
    async fn post_consume_token(&self, token_id: i64, delta: i64) -> StoreResult<()>;

    async fn append_consume_log(&self, log: ConsumeLog) -> StoreResult<()>;

    /// Bump the used-quota and request counters of a user and a channel.
    async fn record_usage(&self, user_id: i64, channel_id: i64, quota: i64) -> StoreResult<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserAccount {
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAccount {
    pub user_id: i64,
    pub remain_quota: i64,
    pub used_quota: i64,
    pub unlimited_quota: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<i64, UserAccount>,
    tokens: HashMap<i64, TokenAccount>,
    channel_used: HashMap<i64, i64>,
    logs: Vec<ConsumeLog>,
}

/// In-process store for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    state: Mutex<MemoryState>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store poisoned".to_string()))
    }

    pub fn insert_user(&self, user_id: i64, quota: i64) {
        if let Ok(mut state) = self.lock() {
            state.users.insert(
                user_id,
                UserAccount {
                    quota,
                    ..UserAccount::default()
                },
            );
        }
    }

    pub fn insert_token(&self, token_id: i64, user_id: i64, remain_quota: i64, unlimited: bool) {
        if let Ok(mut state) = self.lock() {
            state.tokens.insert(
                token_id,
                TokenAccount {
                    user_id,
                    remain_quota,
                    used_quota: 0,
                    unlimited_quota: unlimited,
                },
            );
        }
    }

    pub fn user(&self, user_id: i64) -> Option<UserAccount> {
        self.lock().ok()?.users.get(&user_id).cloned()
    }

    pub fn token(&self, token_id: i64) -> Option<TokenAccount> {
        self.lock().ok()?.tokens.get(&token_id).cloned()
    }

    pub fn channel_used_quota(&self, channel_id: i64) -> i64 {
        self.lock()
            .ok()
            .and_then(|state| state.channel_used.get(&channel_id).copied())
            .unwrap_or(0)
    }

    pub fn consume_logs(&self) -> Vec<ConsumeLog> {
        self.lock()
            .map(|state| state.logs.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn user_quota(&self, user_id: i64) -> StoreResult<i64> {
        let state = self.lock()?;
        state
            .users
            .get(&user_id)
            .map(|user| user.quota)
            .ok_or(StoreError::UserNotFound(user_id))
    }

    async fn pre_consume_token(&self, token_id: i64, quota: i64) -> StoreResult<()> {
        if quota < 0 {
            return Err(StoreError::Backend("negative reservation".to_string()));
        }
        let mut state = self.lock()?;
        let token = state
            .tokens
            .get(&token_id)
            .cloned()
            .ok_or(StoreError::TokenNotFound(token_id))?;
        if !token.unlimited_quota && token.remain_quota < quota {
            return Err(StoreError::InsufficientTokenQuota { token_id });
        }
        let user = state
            .users
            .get_mut(&token.user_id)
            .ok_or(StoreError::UserNotFound(token.user_id))?;
        if user.quota < quota {
            return Err(StoreError::InsufficientUserQuota {
                user_id: token.user_id,
            });
        }
        user.quota -= quota;
        if let Some(token) = state.tokens.get_mut(&token_id) {
            token.remain_quota -= quota;
            token.used_quota += quota;
        }
        Ok(())
    }

    async fn post_consume_token(&self, token_id: i64, delta: i64) -> StoreResult<()> {
        let mut state = self.lock()?;
        let token = state
            .tokens
            .get_mut(&token_id)
            .ok_or(StoreError::TokenNotFound(token_id))?;
        if !token.unlimited_quota {
            token.remain_quota -= delta;
        }
        token.used_quota += delta;
        let user_id = token.user_id;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or(StoreError::UserNotFound(user_id))?;
        user.quota -= delta;
        Ok(())
    }

    async fn append_consume_log(&self, log: ConsumeLog) -> StoreResult<()> {
        self.lock()?.logs.push(log);
        Ok(())
    }

    async fn record_usage(&self, user_id: i64, channel_id: i64, quota: i64) -> StoreResult<()> {
        let mut state = self.lock()?;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or(StoreError::UserNotFound(user_id))?;
        user.used_quota += quota;
        user.request_count += 1;
        *state.channel_used.entry(channel_id).or_default() += quota;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reservation_checks_token_and_user() {
        let store = MemoryQuotaStore::new();
        store.insert_user(1, 100);
        store.insert_token(10, 1, 50, false);
        store.insert_token(11, 1, 0, true);

        assert_eq!(
            store.pre_consume_token(10, 60).await,
            Err(StoreError::InsufficientTokenQuota { token_id: 10 })
        );
        store.pre_consume_token(10, 40).await.expect("reserve");
        assert_eq!(store.user_quota(1).await, Ok(60));
        assert_eq!(store.token(10).map(|t| t.remain_quota), Some(10));

        assert_eq!(
            store.pre_consume_token(11, 70).await,
            Err(StoreError::InsufficientUserQuota { user_id: 1 })
        );
        store.pre_consume_token(11, 60).await.expect("unlimited token");
        assert_eq!(store.user_quota(1).await, Ok(0));
    }

    #[tokio::test]
    async fn negative_delta_returns_quota() {
        let store = MemoryQuotaStore::new();
        store.insert_user(1, 100);
        store.insert_token(10, 1, 100, false);
        store.pre_consume_token(10, 30).await.expect("reserve");
        store.post_consume_token(10, -30).await.expect("refund");
        assert_eq!(store.user_quota(1).await, Ok(100));
        assert_eq!(store.token(10).map(|t| t.remain_quota), Some(100));
    }

    #[tokio::test]
    async fn usage_counters_accumulate() {
        let store = MemoryQuotaStore::new();
        store.insert_user(1, 0);
        store.record_usage(1, 7, 12).await.expect("record");
        store.record_usage(1, 7, 3).await.expect("record");
        let user = store.user(1).expect("user");
        assert_eq!(user.used_quota, 15);
        assert_eq!(user.request_count, 2);
        assert_eq!(store.channel_used_quota(7), 15);
    }
}
