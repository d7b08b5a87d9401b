use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("user {0} not found")]
    UserNotFound(i64),
    #[error("token {0} not found")]
    TokenNotFound(i64),
    #[error("token {token_id} quota is not enough, need {need}, have {have}")]
    InsufficientTokenQuota { token_id: i64, need: i64, have: i64 },
    #[error("store error: {0}")]
    Store(String),
}

/// Atomic add/subtract on user, token and channel balances. All writes go
/// through the backing store, which is responsible for atomicity across
/// relay instances.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    async fn get_user_quota(&self, user_id: i64) -> LedgerResult<i64>;

    /// Debit the user balance (pre-consume).
    async fn decrease_user_quota(&self, user_id: i64, amount: i64) -> LedgerResult<()>;

    /// Debit the token balance (pre-consume). Unlimited tokens accept any
    /// amount.
    async fn pre_consume_token_quota(&self, token_id: i64, amount: i64) -> LedgerResult<()>;

    /// Post a settlement delta to both the token and user balances. A
    /// negative delta is a credit (refund).
    async fn post_consume_quota(&self, user_id: i64, token_id: i64, delta: i64)
    -> LedgerResult<()>;

    async fn update_user_used_quota(&self, user_id: i64, quota: i64) -> LedgerResult<()>;

    async fn update_channel_used_quota(&self, channel_id: i64, quota: i64) -> LedgerResult<()>;
}

#[derive(Debug, Default)]
struct LedgerState {
    user_quota: HashMap<i64, i64>,
    token_quota: HashMap<i64, i64>,
    user_used: HashMap<i64, i64>,
    channel_used: HashMap<i64, i64>,
}

/// In-memory ledger for standalone mode and tests.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_user_quota(&self, user_id: i64, quota: i64) {
        self.state
            .lock()
            .expect("ledger lock")
            .user_quota
            .insert(user_id, quota);
    }

    pub fn set_token_quota(&self, token_id: i64, quota: i64) {
        self.state
            .lock()
            .expect("ledger lock")
            .token_quota
            .insert(token_id, quota);
    }

    pub fn user_quota(&self, user_id: i64) -> i64 {
        self.state
            .lock()
            .expect("ledger lock")
            .user_quota
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn token_quota(&self, token_id: i64) -> i64 {
        self.state
            .lock()
            .expect("ledger lock")
            .token_quota
            .get(&token_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn user_used_quota(&self, user_id: i64) -> i64 {
        self.state
            .lock()
            .expect("ledger lock")
            .user_used
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn channel_used_quota(&self, channel_id: i64) -> i64 {
        self.state
            .lock()
            .expect("ledger lock")
            .channel_used
            .get(&channel_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl QuotaLedger for MemoryLedger {
    async fn get_user_quota(&self, user_id: i64) -> LedgerResult<i64> {
        let state = self.state.lock().expect("ledger lock");
        state
            .user_quota
            .get(&user_id)
            .copied()
            .ok_or(LedgerError::UserNotFound(user_id))
    }

    async fn decrease_user_quota(&self, user_id: i64, amount: i64) -> LedgerResult<()> {
        let mut state = self.state.lock().expect("ledger lock");
        let balance = state
            .user_quota
            .get_mut(&user_id)
            .ok_or(LedgerError::UserNotFound(user_id))?;
        *balance -= amount;
        Ok(())
    }

    async fn pre_consume_token_quota(&self, token_id: i64, amount: i64) -> LedgerResult<()> {
        let mut state = self.state.lock().expect("ledger lock");
        let balance = state
            .token_quota
            .get_mut(&token_id)
            .ok_or(LedgerError::TokenNotFound(token_id))?;
        if *balance < amount {
            return Err(LedgerError::InsufficientTokenQuota {
                token_id,
                need: amount,
                have: *balance,
            });
        }
        *balance -= amount;
        Ok(())
    }

    async fn post_consume_quota(
        &self,
        user_id: i64,
        token_id: i64,
        delta: i64,
    ) -> LedgerResult<()> {
        let mut state = self.state.lock().expect("ledger lock");
        if let Some(balance) = state.token_quota.get_mut(&token_id) {
            *balance -= delta;
        }
        let balance = state
            .user_quota
            .get_mut(&user_id)
            .ok_or(LedgerError::UserNotFound(user_id))?;
        *balance -= delta;
        Ok(())
    }

    async fn update_user_used_quota(&self, user_id: i64, quota: i64) -> LedgerResult<()> {
        let mut state = self.state.lock().expect("ledger lock");
        *state.user_used.entry(user_id).or_insert(0) += quota;
        Ok(())
    }

    async fn update_channel_used_quota(&self, channel_id: i64, quota: i64) -> LedgerResult<()> {
        let mut state = self.state.lock().expect("ledger lock");
        *state.channel_used.entry(channel_id).or_insert(0) += quota;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pre_consume_and_refund_round_trip() {
        let ledger = MemoryLedger::new();
        ledger.set_user_quota(1, 1000);
        ledger.set_token_quota(2, 1000);

        ledger.pre_consume_token_quota(2, 100).await.unwrap();
        ledger.decrease_user_quota(1, 100).await.unwrap();
        assert_eq!(ledger.user_quota(1), 900);
        assert_eq!(ledger.token_quota(2), 900);

        // refund is a negative settlement delta
        ledger.post_consume_quota(1, 2, -100).await.unwrap();
        assert_eq!(ledger.user_quota(1), 1000);
        assert_eq!(ledger.token_quota(2), 1000);
    }

    #[tokio::test]
    async fn token_quota_is_checked() {
        let ledger = MemoryLedger::new();
        ledger.set_token_quota(2, 10);
        let err = ledger.pre_consume_token_quota(2, 100).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientTokenQuota { need: 100, have: 10, .. }
        ));
        assert_eq!(ledger.token_quota(2), 10);
    }
}
