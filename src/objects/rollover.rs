//! Cross-drop rollover ledger.
//!
//! Users who paid for extra tickets and lost (or won and let the window
//! lapse) carry credit into later drops. The balance is capped so a
//! serial loser cannot stockpile unbounded weight.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::actor::ObjectLocks;
use crate::error::Result;
use crate::store::Store;
use crate::types::{MAX_ROLLOVER, Millis, UserId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloverState {
    pub balance: u32,
    pub last_updated: Millis,
}

pub struct Rollovers {
    store: Arc<Store>,
    locks: Arc<ObjectLocks>,
}

fn key(user_id: &str) -> String {
    format!("rollover:{user_id}")
}

impl Rollovers {
    pub fn new(store: Arc<Store>, locks: Arc<ObjectLocks>) -> Self {
        Self { store, locks }
    }

    fn load(&self, user_id: &str) -> Result<RolloverState> {
        Ok(self.store.get_object(&key(user_id))?.unwrap_or_default())
    }

    /// Grant `amount` entries, clamped at the ledger cap.
    /// Returns the new balance.
    pub async fn add(&self, user_id: &UserId, amount: u32, now: Millis) -> Result<u32> {
        if amount == 0 {
            return self.balance(user_id).await;
        }
        let _guard = self.locks.lock(&key(user_id)).await;
        let mut state = self.load(user_id)?;
        state.balance = (state.balance + amount).min(MAX_ROLLOVER);
        state.last_updated = now;
        self.store.put_object(&key(user_id), &state)?;
        debug!("rollover: {user_id} +{amount} -> {}", state.balance);
        Ok(state.balance)
    }

    /// Consume up to `want` entries at registration.
    /// Returns the amount actually consumed.
    pub async fn consume(&self, user_id: &UserId, want: u32, now: Millis) -> Result<u32> {
        if want == 0 {
            return Ok(0);
        }
        let _guard = self.locks.lock(&key(user_id)).await;
        let mut state = self.load(user_id)?;
        let used = state.balance.min(want);
        if used > 0 {
            state.balance -= used;
            state.last_updated = now;
            self.store.put_object(&key(user_id), &state)?;
            debug!("rollover: {user_id} -{used} -> {}", state.balance);
        }
        Ok(used)
    }

    pub async fn balance(&self, user_id: &UserId) -> Result<u32> {
        Ok(self.load(user_id)?.balance)
    }

    pub async fn reset(&self, user_id: &UserId, now: Millis) -> Result<()> {
        let _guard = self.locks.lock(&key(user_id)).await;
        let state = RolloverState {
            balance: 0,
            last_updated: now,
        };
        self.store.put_object(&key(user_id), &state)?;
        Ok(())
    }
}
