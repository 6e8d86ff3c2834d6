//! Cross-drop loyalty ledger: tier from lifetime participation, streak
//! from consecutive drops, combined into a ticket multiplier.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::actor::ObjectLocks;
use crate::error::Result;
use crate::store::Store;
use crate::types::{
    DropId, LoyaltyTier, MAX_LOYALTY_MULTIPLIER, Millis, STREAK_BONUS, STREAK_THRESHOLD, UserId,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoyaltyState {
    pub drops_participated: BTreeSet<DropId>,
    pub current_streak: u32,
    pub last_updated: Millis,
}

/// Derived view handed to registration and projections.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoyaltySnapshot {
    pub tier: LoyaltyTier,
    pub multiplier: f64,
    pub drops_participated: usize,
    pub current_streak: u32,
}

fn snapshot_of(state: &LoyaltyState) -> LoyaltySnapshot {
    let tier = LoyaltyTier::from_participation(state.drops_participated.len());
    let streak_bonus = if state.current_streak >= STREAK_THRESHOLD {
        STREAK_BONUS
    } else {
        0.0
    };
    LoyaltySnapshot {
        tier,
        multiplier: (tier.multiplier() + streak_bonus).min(MAX_LOYALTY_MULTIPLIER),
        drops_participated: state.drops_participated.len(),
        current_streak: state.current_streak,
    }
}

pub struct Loyalty {
    store: Arc<Store>,
    locks: Arc<ObjectLocks>,
}

fn key(user_id: &str) -> String {
    format!("loyalty:{user_id}")
}

impl Loyalty {
    pub fn new(store: Arc<Store>, locks: Arc<ObjectLocks>) -> Self {
        Self { store, locks }
    }

    fn load(&self, user_id: &str) -> Result<LoyaltyState> {
        Ok(self.store.get_object(&key(user_id))?.unwrap_or_default())
    }

    /// Multiplier to apply at registration time.
    pub async fn snapshot(&self, user_id: &UserId) -> Result<LoyaltySnapshot> {
        Ok(snapshot_of(&self.load(user_id)?))
    }

    /// Record that the user took part in a drop's lottery. Counted once
    /// per drop; the streak increments only on new drops.
    pub async fn record_participation(
        &self,
        user_id: &UserId,
        drop_id: &DropId,
        now: Millis,
    ) -> Result<LoyaltySnapshot> {
        let _guard = self.locks.lock(&key(user_id)).await;
        let mut state = self.load(user_id)?;
        if state.drops_participated.insert(drop_id.clone()) {
            state.current_streak += 1;
            state.last_updated = now;
            self.store.put_object(&key(user_id), &state)?;
            debug!(
                "loyalty: {user_id} now {} drops, streak {}",
                state.drops_participated.len(),
                state.current_streak
            );
        }
        Ok(snapshot_of(&state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loyalty() -> Loyalty {
        Loyalty::new(Arc::new(Store::temp()), Arc::new(ObjectLocks::new()))
    }

    #[tokio::test]
    async fn test_fresh_user_is_bronze() {
        let l = loyalty();
        let snap = l.snapshot(&"alice".to_string()).await.unwrap();
        assert_eq!(snap.tier, LoyaltyTier::Bronze);
        assert_eq!(snap.multiplier, 1.0);
        assert_eq!(snap.current_streak, 0);
    }

    #[tokio::test]
    async fn test_participation_advances_tier() {
        let l = loyalty();
        let user = "alice".to_string();
        for i in 0..3 {
            l.record_participation(&user, &format!("d{i}"), i).await.unwrap();
        }
        let snap = l.snapshot(&user).await.unwrap();
        assert_eq!(snap.tier, LoyaltyTier::Silver);
        assert_eq!(snap.drops_participated, 3);
    }

    #[tokio::test]
    async fn test_streak_bonus_applies_at_threshold() {
        let l = loyalty();
        let user = "alice".to_string();
        for i in 0..STREAK_THRESHOLD {
            l.record_participation(&user, &format!("d{i}"), i as Millis)
                .await
                .unwrap();
        }
        let snap = l.snapshot(&user).await.unwrap();
        assert_eq!(snap.current_streak, STREAK_THRESHOLD);
        assert_eq!(snap.multiplier, LoyaltyTier::Silver.multiplier() + STREAK_BONUS);
    }

    #[tokio::test]
    async fn test_same_drop_counted_once() {
        let l = loyalty();
        let user = "alice".to_string();
        let drop = "d1".to_string();
        l.record_participation(&user, &drop, 1).await.unwrap();
        let snap = l.record_participation(&user, &drop, 2).await.unwrap();
        assert_eq!(snap.drops_participated, 1);
        assert_eq!(snap.current_streak, 1);
    }

    #[tokio::test]
    async fn test_multiplier_capped() {
        let l = loyalty();
        let user = "alice".to_string();
        for i in 0..40 {
            l.record_participation(&user, &format!("d{i}"), i).await.unwrap();
        }
        let snap = l.snapshot(&user).await.unwrap();
        assert_eq!(snap.tier, LoyaltyTier::Platinum);
        assert!(snap.multiplier <= MAX_LOYALTY_MULTIPLIER);
    }
}
