//! Per-(drop, user) participant state machine.
//!
//! ```text
//! not_registered --set_registered--> registered
//! registered     --notify_result(win)--> winner
//! registered     --notify_result(lose)--> loser          (grants rollover)
//! registered     --notify_backup--> backup_winner
//! winner         --set_token--> winner (token attached)
//! winner         --complete_purchase--> purchased
//! winner         --notify_expiry--> expired              (grants half rollover)
//! backup_winner  --notify_promotion--> winner
//! ```
//!
//! Any other transition is a no-op reporting failure — late or
//! duplicated notifications from the drop machine must never corrupt a
//! settled participant.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use crate::actor::ObjectLocks;
use crate::bus::{Bus, topics};
use crate::error::{Error, Result};
use crate::objects::rollover::Rollovers;
use crate::store::Store;
use crate::token::PurchaseTokens;
use crate::types::{DropId, EXPIRED_ROLLOVER_PERCENT, LoyaltyTier, Millis, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    #[default]
    NotRegistered,
    Registered,
    Winner,
    BackupWinner,
    Loser,
    Purchased,
    Expired,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantStatus::NotRegistered => "not_registered",
            ParticipantStatus::Registered => "registered",
            ParticipantStatus::Winner => "winner",
            ParticipantStatus::BackupWinner => "backup_winner",
            ParticipantStatus::Loser => "loser",
            ParticipantStatus::Purchased => "purchased",
            ParticipantStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantState {
    pub status: ParticipantStatus,
    pub tickets: u32,
    pub effective_tickets: u64,
    pub rollover_used: u32,
    pub paid_entries: u32,
    pub win_position: Option<u32>,
    pub backup_position: Option<u32>,
    pub purchase_token: Option<String>,
    pub expires_at: Option<Millis>,
    pub loyalty_tier: Option<LoyaltyTier>,
    pub loyalty_multiplier: Option<f64>,
    pub updated_at: Millis,
}

impl ParticipantState {
    /// Client-facing view. The purchase token is included — it only
    /// travels on the owner's user topic.
    pub fn projection(&self) -> serde_json::Value {
        json!({
            "status": self.status.as_str(),
            "tickets": self.tickets,
            "effectiveTickets": self.effective_tickets,
            "rolloverUsed": self.rollover_used,
            "paidEntries": self.paid_entries,
            "winPosition": self.win_position,
            "backupPosition": self.backup_position,
            "purchaseToken": self.purchase_token,
            "expiresAt": self.expires_at,
            "loyaltyTier": self.loyalty_tier.map(|t| t.as_str()),
            "loyaltyMultiplier": self.loyalty_multiplier,
        })
    }
}

/// Registration facts recorded on the participant at admission.
#[derive(Debug, Clone)]
pub struct RegistrationRecord {
    pub tickets: u32,
    pub effective_tickets: u64,
    pub rollover_used: u32,
    pub paid_entries: u32,
    pub loyalty_tier: LoyaltyTier,
    pub loyalty_multiplier: f64,
}

pub struct Participants {
    store: Arc<Store>,
    locks: Arc<ObjectLocks>,
    bus: Arc<Bus>,
    rollovers: Arc<Rollovers>,
    tokens: Arc<PurchaseTokens>,
}

fn key(drop_id: &str, user_id: &str) -> String {
    format!("participant:{drop_id}:{user_id}")
}

impl Participants {
    pub fn new(
        store: Arc<Store>,
        locks: Arc<ObjectLocks>,
        bus: Arc<Bus>,
        rollovers: Arc<Rollovers>,
        tokens: Arc<PurchaseTokens>,
    ) -> Self {
        Self {
            store,
            locks,
            bus,
            rollovers,
            tokens,
        }
    }

    fn load(&self, drop_id: &str, user_id: &str) -> Result<ParticipantState> {
        Ok(self
            .store
            .get_object(&key(drop_id, user_id))?
            .unwrap_or_default())
    }

    fn persist_and_publish(
        &self,
        drop_id: &str,
        user_id: &str,
        state: &ParticipantState,
    ) -> Result<()> {
        self.store.put_object(&key(drop_id, user_id), state)?;
        self.bus.publish(
            &topics::drop_user(drop_id, user_id),
            "user",
            state.projection(),
        );
        Ok(())
    }

    pub async fn get_state(&self, drop_id: &DropId, user_id: &UserId) -> Result<ParticipantState> {
        self.load(drop_id, user_id)
    }

    /// not_registered → registered.
    pub async fn set_registered(
        &self,
        drop_id: &DropId,
        user_id: &UserId,
        record: RegistrationRecord,
        now: Millis,
    ) -> Result<bool> {
        let _guard = self.locks.lock(&key(drop_id, user_id)).await;
        let mut state = self.load(drop_id, user_id)?;
        if state.status != ParticipantStatus::NotRegistered {
            debug!("participant {drop_id}:{user_id}: set_registered in {:?}", state.status);
            return Ok(false);
        }

        state.status = ParticipantStatus::Registered;
        state.tickets = record.tickets;
        state.effective_tickets = record.effective_tickets;
        state.rollover_used = record.rollover_used;
        state.paid_entries = record.paid_entries;
        state.loyalty_tier = Some(record.loyalty_tier);
        state.loyalty_multiplier = Some(record.loyalty_multiplier);
        state.updated_at = now;
        self.persist_and_publish(drop_id, user_id, &state)?;
        Ok(true)
    }

    /// registered → winner | loser. A loss grants the paid entries back
    /// as rollover.
    pub async fn notify_result(
        &self,
        drop_id: &DropId,
        user_id: &UserId,
        is_winner: bool,
        position: Option<u32>,
        now: Millis,
    ) -> Result<bool> {
        let paid_entries;
        {
            let _guard = self.locks.lock(&key(drop_id, user_id)).await;
            let mut state = self.load(drop_id, user_id)?;
            if state.status != ParticipantStatus::Registered {
                debug!("participant {drop_id}:{user_id}: notify_result in {:?}", state.status);
                return Ok(false);
            }

            state.status = if is_winner {
                ParticipantStatus::Winner
            } else {
                ParticipantStatus::Loser
            };
            state.win_position = position;
            state.updated_at = now;
            paid_entries = state.paid_entries;
            self.persist_and_publish(drop_id, user_id, &state)?;
        }

        // rollover grant after the participant key is released; the
        // ledger is its own single-writer object
        if !is_winner && paid_entries > 0 {
            self.rollovers.add(user_id, paid_entries, now).await?;
        }
        Ok(true)
    }

    /// registered → backup_winner.
    pub async fn notify_backup(
        &self,
        drop_id: &DropId,
        user_id: &UserId,
        position: u32,
        total: u32,
        now: Millis,
    ) -> Result<bool> {
        let _guard = self.locks.lock(&key(drop_id, user_id)).await;
        let mut state = self.load(drop_id, user_id)?;
        if state.status != ParticipantStatus::Registered {
            debug!("participant {drop_id}:{user_id}: notify_backup in {:?}", state.status);
            return Ok(false);
        }

        state.status = ParticipantStatus::BackupWinner;
        state.backup_position = Some(position);
        state.updated_at = now;
        self.store.put_object(&key(drop_id, user_id), &state)?;
        self.bus.publish(
            &topics::drop_user(drop_id, user_id),
            "user",
            json!({
                "status": state.status.as_str(),
                "backupPosition": position,
                "backupTotal": total,
            }),
        );
        Ok(true)
    }

    /// Attach a purchase token to a winner.
    pub async fn set_token(
        &self,
        drop_id: &DropId,
        user_id: &UserId,
        token: String,
        expires_at: Millis,
        now: Millis,
    ) -> Result<bool> {
        let _guard = self.locks.lock(&key(drop_id, user_id)).await;
        let mut state = self.load(drop_id, user_id)?;
        if state.status != ParticipantStatus::Winner {
            debug!("participant {drop_id}:{user_id}: set_token in {:?}", state.status);
            return Ok(false);
        }

        state.purchase_token = Some(token);
        state.expires_at = Some(expires_at);
        state.updated_at = now;
        self.persist_and_publish(drop_id, user_id, &state)?;
        Ok(true)
    }

    /// backup_winner → winner. The caller follows up with set_token.
    pub async fn notify_promotion(
        &self,
        drop_id: &DropId,
        user_id: &UserId,
        now: Millis,
    ) -> Result<bool> {
        let _guard = self.locks.lock(&key(drop_id, user_id)).await;
        let mut state = self.load(drop_id, user_id)?;
        if state.status != ParticipantStatus::BackupWinner {
            debug!("participant {drop_id}:{user_id}: notify_promotion in {:?}", state.status);
            return Ok(false);
        }

        state.status = ParticipantStatus::Winner;
        state.backup_position = None;
        state.updated_at = now;
        self.persist_and_publish(drop_id, user_id, &state)?;
        info!("participant {drop_id}:{user_id}: promoted from backup");
        Ok(true)
    }

    /// winner → expired. Grants half the paid entries as rollover.
    pub async fn notify_expiry(
        &self,
        drop_id: &DropId,
        user_id: &UserId,
        now: Millis,
    ) -> Result<bool> {
        let grant;
        {
            let _guard = self.locks.lock(&key(drop_id, user_id)).await;
            let mut state = self.load(drop_id, user_id)?;
            if state.status != ParticipantStatus::Winner {
                debug!("participant {drop_id}:{user_id}: notify_expiry in {:?}", state.status);
                return Ok(false);
            }

            state.status = ParticipantStatus::Expired;
            state.purchase_token = None;
            state.expires_at = None;
            state.updated_at = now;
            grant = (state.paid_entries as f64 * EXPIRED_ROLLOVER_PERCENT).floor() as u32;
            self.persist_and_publish(drop_id, user_id, &state)?;
        }

        if grant > 0 {
            self.rollovers.add(user_id, grant, now).await?;
        }
        info!("participant {drop_id}:{user_id}: purchase window expired");
        Ok(true)
    }

    /// winner → purchased, gated on a valid unexpired token.
    /// Success is reported only after the state is durably written.
    pub async fn complete_purchase(
        &self,
        drop_id: &DropId,
        user_id: &UserId,
        token: &str,
        now: Millis,
    ) -> Result<()> {
        let _guard = self.locks.lock(&key(drop_id, user_id)).await;
        let mut state = self.load(drop_id, user_id)?;

        match state.status {
            ParticipantStatus::Purchased => return Err(Error::AlreadyPurchased),
            ParticipantStatus::Winner => {}
            _ => return Err(Error::NotWinner),
        }

        self.tokens.verify(drop_id, user_id, token, now)?;

        state.status = ParticipantStatus::Purchased;
        state.updated_at = now;
        self.persist_and_publish(drop_id, user_id, &state)?;
        info!("participant {drop_id}:{user_id}: purchased");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tickets: u32, paid: u32) -> RegistrationRecord {
        RegistrationRecord {
            tickets,
            effective_tickets: tickets as u64,
            rollover_used: 0,
            paid_entries: paid,
            loyalty_tier: LoyaltyTier::Bronze,
            loyalty_multiplier: 1.0,
        }
    }

    struct Fixture {
        participants: Participants,
        rollovers: Arc<Rollovers>,
        tokens: Arc<PurchaseTokens>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::temp());
        let locks = Arc::new(ObjectLocks::new());
        let bus = Arc::new(Bus::new());
        let rollovers = Arc::new(Rollovers::new(store.clone(), locks.clone()));
        let tokens = Arc::new(PurchaseTokens::new(b"test-secret".to_vec()));
        Fixture {
            participants: Participants::new(store, locks, bus, rollovers.clone(), tokens.clone()),
            rollovers,
            tokens,
        }
    }

    const DROP: &str = "d1";
    const USER: &str = "alice";

    #[tokio::test]
    async fn test_register_then_win_then_purchase() {
        let f = fixture();
        let drop = DROP.to_string();
        let user = USER.to_string();

        assert!(f.participants.set_registered(&drop, &user, record(2, 1), 1).await.unwrap());
        assert!(f.participants.notify_result(&drop, &user, true, Some(0), 2).await.unwrap());

        let token = f.tokens.generate(DROP, USER, 10_000);
        assert!(f.participants.set_token(&drop, &user, token.clone(), 10_000_000, 3).await.unwrap());

        f.participants.complete_purchase(&drop, &user, &token, 4).await.unwrap();
        let state = f.participants.get_state(&drop, &user).await.unwrap();
        assert_eq!(state.status, ParticipantStatus::Purchased);
    }

    #[tokio::test]
    async fn test_double_registration_rejected() {
        let f = fixture();
        let (drop, user) = (DROP.to_string(), USER.to_string());
        assert!(f.participants.set_registered(&drop, &user, record(1, 0), 1).await.unwrap());
        assert!(!f.participants.set_registered(&drop, &user, record(3, 2), 2).await.unwrap());
        let state = f.participants.get_state(&drop, &user).await.unwrap();
        assert_eq!(state.tickets, 1);
    }

    #[tokio::test]
    async fn test_loss_grants_paid_entries() {
        let f = fixture();
        let (drop, user) = (DROP.to_string(), USER.to_string());
        f.participants.set_registered(&drop, &user, record(3, 2), 1).await.unwrap();
        f.participants.notify_result(&drop, &user, false, None, 2).await.unwrap();
        assert_eq!(f.rollovers.balance(&user).await.unwrap(), 2);
        let state = f.participants.get_state(&drop, &user).await.unwrap();
        assert_eq!(state.status, ParticipantStatus::Loser);
    }

    #[tokio::test]
    async fn test_expiry_grants_half_paid() {
        let f = fixture();
        let (drop, user) = (DROP.to_string(), USER.to_string());
        f.participants.set_registered(&drop, &user, record(4, 3), 1).await.unwrap();
        f.participants.notify_result(&drop, &user, true, Some(0), 2).await.unwrap();
        f.participants.notify_expiry(&drop, &user, 3).await.unwrap();
        // floor(3 * 0.5) = 1
        assert_eq!(f.rollovers.balance(&user).await.unwrap(), 1);
        let state = f.participants.get_state(&drop, &user).await.unwrap();
        assert_eq!(state.status, ParticipantStatus::Expired);
        assert!(state.purchase_token.is_none());
    }

    #[tokio::test]
    async fn test_backup_promotion_path() {
        let f = fixture();
        let (drop, user) = (DROP.to_string(), USER.to_string());
        f.participants.set_registered(&drop, &user, record(1, 0), 1).await.unwrap();
        assert!(f.participants.notify_backup(&drop, &user, 1, 2, 2).await.unwrap());
        assert!(f.participants.notify_promotion(&drop, &user, 3).await.unwrap());
        let state = f.participants.get_state(&drop, &user).await.unwrap();
        assert_eq!(state.status, ParticipantStatus::Winner);
        assert_eq!(state.backup_position, None);
    }

    #[tokio::test]
    async fn test_invalid_transitions_are_noops() {
        let f = fixture();
        let (drop, user) = (DROP.to_string(), USER.to_string());

        // nothing registered yet
        assert!(!f.participants.notify_result(&drop, &user, true, None, 1).await.unwrap());
        assert!(!f.participants.notify_promotion(&drop, &user, 1).await.unwrap());
        assert!(!f.participants.notify_expiry(&drop, &user, 1).await.unwrap());

        // loser cannot become winner or backup
        f.participants.set_registered(&drop, &user, record(1, 0), 1).await.unwrap();
        f.participants.notify_result(&drop, &user, false, None, 2).await.unwrap();
        assert!(!f.participants.notify_result(&drop, &user, true, None, 3).await.unwrap());
        assert!(!f.participants.notify_backup(&drop, &user, 1, 1, 3).await.unwrap());
        assert!(!f.participants.set_token(&drop, &user, "t".into(), 10, 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_purchase_requires_winner() {
        let f = fixture();
        let (drop, user) = (DROP.to_string(), USER.to_string());
        f.participants.set_registered(&drop, &user, record(1, 0), 1).await.unwrap();
        let token = f.tokens.generate(DROP, USER, 10_000);
        let err = f.participants.complete_purchase(&drop, &user, &token, 2).await.unwrap_err();
        assert!(matches!(err, Error::NotWinner));
    }

    #[tokio::test]
    async fn test_purchase_with_bad_token() {
        let f = fixture();
        let (drop, user) = (DROP.to_string(), USER.to_string());
        f.participants.set_registered(&drop, &user, record(1, 0), 1).await.unwrap();
        f.participants.notify_result(&drop, &user, true, Some(0), 2).await.unwrap();
        let err = f
            .participants
            .complete_purchase(&drop, &user, "aa.bb.cccc", 3)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenInvalid));
    }

    #[tokio::test]
    async fn test_purchase_with_expired_token() {
        let f = fixture();
        let (drop, user) = (DROP.to_string(), USER.to_string());
        f.participants.set_registered(&drop, &user, record(1, 0), 1).await.unwrap();
        f.participants.notify_result(&drop, &user, true, Some(0), 2).await.unwrap();
        let token = f.tokens.generate(DROP, USER, 1);
        let err = f
            .participants
            .complete_purchase(&drop, &user, &token, 10_000)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenExpired));
    }

    #[tokio::test]
    async fn test_double_purchase_conflicts() {
        let f = fixture();
        let (drop, user) = (DROP.to_string(), USER.to_string());
        f.participants.set_registered(&drop, &user, record(1, 0), 1).await.unwrap();
        f.participants.notify_result(&drop, &user, true, Some(0), 2).await.unwrap();
        let token = f.tokens.generate(DROP, USER, 10_000);
        f.participants.complete_purchase(&drop, &user, &token, 3).await.unwrap();
        let err = f.participants.complete_purchase(&drop, &user, &token, 4).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyPurchased));
    }

    #[tokio::test]
    async fn test_expired_winner_cannot_purchase() {
        let f = fixture();
        let (drop, user) = (DROP.to_string(), USER.to_string());
        f.participants.set_registered(&drop, &user, record(1, 0), 1).await.unwrap();
        f.participants.notify_result(&drop, &user, true, Some(0), 2).await.unwrap();
        let token = f.tokens.generate(DROP, USER, 10_000);
        f.participants.notify_expiry(&drop, &user, 3).await.unwrap();
        let err = f.participants.complete_purchase(&drop, &user, &token, 4).await.unwrap_err();
        assert!(matches!(err, Error::NotWinner));
    }
}
