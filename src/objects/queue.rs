//! Per-drop admission queue.
//!
//! Joins go to the back of a FIFO line; a ticking loop promotes the
//! head to `ready` at a bounded rate while capping how many `ready`
//! tokens are outstanding at once. The queue is the primary
//! back-pressure lever in front of registration.
//!
//! All mutators for one drop serialize on the queue's object key, so
//! the ready count can never overshoot the cap.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::actor::ObjectLocks;
use crate::bus::{Bus, topics};
use crate::crypto::random_hex;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{DropId, Millis, QUEUE_POSITION_FANOUT, now_ms};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub enabled: bool,
    pub admission_rate_per_second: u32,
    pub max_concurrent_ready: usize,
    pub admission_tick_ms: u64,
    pub ready_window_seconds: i64,
    pub max_queue_age_minutes: i64,
    pub max_tokens_per_fingerprint: i64,
    pub max_tokens_per_ip: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            admission_rate_per_second: 5,
            max_concurrent_ready: 100,
            admission_tick_ms: 1_000,
            ready_window_seconds: 120,
            max_queue_age_minutes: 60,
            max_tokens_per_fingerprint: 3,
            max_tokens_per_ip: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Waiting,
    Ready,
    Used,
    Expired,
}

impl TokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Waiting => "waiting",
            TokenStatus::Ready => "ready",
            TokenStatus::Used => "used",
            TokenStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueToken {
    pub id: String,
    pub position: u64,
    pub fingerprint: String,
    pub ip_hash: String,
    pub status: TokenStatus,
    pub issued_at: Millis,
    pub ready_at: Option<Millis>,
    pub expires_at: Millis,
}

/// Durable per-drop queue state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueState {
    waiting: VecDeque<String>,
    ready: Vec<String>,
    loop_active: bool,
    total_issued: u64,
    total_admitted: u64,
    last_admission_tick: Millis,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinOutcome {
    pub token: String,
    pub position: u64,
    pub estimated_wait_seconds: u64,
    pub status: TokenStatus,
    /// True when this join flipped the loop flag on; the caller owns
    /// the Arc and spawns the admission loop.
    #[serde(skip)]
    pub needs_loop: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub status: TokenStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<Millis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Millis>,
}

#[derive(Debug, Clone, Copy)]
pub struct AdmitStats {
    pub admitted: usize,
    pub remaining: usize,
}

pub struct QueueAdmission {
    store: Arc<Store>,
    locks: Arc<ObjectLocks>,
    bus: Arc<Bus>,
    config: QueueConfig,
}

fn state_key(drop_id: &str) -> String {
    format!("queue:{drop_id}")
}

fn token_key(drop_id: &str, token_id: &str) -> String {
    format!("qtoken:{drop_id}:{token_id}")
}

impl QueueAdmission {
    pub fn new(
        store: Arc<Store>,
        locks: Arc<ObjectLocks>,
        bus: Arc<Bus>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            locks,
            bus,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn load_state(&self, drop_id: &str) -> Result<QueueState> {
        Ok(self.store.get_object(&state_key(drop_id))?.unwrap_or_default())
    }

    fn load_token(&self, drop_id: &str, token_id: &str, now: Millis) -> Result<Option<QueueToken>> {
        Ok(self.store.kv_get(&token_key(drop_id, token_id), now)?)
    }

    fn put_token(&self, drop_id: &str, token: &QueueToken, now: Millis) -> Result<()> {
        // keep the record a little past its own expiry so late status
        // polls see "expired" instead of "unknown"
        let ttl = (token.expires_at - now).max(0) + 60_000;
        self.store
            .kv_put(&token_key(drop_id, &token.id), token, ttl, now)?;
        Ok(())
    }

    fn max_queue_age_ms(&self) -> i64 {
        self.config.max_queue_age_minutes * 60_000
    }

    fn ready_window_ms(&self) -> i64 {
        self.config.ready_window_seconds * 1_000
    }

    /// Spec'd wait estimate from the join-time position.
    fn estimate_wait_secs(&self, position: u64) -> u64 {
        let throughput = (self.config.admission_rate_per_second as u64)
            .min(self.config.max_concurrent_ready as u64)
            .max(1);
        position.div_ceil(throughput)
    }

    // =========================================================================
    // JOIN
    // =========================================================================

    /// `queue_enabled` is the effective flag: the deployment-wide
    /// setting AND the drop's own config.
    pub async fn join(
        &self,
        drop_id: &DropId,
        fingerprint: &str,
        ip_hash: &str,
        queue_enabled: bool,
        now: Millis,
    ) -> Result<JoinOutcome> {
        // disabled queue: mint a ready token straight away
        if !queue_enabled {
            let token = QueueToken {
                id: random_hex(16),
                position: 0,
                fingerprint: fingerprint.to_string(),
                ip_hash: ip_hash.to_string(),
                status: TokenStatus::Ready,
                issued_at: now,
                ready_at: Some(now),
                expires_at: now + self.ready_window_ms(),
            };
            self.put_token(drop_id, &token, now)?;
            return Ok(JoinOutcome {
                token: token.id,
                position: 0,
                estimated_wait_seconds: 0,
                status: TokenStatus::Ready,
                needs_loop: false,
            });
        }

        let _guard = self.locks.lock(&state_key(drop_id)).await;

        // per-fingerprint and per-IP caps over the queue lifetime window
        let fp_count =
            self.store
                .kv_incr(&format!("qfp:{drop_id}:{fingerprint}"), self.max_queue_age_ms(), now)?;
        if fp_count > self.config.max_tokens_per_fingerprint {
            warn!("queue {drop_id}: fingerprint over cap");
            return Err(Error::RateLimited { retry_after: 60 });
        }
        let ip_count =
            self.store
                .kv_incr(&format!("qip:{drop_id}:{ip_hash}"), self.max_queue_age_ms(), now)?;
        if ip_count > self.config.max_tokens_per_ip {
            warn!("queue {drop_id}: ip over cap");
            return Err(Error::RateLimited { retry_after: 60 });
        }

        let position = self.store.incr(&format!("qpos:{drop_id}"), 1)? as u64;
        let token = QueueToken {
            id: random_hex(16),
            position,
            fingerprint: fingerprint.to_string(),
            ip_hash: ip_hash.to_string(),
            status: TokenStatus::Waiting,
            issued_at: now,
            ready_at: None,
            expires_at: now + self.max_queue_age_ms(),
        };
        self.put_token(drop_id, &token, now)?;

        let mut state = self.load_state(drop_id)?;
        state.waiting.push_back(token.id.clone());
        state.total_issued += 1;
        let needs_loop = !state.loop_active;
        if needs_loop {
            state.loop_active = true;
        }
        self.store.put_object(&state_key(drop_id), &state)?;

        Ok(JoinOutcome {
            token: token.id,
            position,
            estimated_wait_seconds: self.estimate_wait_secs(position),
            status: TokenStatus::Waiting,
            needs_loop,
        })
    }

    // =========================================================================
    // ADMISSION TICK
    // =========================================================================

    /// One admission tick: expire overdue ready tokens, promote the
    /// head of the line up to the rate and concurrency budgets, then
    /// refresh positions for the near waiters.
    pub async fn admit_next_batch(&self, drop_id: &DropId, now: Millis) -> Result<AdmitStats> {
        let _guard = self.locks.lock(&state_key(drop_id)).await;
        let mut state = self.load_state(drop_id)?;

        self.expire_overdue_ready(drop_id, &mut state, now)?;

        let slots = self
            .config
            .max_concurrent_ready
            .saturating_sub(state.ready.len());
        let rate_budget = ((self.config.admission_rate_per_second as u64
            * self.config.admission_tick_ms)
            .div_ceil(1_000)) as usize;
        let to_admit = slots.min(rate_budget).min(state.waiting.len());

        let mut admitted = 0;
        while admitted < to_admit {
            let Some(token_id) = state.waiting.pop_front() else {
                break;
            };
            let Some(mut token) = self.load_token(drop_id, &token_id, now)? else {
                // token aged out while waiting; does not consume a slot
                continue;
            };
            if token.status != TokenStatus::Waiting {
                continue;
            }

            token.status = TokenStatus::Ready;
            token.ready_at = Some(now);
            token.expires_at = now + self.ready_window_ms();
            self.put_token(drop_id, &token, now)?;
            state.ready.push(token_id.clone());
            state.total_admitted += 1;
            admitted += 1;

            self.bus.publish(
                &topics::queue(drop_id, &token_id),
                "queue_ready",
                json!({
                    "status": "ready",
                    "readyAt": token.ready_at,
                    "expiresAt": token.expires_at,
                }),
            );
        }

        // refresh the near end of the line
        for (idx, token_id) in state.waiting.iter().take(QUEUE_POSITION_FANOUT).enumerate() {
            let position = (idx + 1) as u64;
            self.bus.publish(
                &topics::queue(drop_id, token_id),
                "queue_position",
                json!({
                    "status": "waiting",
                    "position": position,
                    "estimatedWaitSeconds": self.estimate_wait_secs(position),
                }),
            );
        }

        state.last_admission_tick = now;
        let remaining = state.waiting.len();
        if remaining == 0 {
            state.loop_active = false;
        }
        self.store.put_object(&state_key(drop_id), &state)?;

        if admitted > 0 {
            debug!("queue {drop_id}: admitted {admitted}, {remaining} waiting");
        }
        Ok(AdmitStats { admitted, remaining })
    }

    /// Flip ready tokens past their window to expired.
    /// Used tokens are left alone.
    fn expire_overdue_ready(
        &self,
        drop_id: &str,
        state: &mut QueueState,
        now: Millis,
    ) -> Result<()> {
        let mut still_ready = Vec::with_capacity(state.ready.len());
        for token_id in state.ready.drain(..) {
            match self.load_token(drop_id, &token_id, now)? {
                Some(mut token) if token.status == TokenStatus::Ready => {
                    if token.expires_at <= now {
                        token.status = TokenStatus::Expired;
                        self.put_token(drop_id, &token, now)?;
                        self.bus.publish(
                            &topics::queue(drop_id, &token_id),
                            "queue_expired",
                            json!({ "status": "expired" }),
                        );
                    } else {
                        still_ready.push(token_id);
                    }
                }
                // used, vanished, or already expired: no longer holds a slot
                _ => {}
            }
        }
        state.ready = still_ready;
        Ok(())
    }

    /// Run ticks on wall clock until the line drains. Spawned by the
    /// caller when a join reports `needs_loop`.
    pub fn spawn_admission_loop(self: Arc<Self>, drop_id: DropId) {
        info!("queue {drop_id}: admission loop started");
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(self.config.admission_tick_ms)).await;
                match self.admit_next_batch(&drop_id, now_ms()).await {
                    Ok(stats) if stats.remaining == 0 => {
                        info!("queue {drop_id}: admission loop drained");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("queue {drop_id}: admission tick failed: {e}");
                    }
                }
            }
        });
    }

    /// Restart recovery: respawn loops for queues persisted mid-drain.
    /// Called once at startup with the drop index.
    pub async fn rearm_loops(self: Arc<Self>, drop_ids: &[DropId]) -> Result<usize> {
        let mut rearmed = 0;
        for drop_id in drop_ids {
            let _guard = self.locks.lock(&state_key(drop_id)).await;
            let mut state = self.load_state(drop_id)?;
            if !state.loop_active {
                continue;
            }
            if state.waiting.is_empty() {
                state.loop_active = false;
                self.store.put_object(&state_key(drop_id), &state)?;
            } else {
                self.clone().spawn_admission_loop(drop_id.clone());
                rearmed += 1;
            }
        }
        Ok(rearmed)
    }

    // =========================================================================
    // CONSUMPTION
    // =========================================================================

    /// Gate for registration: the token must be ready and presented by
    /// the fingerprint that joined. Consumes the token.
    pub async fn redeem_ready(
        &self,
        drop_id: &DropId,
        token_id: &str,
        fingerprint: &str,
        now: Millis,
    ) -> Result<()> {
        let _guard = self.locks.lock(&state_key(drop_id)).await;
        let Some(mut token) = self.load_token(drop_id, token_id, now)? else {
            return Err(Error::QueueNotReady);
        };
        if token.fingerprint != fingerprint {
            return Err(Error::FingerprintMismatch);
        }
        if token.status != TokenStatus::Ready || token.expires_at <= now {
            return Err(Error::QueueNotReady);
        }

        token.status = TokenStatus::Used;
        self.put_token(drop_id, &token, now)?;

        let mut state = self.load_state(drop_id)?;
        state.ready.retain(|id| id != token_id);
        self.store.put_object(&state_key(drop_id), &state)?;
        Ok(())
    }

    /// Explicit expiry (ready-window timeout observed by a caller).
    /// No-op for used tokens: the used/expired race settles once.
    pub async fn mark_token_expired(
        &self,
        drop_id: &DropId,
        token_id: &str,
        now: Millis,
    ) -> Result<bool> {
        let _guard = self.locks.lock(&state_key(drop_id)).await;
        let Some(mut token) = self.load_token(drop_id, token_id, now)? else {
            return Ok(false);
        };
        if token.status != TokenStatus::Ready {
            return Ok(false);
        }

        token.status = TokenStatus::Expired;
        self.put_token(drop_id, &token, now)?;
        let mut state = self.load_state(drop_id)?;
        state.ready.retain(|id| id != token_id);
        self.store.put_object(&state_key(drop_id), &state)?;
        self.bus.publish(
            &topics::queue(drop_id, token_id),
            "queue_expired",
            json!({ "status": "expired" }),
        );
        Ok(true)
    }

    // =========================================================================
    // STATUS
    // =========================================================================

    pub async fn status(
        &self,
        drop_id: &DropId,
        token_id: &str,
        now: Millis,
    ) -> Result<QueueStatus> {
        let Some(token) = self.load_token(drop_id, token_id, now)? else {
            return Err(Error::NotFound);
        };

        match token.status {
            TokenStatus::Waiting => {
                let state = self.load_state(drop_id)?;
                let position = state
                    .waiting
                    .iter()
                    .position(|id| id == token_id)
                    .map(|idx| (idx + 1) as u64);
                Ok(QueueStatus {
                    status: TokenStatus::Waiting,
                    estimated_wait_seconds: position.map(|p| self.estimate_wait_secs(p)),
                    position,
                    ready_at: None,
                    expires_at: Some(token.expires_at),
                })
            }
            TokenStatus::Ready if token.expires_at <= now => Ok(QueueStatus {
                status: TokenStatus::Expired,
                position: None,
                estimated_wait_seconds: None,
                ready_at: token.ready_at,
                expires_at: Some(token.expires_at),
            }),
            status => Ok(QueueStatus {
                status,
                position: None,
                estimated_wait_seconds: None,
                ready_at: token.ready_at,
                expires_at: Some(token.expires_at),
            }),
        }
    }

    /// Outstanding ready tokens. Test and metrics hook.
    pub async fn current_ready(&self, drop_id: &DropId) -> Result<usize> {
        Ok(self.load_state(drop_id)?.ready.len())
    }
}
