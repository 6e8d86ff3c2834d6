//! Shared identifiers, phases, and tunable constants.
//!
//! # Design Goals
//!
//! 1. **Bounded state** — ledgers and queues have explicit caps. A user
//!    cannot grow their rollover balance or queue presence without limit.
//!
//! 2. **Deterministic replay** — every constant that feeds the lottery
//!    (pricing, multiplier clamps, backup ratios) lives here so two runs
//!    over the same inputs agree byte-for-byte.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Drop identifier, chosen by the operator at initialize time.
pub type DropId = String;

/// User identifier, opaque to the orchestrator.
pub type UserId = String;

/// Milliseconds since the Unix epoch.
pub type Millis = i64;

/// Wall-clock now in milliseconds.
///
/// Handlers that need replay-stable time must go through the journal
/// instead of calling this directly.
pub fn now_ms() -> Millis {
    Utc::now().timestamp_millis()
}

// =============================================================================
// DROP PHASES
// =============================================================================

/// Drop lifecycle phase. Monotonically non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Registration,
    Lottery,
    Purchase,
    Completed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Registration => "registration",
            Phase::Lottery => "lottery",
            Phase::Purchase => "purchase",
            Phase::Completed => "completed",
        }
    }
}

// =============================================================================
// ROLLOVER LEDGER
// =============================================================================

/// Maximum rollover balance a user can accumulate across drops.
/// Caps the compensation a serial loser can bring into one drop.
pub const MAX_ROLLOVER: u32 = 10;

/// Fraction of paid entries granted back when a winner lets their
/// purchase window lapse. Half of a loss grant: the seat was offered.
pub const EXPIRED_ROLLOVER_PERCENT: f64 = 0.5;

// =============================================================================
// BACKUP WINNERS
// =============================================================================

/// Backup multiplier clamp. 1.0 means no backups; 3.0 means up to
/// 2× inventory on the reserve list.
pub const BACKUP_MULTIPLIER_MIN: f64 = 1.0;
pub const BACKUP_MULTIPLIER_MAX: f64 = 3.0;

/// Purchase window granted to a promoted backup, in seconds.
/// Shorter than the primary window: the drop is already past its deadline.
pub const PROMO_WINDOW_SECS: i64 = 300;

/// Grace period after the last promotion before the drop completes.
pub const PROMO_GRACE_SECS: i64 = 60;

// =============================================================================
// LOYALTY TIERS
// =============================================================================

/// Loyalty tier derived from lifetime drops participated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoyaltyTier {
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl LoyaltyTier {
    /// Tier from lifetime participation count.
    pub fn from_participation(drops: usize) -> Self {
        match drops {
            0..=2 => LoyaltyTier::Bronze,
            3..=9 => LoyaltyTier::Silver,
            10..=24 => LoyaltyTier::Gold,
            _ => LoyaltyTier::Platinum,
        }
    }

    /// Base multiplier for the tier.
    pub fn multiplier(&self) -> f64 {
        match self {
            LoyaltyTier::Bronze => 1.0,
            LoyaltyTier::Silver => 1.1,
            LoyaltyTier::Gold => 1.25,
            LoyaltyTier::Platinum => 1.5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoyaltyTier::Bronze => "bronze",
            LoyaltyTier::Silver => "silver",
            LoyaltyTier::Gold => "gold",
            LoyaltyTier::Platinum => "platinum",
        }
    }
}

/// Consecutive participations required before the streak bonus applies.
pub const STREAK_THRESHOLD: u32 = 3;

/// Additive multiplier bonus for an active streak.
pub const STREAK_BONUS: f64 = 0.1;

/// Hard ceiling on the combined loyalty multiplier.
pub const MAX_LOYALTY_MULTIPLIER: f64 = 2.0;

// =============================================================================
// PROOF OF WORK
// =============================================================================

/// Leading hex zeros required on SHA256(challenge ‖ nonce).
/// 4 zeros ≈ 65k hashes expected — trivial for a browser, costly at scale.
pub const DEFAULT_POW_DIFFICULTY: u32 = 4;

/// Challenge lifetime. Also the KV TTL: verify-after-expiry always fails.
pub const POW_CHALLENGE_MAX_AGE_MS: i64 = 5 * 60 * 1000;

/// Random bytes in a challenge.
pub const POW_CHALLENGE_BYTES: usize = 16;

// =============================================================================
// TRUST GATE
// =============================================================================

/// Default admission threshold on the composite 0–100 trust score.
pub const DEFAULT_MIN_TRUST_SCORE: f64 = 50.0;

/// Neutral component value substituted when a signal is absent.
pub const TRUST_NEUTRAL: f64 = 50.0;

/// Form-fill faster than this is treated as automation.
pub const TIMING_FLOOR_MS: i64 = 200;

/// Form-fill slower than this is treated as a parked session.
pub const TIMING_CEILING_MS: i64 = 10 * 60 * 1000;

/// Anomaly scorer feature vector width.
pub const ANOMALY_FEATURES: usize = 10;

/// Budget for one anomaly inference before the neutral fallback is used.
pub const ANOMALY_TIMEOUT_MS: u64 = 150;

// =============================================================================
// PURCHASE TOKENS
// =============================================================================

/// Random bytes behind the token short id.
pub const TOKEN_SHORT_ID_BYTES: usize = 12;

/// Base64url characters of the HMAC kept in the token.
/// 16 chars = 96 bits — far beyond online forgery reach.
pub const TOKEN_SIG_CHARS: usize = 16;

// =============================================================================
// QUEUE ADMISSION
// =============================================================================

/// Waiters beyond this many do not receive per-tick position updates;
/// they refresh via the status endpoint instead.
pub const QUEUE_POSITION_FANOUT: usize = 100;

// =============================================================================
// STORE
// =============================================================================

/// Period of the TTL sweep over the KV tree.
pub const KV_SWEEP_INTERVAL_SECS: u64 = 30;

/// Bounded backoff for idempotent reads against the store.
pub const MAX_RETRIES: u32 = 3;
pub const RETRY_DELAY_MS: u64 = 50;
