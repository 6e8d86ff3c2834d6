//! The trust gate: proof-of-work plus a composite behavioral score.
//!
//! PoW makes bulk registration expensive; the composite score filters
//! the obvious automation that solves PoW anyway. Neither is strong
//! anti-Sybil — they raise cost, the queue and per-IP caps bound rate.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::crypto::{random_hex, sha256_hex};
use crate::store::{Store, StoreResult};
use crate::types::{
    ANOMALY_FEATURES, ANOMALY_TIMEOUT_MS, Millis, POW_CHALLENGE_BYTES, POW_CHALLENGE_MAX_AGE_MS,
    TIMING_CEILING_MS, TIMING_FLOOR_MS, TRUST_NEUTRAL,
};

/// Client-supplied validation bundle on registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotValidation {
    pub fingerprint: String,
    /// Fingerprint library confidence, 0–100.
    #[serde(default)]
    pub fingerprint_confidence: f64,
    /// Time from form render to submit.
    #[serde(default)]
    pub timing_ms: i64,
    pub pow_challenge: String,
    pub pow_solution: String,
}

/// Outcome of the gate.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustDecision {
    pub allowed: bool,
    pub trust_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Issued PoW challenge, returned to the client verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct PowChallenge {
    pub challenge: String,
    pub difficulty: u32,
    pub timestamp: Millis,
}

/// Component weights. Must sum to 1.
#[derive(Debug, Clone, Copy)]
pub struct TrustWeights {
    pub fingerprint: f64,
    pub timing: f64,
    pub behavior: f64,
    pub anomaly: f64,
}

impl Default for TrustWeights {
    fn default() -> Self {
        Self {
            fingerprint: 0.35,
            timing: 0.20,
            behavior: 0.25,
            anomaly: 0.20,
        }
    }
}

/// Pluggable anomaly scorer: 10 features in, anomaly ∈ [0, 1] out.
/// Implementations may be arbitrarily slow; the gate enforces the
/// latency budget and falls back to neutral.
pub trait AnomalyScorer: Send + Sync {
    fn score(&self, features: &[f64; ANOMALY_FEATURES]) -> f64;
}

pub struct TrustGate {
    store: Arc<Store>,
    difficulty: u32,
    min_trust_score: f64,
    weights: TrustWeights,
    scorer: Option<Arc<dyn AnomalyScorer>>,
}

impl TrustGate {
    pub fn new(store: Arc<Store>, difficulty: u32, min_trust_score: f64) -> Self {
        Self {
            store,
            difficulty,
            min_trust_score,
            weights: TrustWeights::default(),
            scorer: None,
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn AnomalyScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    // =========================================================================
    // PROOF OF WORK
    // =========================================================================

    /// Issue a fresh challenge: `timestampMs:hex(16 bytes)`, stored with
    /// the challenge lifetime as TTL.
    pub fn issue_challenge(&self, now: Millis) -> StoreResult<PowChallenge> {
        let challenge = format!("{now}:{}", random_hex(POW_CHALLENGE_BYTES));
        self.store
            .kv_put(&format!("pow:{challenge}"), &(), POW_CHALLENGE_MAX_AGE_MS, now)?;
        Ok(PowChallenge {
            challenge,
            difficulty: self.difficulty,
            timestamp: now,
        })
    }

    /// One-time verify: the challenge is consumed whether or not the
    /// nonce checks out. A replayed challenge always fails.
    pub fn verify_pow(&self, challenge: &str, nonce: &str, now: Millis) -> StoreResult<bool> {
        if self
            .store
            .kv_take::<()>(&format!("pow:{challenge}"), now)?
            .is_none()
        {
            return Ok(false);
        }
        let digest = sha256_hex(format!("{challenge}{nonce}").as_bytes());
        Ok(digest.starts_with(&"0".repeat(self.difficulty as usize)))
    }

    // =========================================================================
    // COMPOSITE SCORE
    // =========================================================================

    /// Compose fingerprint, timing, behavior, and anomaly components
    /// into a 0–100 trust score. PoW failure short-circuits.
    pub async fn calculate_trust_score(
        &self,
        validation: &BotValidation,
        pow_ok: bool,
        behavior_score: Option<f64>,
    ) -> TrustDecision {
        if !pow_ok {
            return TrustDecision {
                allowed: false,
                trust_score: 0.0,
                reason: Some("Invalid proof-of-work".to_string()),
            };
        }

        let fp = validation.fingerprint_confidence.clamp(0.0, 100.0);
        let timing = timing_component(validation.timing_ms);
        let behavior = behavior_score.unwrap_or(TRUST_NEUTRAL).clamp(0.0, 100.0);
        let anomaly = self.anomaly_component(validation, behavior).await;

        let w = &self.weights;
        let score = (w.fingerprint * fp + w.timing * timing + w.behavior * behavior
            + w.anomaly * anomaly)
            .clamp(0.0, 100.0);

        let allowed = score >= self.min_trust_score;
        TrustDecision {
            allowed,
            trust_score: score,
            reason: (!allowed).then(|| "Trust score below threshold".to_string()),
        }
    }

    /// 100 − 100·anomaly from the pluggable scorer, or neutral when the
    /// scorer is absent, panics, or blows the latency budget.
    async fn anomaly_component(&self, validation: &BotValidation, behavior: f64) -> f64 {
        let Some(scorer) = self.scorer.clone() else {
            return TRUST_NEUTRAL;
        };

        let features = feature_vector(validation, behavior);
        let inference =
            tokio::task::spawn_blocking(move || scorer.score(&features).clamp(0.0, 1.0));

        match tokio::time::timeout(Duration::from_millis(ANOMALY_TIMEOUT_MS), inference).await {
            Ok(Ok(anomaly)) => 100.0 - 100.0 * anomaly,
            Ok(Err(e)) => {
                warn!("anomaly scorer panicked, using neutral: {e}");
                TRUST_NEUTRAL
            }
            Err(_) => {
                warn!("anomaly scorer exceeded {ANOMALY_TIMEOUT_MS}ms, using neutral");
                TRUST_NEUTRAL
            }
        }
    }
}

/// Penalize superhuman and parked submissions, pass the human band.
fn timing_component(timing_ms: i64) -> f64 {
    if timing_ms < TIMING_FLOOR_MS {
        10.0
    } else if timing_ms > TIMING_CEILING_MS {
        30.0
    } else {
        100.0
    }
}

/// Normalized feature vector for the anomaly scorer.
fn feature_vector(validation: &BotValidation, behavior: f64) -> [f64; ANOMALY_FEATURES] {
    let mut features = [0.0; ANOMALY_FEATURES];
    features[0] = validation.fingerprint_confidence / 100.0;
    features[1] = (validation.timing_ms as f64 / TIMING_CEILING_MS as f64).clamp(0.0, 1.0);
    features[2] = behavior / 100.0;
    features[3] = if validation.timing_ms < TIMING_FLOOR_MS { 1.0 } else { 0.0 };
    features[4] = (validation.fingerprint.len() as f64 / 64.0).clamp(0.0, 1.0);
    features
}
