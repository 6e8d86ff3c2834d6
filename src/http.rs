//! HTTP surface: REST endpoints plus the SSE event streams.
//!
//! Handlers validate, walk the trust and queue gates, then invoke the
//! keyed objects. All typed failures map to status codes in
//! [`crate::error`].

use axum::Json;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::bus::Bus;
use crate::config::Config;
use crate::crypto::ip_hash;
use crate::error::{Error, Result};
use crate::geo::GeoPoint;
use crate::objects::drops::{DropConfig, Drops};
use crate::objects::queue::QueueAdmission;
use crate::sse;
use crate::store::Store;
use crate::trust::{BotValidation, TrustGate};
use crate::types::{DropId, UserId, now_ms};

/// Shared handler state.
pub struct App {
    pub store: Arc<Store>,
    pub bus: Arc<Bus>,
    pub drops: Arc<Drops>,
    pub queue: Arc<QueueAdmission>,
    pub trust: Arc<TrustGate>,
    pub ip_hash_salt: String,
    pub rate_limit_window_ms: i64,
    pub rate_limit_max_requests: i64,
    pub min_behavior_score: f64,
}

impl App {
    pub fn router(self: Arc<Self>) -> axum::Router {
        axum::Router::new()
            .route("/api/pow/challenge", get(pow_challenge))
            .route("/api/queue/{drop_id}/join", post(queue_join))
            .route("/api/queue/{drop_id}/{token}/status", get(queue_status))
            .route("/api/drop/initialize", post(drop_initialize))
            .route("/api/drop/active", get(drop_active))
            .route("/api/drop/rollover/{user_id}", get(rollover_balance))
            .route("/api/drop/{drop_id}/register", post(drop_register))
            .route("/api/drop/{drop_id}/purchase/start", post(purchase_start))
            .route("/api/drop/{drop_id}/purchase", post(purchase_complete))
            .route("/api/drop/{drop_id}/status", get(drop_status))
            .route("/api/drop/{drop_id}/proof", get(drop_proof))
            .route("/api/drop/{drop_id}/proof/{user_id}", get(drop_inclusion_proof))
            .route("/events/{drop_id}/{user_id}", get(events_drop))
            .route("/events/queue/{drop_id}/{token}", get(events_queue))
            .layer(CorsLayer::permissive())
            .with_state(self)
    }

    /// Hashed caller address: honors the LB-provided forwarded chain,
    /// falls back to the socket peer.
    fn caller_ip_hash(&self, headers: &HeaderMap, addr: &SocketAddr) -> String {
        let ip = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| addr.ip().to_string());
        ip_hash(&ip, &self.ip_hash_salt)
    }
}

// =============================================================================
// TRUST + QUEUE GATES
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorSignals {
    pub mouse_entropy: Option<f64>,
    pub keystroke_variance: Option<f64>,
    pub interaction_count: Option<f64>,
}

impl BehaviorSignals {
    /// Mean of the supplied signals on the 0–100 scale.
    pub fn aggregate(&self) -> Option<f64> {
        let present: Vec<f64> = [self.mouse_entropy, self.keystroke_variance, self.interaction_count]
            .into_iter()
            .flatten()
            .collect();
        if present.is_empty() {
            return None;
        }
        Some((present.iter().sum::<f64>() / present.len() as f64).clamp(0.0, 100.0))
    }
}

// =============================================================================
// POW
// =============================================================================

async fn pow_challenge(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let now = now_ms();
    let scope = format!("pow:{}", app.caller_ip_hash(&headers, &addr));
    if let Err(retry_after) =
        app.store
            .rate_limit(&scope, app.rate_limit_window_ms, app.rate_limit_max_requests, now)?
    {
        return Err(Error::RateLimited { retry_after });
    }

    let challenge = app.trust.issue_challenge(now)?;
    Ok(Json(json!({
        "challenge": challenge.challenge,
        "difficulty": challenge.difficulty,
        "timestamp": challenge.timestamp,
    })))
}

// =============================================================================
// QUEUE
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest {
    fingerprint: String,
}

async fn queue_join(
    State(app): State<Arc<App>>,
    Path(drop_id): Path<DropId>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<JoinRequest>,
) -> Result<Json<Value>> {
    if body.fingerprint.is_empty() {
        return Err(Error::MissingField("fingerprint"));
    }
    let now = now_ms();
    let enabled = app.queue.config().enabled && app.drops.queue_enabled(&drop_id).await?;
    let caller = app.caller_ip_hash(&headers, &addr);
    let outcome = app
        .queue
        .join(&drop_id, &body.fingerprint, &caller, enabled, now)
        .await?;
    if outcome.needs_loop {
        app.queue.clone().spawn_admission_loop(drop_id.clone());
    }
    Ok(Json(json!({
        "token": outcome.token,
        "position": outcome.position,
        "estimatedWaitSeconds": outcome.estimated_wait_seconds,
        "status": outcome.status.as_str(),
    })))
}

async fn queue_status(
    State(app): State<Arc<App>>,
    Path((drop_id, token)): Path<(DropId, String)>,
) -> Result<Json<Value>> {
    let status = app.queue.status(&drop_id, &token, now_ms()).await?;
    Ok(Json(serde_json::to_value(&status).unwrap_or(json!({}))))
}

// =============================================================================
// DROPS
// =============================================================================

async fn drop_initialize(
    State(app): State<Arc<App>>,
    Json(config): Json<DropConfig>,
) -> Result<Json<Value>> {
    let outcome = app.drops.initialize(config).await?;
    if outcome.created {
        app.drops.clone().spawn_lifecycle(outcome.drop_id.clone());
    }
    Ok(Json(serde_json::to_value(&outcome).unwrap_or(json!({}))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    user_id: UserId,
    tickets: u32,
    bot_validation: BotValidation,
    queue_token: Option<String>,
    behavior_signals: Option<BehaviorSignals>,
    location: Option<GeoPoint>,
}

async fn drop_register(
    State(app): State<Arc<App>>,
    Path(drop_id): Path<DropId>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<Value>> {
    if body.user_id.is_empty() {
        return Err(Error::MissingField("userId"));
    }
    if body.tickets == 0 {
        return Err(Error::Validation("tickets must be at least 1".into()));
    }
    let now = now_ms();

    // cheap pre-screen before any crypto work
    let behavior = body.behavior_signals.as_ref().and_then(|s| s.aggregate());
    if let Some(score) = behavior {
        if score < app.min_behavior_score {
            warn!("drop {drop_id}: behavior pre-screen rejected {}", body.user_id);
            return Err(Error::BotDetected("behavior signals below threshold".into()));
        }
    }

    // trust gate: one-time PoW + composite score
    let validation = &body.bot_validation;
    let pow_ok = app
        .trust
        .verify_pow(&validation.pow_challenge, &validation.pow_solution, now)?;
    let decision = app
        .trust
        .calculate_trust_score(validation, pow_ok, behavior)
        .await;
    if !decision.allowed {
        return Err(if !pow_ok {
            Error::PowFailed
        } else {
            Error::TrustScoreLow(decision.trust_score)
        });
    }

    // queue gate: a ready token bound to the same fingerprint
    let queue_enabled =
        app.queue.config().enabled && app.drops.queue_enabled(&drop_id).await?;
    if queue_enabled {
        let token = body
            .queue_token
            .as_deref()
            .ok_or(Error::MissingField("queueToken"))?;
        app.queue
            .redeem_ready(&drop_id, token, &validation.fingerprint, now)
            .await?;
    }

    let outcome = app
        .drops
        .register(&drop_id, &body.user_id, body.tickets, body.location, now)
        .await?;
    let mut response = serde_json::to_value(&outcome).unwrap_or(json!({}));
    response["trustScore"] = json!(decision.trust_score);
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PurchaseStartRequest {
    user_id: UserId,
}

async fn purchase_start(
    State(app): State<Arc<App>>,
    Path(drop_id): Path<DropId>,
    Json(body): Json<PurchaseStartRequest>,
) -> Result<Json<Value>> {
    let (token, expires_at) = app
        .drops
        .start_purchase(&drop_id, &body.user_id, now_ms())
        .await?;
    Ok(Json(json!({
        "purchaseToken": token,
        "expiresAt": expires_at,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PurchaseRequest {
    user_id: UserId,
    purchase_token: String,
}

async fn purchase_complete(
    State(app): State<Arc<App>>,
    Path(drop_id): Path<DropId>,
    Json(body): Json<PurchaseRequest>,
) -> Result<Json<Value>> {
    app.drops
        .complete_purchase(&drop_id, &body.user_id, &body.purchase_token, now_ms())
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn drop_status(
    State(app): State<Arc<App>>,
    Path(drop_id): Path<DropId>,
) -> Result<Json<Value>> {
    let projection = app.drops.get_state(&drop_id).await?;
    Ok(Json(serde_json::to_value(&projection).unwrap_or(json!({}))))
}

async fn drop_active(State(app): State<Arc<App>>) -> Result<Json<Value>> {
    let drops = app.drops.active().await?;
    Ok(Json(json!({ "drops": drops })))
}

async fn drop_proof(
    State(app): State<Arc<App>>,
    Path(drop_id): Path<DropId>,
) -> Result<Json<Value>> {
    let proof = app.drops.proof(&drop_id).await?;
    Ok(Json(serde_json::to_value(&proof).unwrap_or(json!({}))))
}

async fn drop_inclusion_proof(
    State(app): State<Arc<App>>,
    Path((drop_id, user_id)): Path<(DropId, UserId)>,
) -> Result<Json<Value>> {
    let proof = app.drops.inclusion_proof(&drop_id, &user_id).await?;
    Ok(Json(serde_json::to_value(&proof).unwrap_or(json!({}))))
}

async fn rollover_balance(
    State(app): State<Arc<App>>,
    Path(user_id): Path<UserId>,
) -> Result<Json<Value>> {
    let balance = app.drops.rollovers().balance(&user_id).await?;
    Ok(Json(json!({ "balance": balance })))
}

// =============================================================================
// EVENT STREAMS
// =============================================================================

async fn events_drop(
    State(app): State<Arc<App>>,
    Path((drop_id, user_id)): Path<(DropId, UserId)>,
) -> Result<sse::EventStream> {
    sse::drop_events(&app.bus, &app.drops, &drop_id, &user_id).await
}

async fn events_queue(
    State(app): State<Arc<App>>,
    Path((drop_id, token)): Path<(DropId, String)>,
) -> Result<sse::EventStream> {
    sse::queue_events(&app.bus, &app.queue, &drop_id, &token, now_ms()).await
}

/// Wire the full application from configuration and an opened store.
pub fn build_app(config: &Config, store: Arc<Store>) -> std::result::Result<Arc<App>, String> {
    use crate::actor::ObjectLocks;
    use crate::journal::Journal;
    use crate::objects::loyalty::Loyalty;
    use crate::objects::participant::Participants;
    use crate::objects::rollover::Rollovers;
    use crate::token::PurchaseTokens;

    let locks = Arc::new(ObjectLocks::new());
    let bus = Arc::new(Bus::new());
    let secret = config.resolve_token_secret()?;
    let tokens = Arc::new(PurchaseTokens::new(secret));
    let rollovers = Arc::new(Rollovers::new(store.clone(), locks.clone()));
    let loyalty = Arc::new(Loyalty::new(store.clone(), locks.clone()));
    let participants = Arc::new(Participants::new(
        store.clone(),
        locks.clone(),
        bus.clone(),
        rollovers.clone(),
        tokens.clone(),
    ));
    let journal = Journal::new(&store);
    let drops = Arc::new(Drops::new(
        store.clone(),
        locks.clone(),
        bus.clone(),
        journal,
        participants,
        loyalty,
        rollovers,
        tokens,
    ));
    let queue = Arc::new(QueueAdmission::new(
        store.clone(),
        locks,
        bus.clone(),
        config.queue_config(),
    ));
    let trust = Arc::new(TrustGate::new(
        store.clone(),
        config.pow_difficulty,
        config.min_trust_score,
    ));

    Ok(Arc::new(App {
        store,
        bus,
        drops,
        queue,
        trust,
        ip_hash_salt: config.ip_hash_salt.clone(),
        rate_limit_window_ms: config.rate_limit_window_ms,
        rate_limit_max_requests: config.rate_limit_max_requests,
        min_behavior_score: config.min_behavior_score,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_behavior_aggregate() {
        let none = BehaviorSignals {
            mouse_entropy: None,
            keystroke_variance: None,
            interaction_count: None,
        };
        assert_eq!(none.aggregate(), None);

        let some = BehaviorSignals {
            mouse_entropy: Some(80.0),
            keystroke_variance: Some(40.0),
            interaction_count: None,
        };
        assert_eq!(some.aggregate(), Some(60.0));

        let wild = BehaviorSignals {
            mouse_entropy: Some(500.0),
            keystroke_variance: None,
            interaction_count: None,
        };
        assert_eq!(wild.aggregate(), Some(100.0));
    }
}
