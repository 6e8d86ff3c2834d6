//! Error taxonomy and its HTTP projection.
//!
//! Handlers return typed failures; the HTTP edge maps each kind to one
//! status code and a stable machine-readable code string. Reason text
//! is returned only where it is safe to show a client.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;
use crate::token::TokenError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Validation(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("{0}")]
    BotDetected(String),
    #[error("invalid proof-of-work")]
    PowFailed,
    #[error("trust score {0:.0} below threshold")]
    TrustScoreLow(f64),
    #[error("queue token not ready")]
    QueueNotReady,
    #[error("fingerprint mismatch")]
    FingerprintMismatch,
    #[error("outside drop zone")]
    OutsideDropZone,
    #[error("registration closed")]
    RegistrationClosed,
    #[error("already registered")]
    AlreadyRegistered,
    #[error("already purchased")]
    AlreadyPurchased,
    #[error("not a winner")]
    NotWinner,
    #[error("token expired")]
    TokenExpired,
    #[error("invalid token")]
    TokenInvalid,
    #[error("rate limited")]
    RateLimited { retry_after: u64 },
    #[error("unknown drop: {0}")]
    UnknownDrop(String),
    #[error("not found")]
    NotFound,
    #[error("upstream timeout")]
    UpstreamTimeout,
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TokenError> for Error {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Expired => Error::TokenExpired,
            TokenError::Malformed | TokenError::BadSignature => Error::TokenInvalid,
        }
    }
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::MissingField(_) | Error::RegistrationClosed => {
                StatusCode::BAD_REQUEST
            }
            Error::BotDetected(_)
            | Error::PowFailed
            | Error::TrustScoreLow(_)
            | Error::FingerprintMismatch
            | Error::OutsideDropZone
            | Error::NotWinner
            | Error::TokenInvalid => StatusCode::FORBIDDEN,
            Error::UnknownDrop(_) | Error::NotFound => StatusCode::NOT_FOUND,
            Error::AlreadyRegistered | Error::AlreadyPurchased => StatusCode::CONFLICT,
            Error::TokenExpired => StatusCode::GONE,
            Error::QueueNotReady | Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Store(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "INVALID_INPUT",
            Error::MissingField(_) => "MISSING_FIELD",
            Error::BotDetected(_) => "BOT_DETECTED",
            Error::PowFailed => "POW_FAILED",
            Error::TrustScoreLow(_) => "TRUST_SCORE_LOW",
            Error::QueueNotReady => "QUEUE_NOT_READY",
            Error::FingerprintMismatch => "FINGERPRINT_MISMATCH",
            Error::OutsideDropZone => "OUTSIDE_DROP_ZONE",
            Error::RegistrationClosed => "REGISTRATION_CLOSED",
            Error::AlreadyRegistered => "ALREADY_REGISTERED",
            Error::AlreadyPurchased => "ALREADY_PURCHASED",
            Error::NotWinner => "NOT_WINNER",
            Error::TokenExpired => "TOKEN_EXPIRED",
            Error::TokenInvalid => "TOKEN_INVALID",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::UnknownDrop(_) => "UNKNOWN_DROP",
            Error::NotFound => "NOT_FOUND",
            Error::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            Error::Upstream(_) => "UPSTREAM_ERROR",
            Error::Store(_) | Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Seconds-to-retry hint; present on every 429.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after } => Some(*retry_after),
            Error::QueueNotReady => Some(5),
            _ => None,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        // internals are logged, not leaked
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error: {self}");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let mut body = json!({
            "error": self.code(),
            "message": message,
        });
        if let Some(retry_after) = self.retry_after() {
            body["retryAfter"] = json!(retry_after);
        }
        (status, Json(body)).into_response()
    }
}
