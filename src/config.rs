//! Process configuration: flags with environment fallbacks.

use clap::Parser;
use std::path::PathBuf;

use crate::crypto::random_hex;
use crate::objects::queue::QueueConfig;
use crate::types::{DEFAULT_MIN_TRUST_SCORE, DEFAULT_POW_DIFFICULTY};

#[derive(Parser, Debug, Clone)]
#[command(name = "dropgate", version, about = "Dropgate: scarcity-drop orchestrator")]
pub struct Config {
    /// API listen port
    #[arg(long, env = "API_PORT", default_value_t = 3000)]
    pub api_port: u16,

    /// Optional second listener for event streams (same routes)
    #[arg(long, env = "SSE_PORT")]
    pub sse_port: Option<u16>,

    /// Data directory for the store
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Leading hex zeros required of PoW solutions
    #[arg(long, env = "POW_DIFFICULTY", default_value_t = DEFAULT_POW_DIFFICULTY)]
    pub pow_difficulty: u32,

    /// Rate-limit window for challenge issuance
    #[arg(long, env = "RATE_LIMIT_WINDOW_MS", default_value_t = 60_000)]
    pub rate_limit_window_ms: i64,

    /// Requests allowed per window per IP
    #[arg(long, env = "RATE_LIMIT_MAX_REQUESTS", default_value_t = 30)]
    pub rate_limit_max_requests: i64,

    /// Salt for IP hashing; raw addresses never reach the store
    #[arg(long, env = "IP_HASH_SALT", default_value = "dropgate-dev-salt")]
    pub ip_hash_salt: String,

    /// HMAC secret behind purchase tokens. Required with --production.
    #[arg(long, env = "PURCHASE_TOKEN_SECRET")]
    pub purchase_token_secret: Option<String>,

    /// Composite trust score admission threshold
    #[arg(long, env = "MIN_TRUST_SCORE", default_value_t = DEFAULT_MIN_TRUST_SCORE)]
    pub min_trust_score: f64,

    /// Behavior-signal pre-screen threshold
    #[arg(long, env = "MIN_BEHAVIOR_SCORE", default_value_t = 30.0)]
    pub min_behavior_score: f64,

    /// Disable the waiting queue for every drop
    #[arg(long, env = "QUEUE_DISABLED")]
    pub queue_disabled: bool,

    #[arg(long, env = "ADMISSION_RATE_PER_SECOND", default_value_t = 5)]
    pub admission_rate_per_second: u32,

    #[arg(long, env = "MAX_CONCURRENT_READY", default_value_t = 100)]
    pub max_concurrent_ready: usize,

    #[arg(long, env = "ADMISSION_TICK_MS", default_value_t = 1_000)]
    pub admission_tick_ms: u64,

    #[arg(long, env = "READY_WINDOW_SECONDS", default_value_t = 120)]
    pub ready_window_seconds: i64,

    #[arg(long, env = "MAX_QUEUE_AGE_MINUTES", default_value_t = 60)]
    pub max_queue_age_minutes: i64,

    #[arg(long, env = "MAX_TOKENS_PER_FINGERPRINT", default_value_t = 3)]
    pub max_tokens_per_fingerprint: i64,

    #[arg(long, env = "MAX_TOKENS_PER_IP", default_value_t = 10)]
    pub max_tokens_per_ip: i64,

    /// Refuse generated secrets and debug affordances
    #[arg(long)]
    pub production: bool,
}

impl Config {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            enabled: !self.queue_disabled,
            admission_rate_per_second: self.admission_rate_per_second,
            max_concurrent_ready: self.max_concurrent_ready,
            admission_tick_ms: self.admission_tick_ms,
            ready_window_seconds: self.ready_window_seconds,
            max_queue_age_minutes: self.max_queue_age_minutes,
            max_tokens_per_fingerprint: self.max_tokens_per_fingerprint,
            max_tokens_per_ip: self.max_tokens_per_ip,
        }
    }

    /// The purchase-token secret. Outside production a process-random
    /// secret is generated (tokens then do not survive restart).
    pub fn resolve_token_secret(&self) -> Result<Vec<u8>, String> {
        match &self.purchase_token_secret {
            Some(secret) if !secret.is_empty() => Ok(secret.clone().into_bytes()),
            _ if self.production => {
                Err("PURCHASE_TOKEN_SECRET is required in production".to_string())
            }
            _ => {
                tracing::warn!(
                    "PURCHASE_TOKEN_SECRET not set; using a process-random secret \
                     (purchase tokens will not survive restart)"
                );
                Ok(random_hex(32).into_bytes())
            }
        }
    }
}
