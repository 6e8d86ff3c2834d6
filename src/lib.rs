pub mod actor;
pub mod bus;
pub mod config;
pub mod crypto;
pub mod error;
pub mod geo;
pub mod http;
pub mod journal;
pub mod lottery;
pub mod objects;
pub mod sse;
pub mod store;
pub mod token;
pub mod trust;
pub mod types;

pub use bus::{Bus, BusEvent, topics};
pub use config::Config;
pub use error::{Error, Result};
pub use journal::Journal;
pub use lottery::{Fenwick, LotteryProof, MerkleTree, SeededRng, select_winners, verify_proof};
pub use objects::{
    DropConfig, DropProjection, Drops, Loyalty, Participants, QueueAdmission, QueueConfig,
    Rollovers,
};
pub use store::Store;
pub use token::PurchaseTokens;
pub use trust::{AnomalyScorer, BotValidation, TrustGate};
pub use types::*;
