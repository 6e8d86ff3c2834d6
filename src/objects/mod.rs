//! Durable single-writer objects: drops, participants, queues, and the
//! cross-drop user ledgers.

pub mod drops;
pub mod loyalty;
pub mod participant;
pub mod queue;
pub mod rollover;

pub use drops::{DropConfig, DropProjection, Drops};
pub use loyalty::{Loyalty, LoyaltySnapshot};
pub use participant::{ParticipantStatus, Participants};
pub use queue::{QueueAdmission, QueueConfig, TokenStatus};
pub use rollover::Rollovers;
