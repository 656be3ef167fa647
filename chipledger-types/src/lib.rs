//! Core type definitions for ChipLedger.
//!
//! This crate defines the data model shared by every other crate:
//! - Session, participant, and user identifiers (UUID v7 where generated
//!   on the client)
//! - Wall-clock millisecond timestamps
//! - Fixed-point money (`MinorUnits`) and chip counts (`Points`)
//! - The `Session` / `Participant` model with its derived fields and the
//!   in-play mutations (buy-ins, cash-outs, status transitions)
//! - Net balances, the input of the settlement engine
//!
//! No floating point is used anywhere in the balance paths.

mod balance;
mod ids;
mod money;
mod session;
mod timestamp;

pub use balance::NetBalance;
pub use ids::{ParticipantId, SessionId, UserId};
pub use money::{ConversionRate, MinorUnits, Points};
pub use session::{
    CashOutRecord, Contribution, Participant, ParticipantStatus, Session, SessionAccess,
    SessionStatus,
};
pub use timestamp::Timestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when mutating the data model.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("participant not found: {0}")]
    UnknownParticipant(ParticipantId),

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("session {0} is completed and can no longer change")]
    SessionCompleted(SessionId),

    #[error("participant {0} already left the table")]
    ParticipantInactive(ParticipantId),

    #[error("invalid conversion rate: {0}")]
    InvalidRate(String),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),
}
