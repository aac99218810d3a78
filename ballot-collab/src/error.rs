//! Error taxonomy for room operations.
//!
//! Every variant is reported only to the requester through its ack; none of
//! them ever reaches other participants.

use std::fmt;

use thiserror::Error;

/// Owner-only room actions, used to phrase authorization failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerAction {
    Reveal,
    Reset,
}

impl fmt::Display for OwnerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reveal => write!(f, "reveal votes"),
            Self::Reset => write!(f, "reset votes"),
        }
    }
}

/// Failure of a single client operation. State is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("Room not found")]
    RoomNotFound,

    #[error("Only room owner can {action}")]
    NotAuthorized { action: OwnerAction },

    #[error("{0}")]
    Validation(String),

    #[error("You must join the room before voting")]
    NotParticipant,

    /// Internal fault. The detail is logged; the client sees a generic message.
    #[error("Internal server error")]
    Internal(String),
}

impl RoomError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Message placed in the `{error: ...}` ack.
    pub fn ack_message(&self) -> String {
        self.to_string()
    }
}
