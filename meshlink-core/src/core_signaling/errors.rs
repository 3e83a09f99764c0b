//! Signaling error types
//!
//! None of these cross the signaling boundary: the service logs them and
//! either drops the offending frame or answers with an `error` message.

use crate::types::{ConnId, PeerId, RoomId};
use thiserror::Error;

pub type SignalingResult<T> = Result<T, SignalingError>;

#[derive(Debug, Error)]
pub enum SignalingError {
    /// Frame could not be parsed as a client message
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("No peer registered on connection {0}")]
    NotRegistered(ConnId),

    /// A relayed signal named someone else as its sender
    #[error("Signal sender mismatch: claimed {claimed}, registered as {actual}")]
    SenderMismatch { claimed: PeerId, actual: PeerId },

    #[error("Room {0} is full")]
    RoomFull(RoomId),

    #[error("Unknown peer: {0}")]
    PeerNotFound(PeerId),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Signaling service stopped")]
    ServiceStopped,

    #[error("Server error: {0}")]
    Server(String),
}

impl From<serde_json::Error> for SignalingError {
    fn from(e: serde_json::Error) -> Self {
        SignalingError::Malformed(e.to_string())
    }
}
