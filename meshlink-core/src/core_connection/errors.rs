//! Connection error types

use crate::types::PeerId;
use thiserror::Error;

pub type ConnectionResult<T> = Result<T, ConnectionError>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// `open` was called before the local peer id is known
    #[error("Local peer id not set")]
    NoLocalPeer,

    #[error("No connection for peer {0}")]
    UnknownPeer(PeerId),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Data channel not open")]
    ChannelNotOpen,

    /// Negotiation data that does not decode
    #[error("Invalid negotiation data: {0}")]
    InvalidSignal(String),

    #[error("Signaling link error: {0}")]
    Link(String),
}
