//! Sync error types

use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A peer frame could not be encoded or decoded
    #[error("Frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A message whose id or clock is inconsistent with its author
    #[error("Invalid message {id}: {reason}")]
    InvalidMessage { id: String, reason: String },
}
