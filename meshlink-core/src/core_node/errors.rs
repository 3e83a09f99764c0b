//! Node error types

use crate::core_store::StoreError;
use crate::core_sync::SyncError;
use thiserror::Error;

pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    /// No `registered` reply received yet, so there is no local identity
    #[error("Node is not registered with the signaling server")]
    NotRegistered,

    #[error("Signaling link is down")]
    SignalingUnavailable,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}
