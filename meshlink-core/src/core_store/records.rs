//! Rows persisted by the local store

use crate::core_signaling::{PeerInfo, RoomInfo};
use crate::core_sync::{DeliveryStatus, MessageId, SyncMessage};
use crate::types::{PeerId, RoomId, Timestamp};

/// A message with its local delivery status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub message: SyncMessage,
    pub status: DeliveryStatus,
}

impl MessageRecord {
    pub fn new(message: SyncMessage, status: DeliveryStatus) -> Self {
        MessageRecord { message, status }
    }

    pub fn id(&self) -> &MessageId {
        &self.message.id
    }

    pub fn room(&self) -> &RoomId {
        &self.message.room
    }

    pub fn timestamp(&self) -> Timestamp {
        self.message.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub nickname: String,
    pub fingerprint: String,
    pub last_seen: Timestamp,
}

impl From<&PeerInfo> for PeerRecord {
    fn from(info: &PeerInfo) -> Self {
        PeerRecord {
            peer_id: info.peer_id.clone(),
            nickname: info.nickname.clone(),
            fingerprint: info.fingerprint.clone(),
            last_seen: info.last_seen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub room_id: RoomId,
    pub name: String,
    pub is_private: bool,
    pub created_at: Timestamp,
}

impl From<&RoomInfo> for RoomRecord {
    fn from(info: &RoomInfo) -> Self {
        RoomRecord {
            room_id: info.room_id.clone(),
            name: info.name.clone(),
            is_private: info.is_private,
            created_at: info.created_at,
        }
    }
}

/// One queued durable write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Message(MessageRecord),
    /// Status-only update of an already queued or persisted message
    Status {
        id: MessageId,
        status: DeliveryStatus,
    },
    Peer(PeerRecord),
    Room(RoomRecord),
}
