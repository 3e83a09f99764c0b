/*
    Message envelope exchanged on direct transports

    Ids are derived from (author, author counter, creation time), so the
    same message carries the same id everywhere and an id never names two
    different messages. Only the local DeliveryStatus may change after
    creation.
*/

use super::vector_clock::VectorClock;
use crate::types::{PeerId, RoomId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Hex BLAKE3 of author, counter and timestamp, truncated to 32 chars
    pub fn derive(author: &PeerId, counter: u64, timestamp: Timestamp) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(author.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(&counter.to_be_bytes());
        hasher.update(&timestamp.as_millis().to_be_bytes());
        let hash = hasher.finalize();
        MessageId(hash.to_hex().as_str()[..32].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
            MessageKind::System => "system",
        }
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "file" => Ok(MessageKind::File),
            "system" => Ok(MessageKind::System),
            other => Err(format!("unknown message kind: {}", other)),
        }
    }
}

/// Local-only delivery state of a stored message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "read" => Ok(DeliveryStatus::Read),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub id: MessageId,
    pub from: PeerId,
    pub room: RoomId,
    /// Direct recipient, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    pub content: String,
    pub timestamp: Timestamp,
    pub vector_clock: VectorClock,
    /// Ids that must be delivered before this one
    #[serde(default)]
    pub causality: Vec<MessageId>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

impl SyncMessage {
    /// The author's own clock entry
    pub fn sender_counter(&self) -> u64 {
        self.vector_clock.get(&self.from)
    }

    pub fn depends_on(&self, id: &MessageId) -> bool {
        self.causality.contains(id)
    }

    /// Whether the id matches the author, counter and timestamp it claims
    pub fn has_valid_id(&self) -> bool {
        self.id == MessageId::derive(&self.from, self.sender_counter(), self.timestamp)
    }
}
