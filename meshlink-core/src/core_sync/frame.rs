//! Frames exchanged between peers over the direct transport
//!
//! JSON objects tagged by `kind`. A `message` frame is the envelope itself
//! with the tag added.

use super::errors::SyncResult;
use super::message::SyncMessage;
use super::vector_clock::VectorClock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerFrame {
    Message(SyncMessage),
    SyncRequest {
        clock: VectorClock,
    },
    SyncResponse {
        messages: Vec<SyncMessage>,
        #[serde(rename = "hasMore")]
        has_more: bool,
    },
    Gossip {
        messages: Vec<SyncMessage>,
    },
}

impl PeerFrame {
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_tags() {
        let request = PeerFrame::SyncRequest {
            clock: VectorClock::from([("a", 3), ("b", 1)]),
        };
        let json: serde_json::Value = serde_json::from_slice(&request.encode().unwrap()).unwrap();
        assert_eq!(json["kind"], "sync_request");
        assert_eq!(json["clock"]["a"], 3);

        let response = PeerFrame::SyncResponse {
            messages: vec![],
            has_more: true,
        };
        let json: serde_json::Value = serde_json::from_slice(&response.encode().unwrap()).unwrap();
        assert_eq!(json["hasMore"], true);
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(PeerFrame::decode(b"{\"kind\":\"teleport\"}").is_err());
        assert!(PeerFrame::decode(b"\xff").is_err());
    }
}
