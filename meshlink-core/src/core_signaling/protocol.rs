//! JSON signaling protocol
//!
//! Every frame is a text message `{"type": <name>, "payload": <object>}`.
//! `peer_heartbeat` carries no payload.

use super::errors::SignalingResult;
use super::types::{PeerDescriptor, PeerInfo, RoomInfo, Signal};
use crate::types::{PeerId, RoomId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(default)]
    pub is_private: bool,
}

/// Client → server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    PeerRegister(PeerDescriptor),
    PeerDiscover(RoomRef),
    WebrtcSignal(Signal),
    PeerHeartbeat,
    JoinRoom(RoomRef),
    LeaveRoom(RoomRef),
    CreateRoom(CreateRoomRequest),
}

impl ClientMessage {
    pub fn parse(text: &str) -> SignalingResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> SignalingResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Name used in logs and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::PeerRegister(_) => "peer_register",
            ClientMessage::PeerDiscover(_) => "peer_discover",
            ClientMessage::WebrtcSignal(_) => "webrtc_signal",
            ClientMessage::PeerHeartbeat => "peer_heartbeat",
            ClientMessage::JoinRoom(_) => "join_room",
            ClientMessage::LeaveRoom(_) => "leave_room",
            ClientMessage::CreateRoom(_) => "create_room",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    pub peer_id: PeerId,
    pub rooms: Vec<RoomId>,
}

/// Member snapshot. `room_id` is absent for the list sent after registration,
/// which covers every joined room; `shared_rooms` then says which of the
/// caller's rooms each listed peer is in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub peers: Vec<PeerInfo>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shared_rooms: BTreeMap<PeerId, Vec<RoomId>>,
}

impl PeerList {
    /// Rooms shared with `peer_id` according to this list
    pub fn rooms_of(&self, peer_id: &PeerId) -> Vec<RoomId> {
        match &self.room_id {
            Some(room_id) => vec![room_id.clone()],
            None => self.shared_rooms.get(peer_id).cloned().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerJoined {
    pub room_id: RoomId,
    pub peer: PeerInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLeft {
    pub room_id: RoomId,
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Server → client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered(Registered),
    PeerList(PeerList),
    PeerJoined(PeerJoined),
    PeerLeft(PeerLeft),
    RoomCreated(RoomInfo),
    WebrtcSignal(Signal),
    Error(ErrorPayload),
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn parse(text: &str) -> SignalingResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> SignalingResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_signaling::types::SignalKind;
    use crate::types::Timestamp;

    #[test]
    fn test_parse_register() {
        let text = r#"{"type":"peer_register","payload":{"nickname":"ana","rooms":["ops"],"publicKey":"pk"}}"#;
        match ClientMessage::parse(text).unwrap() {
            ClientMessage::PeerRegister(d) => {
                assert_eq!(d.nickname, "ana");
                assert_eq!(d.rooms, vec![RoomId::from("ops")]);
                assert_eq!(d.public_key, "pk");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_has_no_payload() {
        let text = ClientMessage::PeerHeartbeat.to_text().unwrap();
        assert_eq!(text, r#"{"type":"peer_heartbeat"}"#);
        assert_eq!(
            ClientMessage::parse(r#"{"type":"peer_heartbeat"}"#).unwrap(),
            ClientMessage::PeerHeartbeat
        );
    }

    #[test]
    fn test_room_payloads_use_camel_case() {
        let msg = ClientMessage::parse(r#"{"type":"join_room","payload":{"roomId":"r1"}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinRoom(RoomRef {
                room_id: RoomId::from("r1")
            })
        );

        let create =
            ClientMessage::parse(r#"{"type":"create_room","payload":{"name":"Ops","isPrivate":true}}"#)
                .unwrap();
        assert_eq!(create.name(), "create_room");
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        assert!(ClientMessage::parse(r#"{"type":"teleport","payload":{}}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn test_server_message_shape() {
        let msg = ServerMessage::Registered(Registered {
            peer_id: PeerId::from("p1"),
            rooms: vec![RoomId::from("ops")],
        });
        let value: serde_json::Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "registered");
        assert_eq!(value["payload"]["peerId"], "p1");

        let err = ServerMessage::error("Room ops is full").to_text().unwrap();
        assert_eq!(
            err,
            r#"{"type":"error","payload":{"message":"Room ops is full"}}"#
        );
    }

    #[test]
    fn test_signal_relays_through_both_enums() {
        let signal = Signal {
            from: PeerId::from("a"),
            to: PeerId::from("b"),
            kind: SignalKind::Offer,
            data: serde_json::json!({"sdp": "v=0"}),
            timestamp: Timestamp::from_millis(1),
        };
        let text = ClientMessage::WebrtcSignal(signal.clone()).to_text().unwrap();
        assert_eq!(
            ServerMessage::parse(&text).unwrap(),
            ServerMessage::WebrtcSignal(signal)
        );
    }

    #[test]
    fn test_peer_list_rooms_of() {
        let registration = PeerList {
            room_id: None,
            peers: vec![],
            shared_rooms: BTreeMap::from([(
                PeerId::from("b"),
                vec![RoomId::from("dev"), RoomId::from("ops")],
            )]),
        };
        assert_eq!(registration.rooms_of(&PeerId::from("b")).len(), 2);
        assert!(registration.rooms_of(&PeerId::from("c")).is_empty());

        let value: serde_json::Value =
            serde_json::from_str(&ServerMessage::PeerList(registration).to_text().unwrap()).unwrap();
        assert_eq!(value["payload"]["sharedRooms"]["b"][1], "ops");

        let discovered = PeerList {
            room_id: Some(RoomId::from("ops")),
            peers: vec![],
            shared_rooms: BTreeMap::new(),
        };
        assert_eq!(discovered.rooms_of(&PeerId::from("b")), vec![RoomId::from("ops")]);
        let text = ServerMessage::PeerList(discovered).to_text().unwrap();
        assert!(!text.contains("sharedRooms"));
    }
}
