/*
    Signaling data model

    Peers and rooms as the registry stores them, plus the wire views handed
    to clients (PeerInfo, RoomInfo) and the relayed Signal.
*/

use crate::types::{ConnId, PeerId, RoomId, Timestamp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// What a client supplies in `peer_register`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    pub nickname: String,
    #[serde(default)]
    pub rooms: Vec<RoomId>,
    #[serde(default)]
    pub public_key: String,
}

/// Hex SHA-256 of a public key, truncated to 16 bytes
pub fn fingerprint(public_key: &str) -> String {
    if public_key.is_empty() {
        return String::new();
    }
    let digest = Sha256::digest(public_key.as_bytes());
    hex::encode(&digest[..16])
}

/// A registered peer
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub conn_id: ConnId,
    pub rooms: BTreeSet<RoomId>,
    pub last_seen: Timestamp,
    pub nickname: String,
    pub fingerprint: String,
}

impl Peer {
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.id.clone(),
            nickname: self.nickname.clone(),
            fingerprint: self.fingerprint.clone(),
            last_seen: self.last_seen,
        }
    }
}

/// Peer as seen by other clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub nickname: String,
    pub fingerprint: String,
    pub last_seen: Timestamp,
}

#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub members: BTreeSet<PeerId>,
    pub created_at: Timestamp,
    pub is_private: bool,
    /// Auto-created on join; removed once empty
    pub transient: bool,
}

impl Room {
    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.id.clone(),
            name: self.name.clone(),
            is_private: self.is_private,
            member_count: self.members.len(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub name: String,
    pub is_private: bool,
    pub member_count: usize,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Negotiation data relayed between two peers, never stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub from: PeerId,
    pub to: PeerId,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: serde_json::Value,
    pub timestamp: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_truncated_hex() {
        let fp = fingerprint("-----BEGIN PUBLIC KEY-----abc");
        assert_eq!(fp.len(), 32);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, fingerprint("-----BEGIN PUBLIC KEY-----abc"));
        assert_eq!(fingerprint(""), "");
    }

    #[test]
    fn test_signal_wire_shape() {
        let json = r#"{"from":"a","to":"b","type":"ice-candidate","data":{"candidate":"c1"},"timestamp":5}"#;
        let signal: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(signal.kind, SignalKind::IceCandidate);
        assert_eq!(signal.to, PeerId::from("b"));

        let back = serde_json::to_value(&signal).unwrap();
        assert_eq!(back["type"], "ice-candidate");
        assert_eq!(back["data"]["candidate"], "c1");
    }

    #[test]
    fn test_descriptor_defaults() {
        let d: PeerDescriptor = serde_json::from_str(r#"{"nickname":"ana"}"#).unwrap();
        assert!(d.rooms.is_empty());
        assert!(d.public_key.is_empty());
    }
}
