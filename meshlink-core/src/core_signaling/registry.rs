/*
    PeerRegistry - authoritative peer and room bookkeeping

    Plain owned state: the signaling service owns one instance and is the only
    caller, so there are no locks here. Every mutation keeps two invariants:
    - a room's member set only contains registered peers
    - each connection is bound to at most one peer

    Methods return who has to be told about a change; sending is the
    service's job.
*/

use super::errors::{SignalingError, SignalingResult};
use super::types::{fingerprint, Peer, PeerDescriptor, PeerInfo, Room, RoomInfo};
use crate::types::{ConnId, PeerId, RoomId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Aggregate counts for the health surface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_peers: usize,
    pub total_rooms: usize,
    /// Rooms with at least one member
    pub active_rooms: usize,
}

/// A peer that left the registry, with the members that remain in each of its rooms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub peer_id: PeerId,
    pub conn_id: ConnId,
    pub rooms: Vec<(RoomId, Vec<PeerId>)>,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub peer: PeerInfo,
    /// Rooms joined, with the other members present at join time
    pub joined: Vec<(RoomId, Vec<PeerId>)>,
    /// Requested rooms skipped because they were full
    pub rejected: Vec<RoomId>,
    /// Prior registration on the same connection, now removed
    pub replaced: Option<Departure>,
}

pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
    rooms: HashMap<RoomId, Room>,
    bindings: HashMap<ConnId, PeerId>,
    max_peers_per_room: usize,
}

impl PeerRegistry {
    pub fn new(max_peers_per_room: usize) -> Self {
        PeerRegistry {
            peers: HashMap::new(),
            rooms: HashMap::new(),
            bindings: HashMap::new(),
            max_peers_per_room,
        }
    }

    /// Register a peer on a connection, replacing whatever was bound to it
    pub fn register(
        &mut self,
        descriptor: PeerDescriptor,
        conn_id: ConnId,
        now: Timestamp,
    ) -> Registration {
        let replaced = self.unregister_conn(conn_id);

        let peer_id = PeerId::generate();
        let peer = Peer {
            id: peer_id.clone(),
            conn_id,
            rooms: BTreeSet::new(),
            last_seen: now,
            nickname: descriptor.nickname,
            fingerprint: fingerprint(&descriptor.public_key),
        };
        self.peers.insert(peer_id.clone(), peer);
        self.bindings.insert(conn_id, peer_id.clone());

        let mut joined = Vec::new();
        let mut rejected = Vec::new();
        let mut requested = descriptor.rooms;
        requested.dedup();
        for room_id in requested {
            match self.join_room(&peer_id, &room_id, now) {
                Ok(Some(others)) => joined.push((room_id, others)),
                Ok(None) => {}
                Err(e) => {
                    debug!(peer_id = %peer_id, room_id = %room_id, "Skipping room: {}", e);
                    rejected.push(room_id);
                }
            }
        }

        let peer = self.peers[&peer_id].info();
        Registration {
            peer,
            joined,
            rejected,
            replaced,
        }
    }

    /// Remove a peer from every room and free its connection binding
    pub fn unregister(&mut self, peer_id: &PeerId) -> Option<Departure> {
        let peer = self.peers.remove(peer_id)?;
        if self.bindings.get(&peer.conn_id) == Some(peer_id) {
            self.bindings.remove(&peer.conn_id);
        }

        let mut rooms = Vec::with_capacity(peer.rooms.len());
        for room_id in peer.rooms {
            if let Some(remaining) = self.remove_member(&room_id, peer_id) {
                rooms.push((room_id, remaining));
            }
        }

        Some(Departure {
            peer_id: peer.id,
            conn_id: peer.conn_id,
            rooms,
        })
    }

    /// Unregister whichever peer is bound to `conn_id`
    pub fn unregister_conn(&mut self, conn_id: ConnId) -> Option<Departure> {
        let peer_id = self.bindings.get(&conn_id)?.clone();
        self.unregister(&peer_id)
    }

    pub fn peer_for_conn(&self, conn_id: ConnId) -> Option<&PeerId> {
        self.bindings.get(&conn_id)
    }

    pub fn conn_for_peer(&self, peer_id: &PeerId) -> Option<ConnId> {
        self.peers.get(peer_id).map(|p| p.conn_id)
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn room(&self, room_id: &RoomId) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    /// Record activity. Returns false for an unknown peer.
    pub fn touch(&mut self, peer_id: &PeerId, now: Timestamp) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Add a registered peer to a room, auto-creating it as transient.
    ///
    /// Returns the other members on success, `None` if the peer was already
    /// a member.
    pub fn join_room(
        &mut self,
        peer_id: &PeerId,
        room_id: &RoomId,
        now: Timestamp,
    ) -> SignalingResult<Option<Vec<PeerId>>> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SignalingError::PeerNotFound(peer_id.clone()))?;

        let room = self.rooms.entry(room_id.clone()).or_insert_with(|| Room {
            id: room_id.clone(),
            name: room_id.to_string(),
            members: BTreeSet::new(),
            created_at: now,
            is_private: false,
            transient: true,
        });

        if room.members.contains(peer_id) {
            return Ok(None);
        }
        if room.members.len() >= self.max_peers_per_room {
            if room.members.is_empty() && room.transient {
                self.rooms.remove(room_id);
            }
            return Err(SignalingError::RoomFull(room_id.clone()));
        }

        let others: Vec<PeerId> = room.members.iter().cloned().collect();
        room.members.insert(peer_id.clone());
        peer.rooms.insert(room_id.clone());
        Ok(Some(others))
    }

    /// Remove a peer from one room. Returns the remaining members, or `None`
    /// if the peer was not a member.
    pub fn leave_room(&mut self, peer_id: &PeerId, room_id: &RoomId) -> Option<Vec<PeerId>> {
        let peer = self.peers.get_mut(peer_id)?;
        if !peer.rooms.remove(room_id) {
            return None;
        }
        self.remove_member(room_id, peer_id)
    }

    /// Create a named room that persists while empty
    pub fn create_room(&mut self, name: String, is_private: bool, now: Timestamp) -> RoomInfo {
        let room = Room {
            id: RoomId::generate(),
            name,
            members: BTreeSet::new(),
            created_at: now,
            is_private,
            transient: false,
        };
        let info = room.info();
        self.rooms.insert(room.id.clone(), room);
        info
    }

    /// Members of `room_id` minus the caller. Empty for an unknown room or
    /// unregistered caller.
    pub fn discover(&self, caller: &PeerId, room_id: &RoomId) -> Vec<PeerInfo> {
        if !self.peers.contains_key(caller) {
            return Vec::new();
        }
        self.room_members(room_id)
            .into_iter()
            .filter(|id| id != caller)
            .filter_map(|id| self.peers.get(&id).map(Peer::info))
            .collect()
    }

    pub fn room_members(&self, room_id: &RoomId) -> Vec<PeerId> {
        self.rooms
            .get(room_id)
            .map(|r| r.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_peers: self.peers.len(),
            total_rooms: self.rooms.len(),
            active_rooms: self.rooms.values().filter(|r| !r.members.is_empty()).count(),
        }
    }

    fn remove_member(&mut self, room_id: &RoomId, peer_id: &PeerId) -> Option<Vec<PeerId>> {
        let room = self.rooms.get_mut(room_id)?;
        room.members.remove(peer_id);
        let remaining: Vec<PeerId> = room.members.iter().cloned().collect();
        if remaining.is_empty() && room.transient {
            debug!(room_id = %room_id, "Pruning empty transient room");
            self.rooms.remove(room_id);
        }
        Some(remaining)
    }
}
