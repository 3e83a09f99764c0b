//! Hot cache of recent messages, one bounded slice per room
//!
//! Rooms are evicted least-recently-used; within a slice only the newest
//! `per_room` messages (by timestamp, then id) are kept.

use super::records::MessageRecord;
use crate::core_sync::{DeliveryStatus, MessageId};
use crate::types::RoomId;
use hashlink::LruCache;

pub struct MessageCache {
    rooms: LruCache<RoomId, Vec<MessageRecord>>,
    per_room: usize,
}

impl MessageCache {
    pub fn new(rooms: usize, per_room: usize) -> Self {
        MessageCache {
            rooms: LruCache::new(rooms.max(1)),
            per_room: per_room.max(1),
        }
    }

    /// Insert or replace a message in its room slice
    pub fn insert(&mut self, record: MessageRecord) {
        let room = record.room().clone();
        if self.rooms.get(&room).is_none() {
            self.rooms.insert(room.clone(), Vec::new());
        }
        let Some(slice) = self.rooms.get_mut(&room) else {
            return;
        };

        slice.retain(|existing| existing.id() != record.id());
        let key = (record.timestamp(), record.id().clone());
        let at = slice.partition_point(|r| (r.timestamp(), r.id().clone()) < key);
        slice.insert(at, record);

        let excess = slice.len().saturating_sub(self.per_room);
        if excess > 0 {
            slice.drain(..excess);
        }
    }

    /// Set the status of a cached message. Returns false if it is not cached.
    pub fn update_status(&mut self, id: &MessageId, status: DeliveryStatus) -> bool {
        for (_, slice) in self.rooms.iter_mut() {
            if let Some(record) = slice.iter_mut().find(|r| r.id() == id) {
                record.status = status;
                return true;
            }
        }
        false
    }

    /// Cached slice of a room, oldest first
    pub fn slice(&mut self, room: &RoomId) -> Vec<MessageRecord> {
        self.rooms.get(room).cloned().unwrap_or_default()
    }

    pub fn get(&self, id: &MessageId) -> Option<MessageRecord> {
        self.rooms
            .iter()
            .find_map(|(_, slice)| slice.iter().find(|r| r.id() == id))
            .cloned()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
