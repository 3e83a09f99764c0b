/*
    durable.rs - Durable storage behind the local store

    DurableStore is the seam the batching queue writes through. SqliteStore is
    the production backend: an r2d2 pool of rusqlite connections, schema
    managed by versioned migrations, each batch applied in one transaction.
*/

use super::errors::{StoreError, StoreResult};
use super::migrations;
use super::records::{MessageRecord, PeerRecord, RoomRecord, WriteOp};
use crate::core_sync::{DeliveryStatus, MessageId, MessageKind, SyncMessage, VectorClock};
use crate::types::{PeerId, RoomId, Timestamp};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;

pub trait DurableStore: Send + Sync {
    /// Apply every op atomically
    fn apply_batch(&self, ops: &[WriteOp]) -> StoreResult<()>;

    /// Newest `limit` messages of a room, oldest first
    fn messages(&self, room: &RoomId, limit: usize) -> StoreResult<Vec<MessageRecord>>;

    fn message(&self, id: &MessageId) -> StoreResult<Option<MessageRecord>>;

    fn peers(&self) -> StoreResult<Vec<PeerRecord>>;

    fn rooms(&self) -> StoreResult<Vec<RoomRecord>>;
}

const MESSAGE_COLUMNS: &str =
    "id, room_id, sender, recipient, content, timestamp, vector_clock, causality, kind, status";

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref());
        let pool = Pool::new(manager)?;
        Self::with_pool(pool)
    }

    /// In-memory database. A single pooled connection keeps it shared.
    pub fn memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        Self::with_pool(pool)
    }

    fn with_pool(pool: Pool<SqliteConnectionManager>) -> StoreResult<Self> {
        migrations::migrate(&*pool.get()?)?;
        Ok(SqliteStore { pool })
    }
}

impl DurableStore for SqliteStore {
    fn apply_batch(&self, ops: &[WriteOp]) -> StoreResult<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        for op in ops {
            match op {
                WriteOp::Message(record) => {
                    let m = &record.message;
                    tx.execute(
                        "INSERT OR REPLACE INTO messages (id, room_id, sender, recipient, content, timestamp, vector_clock, causality, kind, status)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                        params![
                            m.id.as_str(),
                            m.room.as_str(),
                            m.from.as_str(),
                            m.to.as_ref().map(|p| p.as_str()),
                            &m.content,
                            m.timestamp.as_millis() as i64,
                            serde_json::to_string(&m.vector_clock)?,
                            serde_json::to_string(&m.causality)?,
                            m.kind.as_str(),
                            record.status.as_str(),
                        ],
                    )?;
                }
                WriteOp::Status { id, status } => {
                    tx.execute(
                        "UPDATE messages SET status = ? WHERE id = ?",
                        params![status.as_str(), id.as_str()],
                    )?;
                }
                WriteOp::Peer(peer) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO peers (peer_id, nickname, fingerprint, last_seen)
                         VALUES (?, ?, ?, ?)",
                        params![
                            peer.peer_id.as_str(),
                            &peer.nickname,
                            &peer.fingerprint,
                            peer.last_seen.as_millis() as i64,
                        ],
                    )?;
                }
                WriteOp::Room(room) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO rooms (room_id, name, is_private, created_at)
                         VALUES (?, ?, ?, ?)",
                        params![
                            room.room_id.as_str(),
                            &room.name,
                            room.is_private,
                            room.created_at.as_millis() as i64,
                        ],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn messages(&self, room: &RoomId, limit: usize) -> StoreResult<Vec<MessageRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages WHERE room_id = ? ORDER BY timestamp DESC, id DESC LIMIT ?",
            MESSAGE_COLUMNS
        ))?;

        let rows = stmt.query_map(params![room.as_str(), limit as i64], RawMessage::from_row)?;
        let mut records = rows
            .map(|row| row.map_err(StoreError::from).and_then(RawMessage::decode))
            .collect::<StoreResult<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }

    fn message(&self, id: &MessageId) -> StoreResult<Option<MessageRecord>> {
        let conn = self.pool.get()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS),
                params![id.as_str()],
                RawMessage::from_row,
            )
            .optional()?;
        raw.map(RawMessage::decode).transpose()
    }

    fn peers(&self) -> StoreResult<Vec<PeerRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn
            .prepare("SELECT peer_id, nickname, fingerprint, last_seen FROM peers ORDER BY peer_id")?;
        let peers = stmt
            .query_map([], |row| {
                Ok(PeerRecord {
                    peer_id: PeerId::new(row.get::<_, String>(0)?),
                    nickname: row.get(1)?,
                    fingerprint: row.get(2)?,
                    last_seen: Timestamp::from_millis(row.get::<_, i64>(3)?.max(0) as u64),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(peers)
    }

    fn rooms(&self) -> StoreResult<Vec<RoomRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn
            .prepare("SELECT room_id, name, is_private, created_at FROM rooms ORDER BY room_id")?;
        let rooms = stmt
            .query_map([], |row| {
                Ok(RoomRecord {
                    room_id: RoomId::new(row.get::<_, String>(0)?),
                    name: row.get(1)?,
                    is_private: row.get(2)?,
                    created_at: Timestamp::from_millis(row.get::<_, i64>(3)?.max(0) as u64),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rooms)
    }
}

/// Message row before its text columns are parsed
struct RawMessage {
    id: String,
    room: String,
    sender: String,
    recipient: Option<String>,
    content: String,
    timestamp: i64,
    vector_clock: String,
    causality: String,
    kind: String,
    status: String,
}

impl RawMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawMessage {
            id: row.get(0)?,
            room: row.get(1)?,
            sender: row.get(2)?,
            recipient: row.get(3)?,
            content: row.get(4)?,
            timestamp: row.get(5)?,
            vector_clock: row.get(6)?,
            causality: row.get(7)?,
            kind: row.get(8)?,
            status: row.get(9)?,
        })
    }

    fn decode(self) -> StoreResult<MessageRecord> {
        let vector_clock: VectorClock = serde_json::from_str(&self.vector_clock)?;
        let causality: Vec<MessageId> = serde_json::from_str(&self.causality)?;
        let kind: MessageKind = self.kind.parse().map_err(StoreError::CorruptedData)?;
        let status: DeliveryStatus = self.status.parse().map_err(StoreError::CorruptedData)?;

        Ok(MessageRecord {
            message: SyncMessage {
                id: MessageId(self.id),
                from: PeerId::new(self.sender),
                room: RoomId::new(self.room),
                to: self.recipient.map(PeerId::new),
                content: self.content,
                timestamp: Timestamp::from_millis(self.timestamp.max(0) as u64),
                vector_clock,
                causality,
                kind,
            },
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(room: &str, counter: u64, ts: u64) -> MessageRecord {
        let from = PeerId::from("a");
        let timestamp = Timestamp::from_millis(ts);
        MessageRecord::new(
            SyncMessage {
                id: MessageId::derive(&from, counter, timestamp),
                from,
                room: RoomId::from(room),
                to: if counter % 2 == 0 { Some(PeerId::from("b")) } else { None },
                content: format!("m{}", counter),
                timestamp,
                vector_clock: VectorClock::from([("a", counter), ("b", 2)]),
                causality: vec![MessageId("dep".into())],
                kind: MessageKind::Text,
            },
            DeliveryStatus::Sent,
        )
    }

    #[test]
    fn test_batch_round_trips_messages() {
        let store = SqliteStore::memory().unwrap();
        let ops: Vec<WriteOp> = (1..=4).map(|i| WriteOp::Message(record("ops", i, i * 10))).collect();
        store.apply_batch(&ops).unwrap();

        let recent = store.messages(&RoomId::from("ops"), 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0], record("ops", 3, 30));
        assert_eq!(recent[1], record("ops", 4, 40));
        assert!(store.messages(&RoomId::from("other"), 10).unwrap().is_empty());
    }

    #[test]
    fn test_status_update_follows_insert_in_same_batch() {
        let store = SqliteStore::memory().unwrap();
        let r = record("ops", 1, 10);
        let id = r.id().clone();
        store
            .apply_batch(&[
                WriteOp::Message(r),
                WriteOp::Status {
                    id: id.clone(),
                    status: DeliveryStatus::Read,
                },
            ])
            .unwrap();

        assert_eq!(store.message(&id).unwrap().unwrap().status, DeliveryStatus::Read);
        assert!(store.message(&MessageId("nope".into())).unwrap().is_none());
    }

    #[test]
    fn test_peers_and_rooms_upsert() {
        let store = SqliteStore::memory().unwrap();
        let mut peer = PeerRecord {
            peer_id: PeerId::from("p1"),
            nickname: "ada".into(),
            fingerprint: "ab12".into(),
            last_seen: Timestamp::from_millis(5),
        };
        let room = RoomRecord {
            room_id: RoomId::from("ops"),
            name: "Ops".into(),
            is_private: true,
            created_at: Timestamp::from_millis(1),
        };
        store
            .apply_batch(&[WriteOp::Peer(peer.clone()), WriteOp::Room(room.clone())])
            .unwrap();
        peer.last_seen = Timestamp::from_millis(9);
        store.apply_batch(&[WriteOp::Peer(peer.clone())]).unwrap();

        assert_eq!(store.peers().unwrap(), vec![peer]);
        assert_eq!(store.rooms().unwrap(), vec![room]);
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.apply_batch(&[WriteOp::Message(record("ops", 1, 10))]).unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.messages(&RoomId::from("ops"), 10).unwrap().len(), 1);
    }
}
