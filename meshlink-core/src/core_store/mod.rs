//! Local persistence: a hot per-room cache in front of batched SQLite writes

pub mod cache;
pub mod durable;
pub mod errors;
pub mod local_store;
pub mod migrations;
pub mod records;

pub use cache::MessageCache;
pub use durable::{DurableStore, SqliteStore};
pub use errors::{StoreError, StoreResult};
pub use local_store::{spawn_flusher, LocalStore};
pub use records::{MessageRecord, PeerRecord, RoomRecord, WriteOp};
