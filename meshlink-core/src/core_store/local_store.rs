/*
    local_store.rs - Cached, batched persistence of messages, peers and rooms

    Write path:
    - messages go into the room cache and onto the write queue
    - peers, rooms and status changes go onto the queue only (status
      changes also patch the cached copy)
    - the queue is drained into durable storage in one transaction per
      flush, on the flusher tick, on demand and at shutdown

    Read path: a room's cached slice answers when it holds enough messages,
    otherwise durable rows are merged with the cache and the unflushed queue.

    A failed flush is logged and counted; the batch is dropped and the cache
    is left as is.
*/

use super::cache::MessageCache;
use super::durable::{DurableStore, SqliteStore};
use super::errors::{StoreError, StoreResult};
use super::records::{MessageRecord, PeerRecord, RoomRecord, WriteOp};
use crate::config::StoreConfig;
use crate::core_sync::{DeliveryStatus, MessageId, SyncMessage};
use crate::metrics;
use crate::shutdown::ShutdownSignal;
use crate::types::RoomId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const DATABASE_FILE: &str = "meshlink.db";

fn handle_poison<T>(_err: PoisonError<T>) -> StoreError {
    StoreError::Internal("Lock poisoned: a thread panicked while holding the lock".to_string())
}

pub struct LocalStore {
    cache: Mutex<MessageCache>,
    queue: Mutex<Vec<WriteOp>>,
    durable: Arc<dyn DurableStore>,
    failed_flushes: AtomicU64,
}

impl LocalStore {
    pub fn new(durable: Arc<dyn DurableStore>, config: &StoreConfig) -> Self {
        LocalStore {
            cache: Mutex::new(MessageCache::new(config.cache_rooms, config.cache_messages_per_room)),
            queue: Mutex::new(Vec::new()),
            durable,
            failed_flushes: AtomicU64::new(0),
        }
    }

    /// SQLite database under `config.data_dir`
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let path = config.data_dir.join(DATABASE_FILE);
        info!(path = %path.display(), "Opening local store");
        Ok(Self::new(Arc::new(SqliteStore::open(path)?), config))
    }

    pub fn in_memory(config: &StoreConfig) -> StoreResult<Self> {
        Ok(Self::new(Arc::new(SqliteStore::memory()?), config))
    }

    pub fn save_message(&self, message: SyncMessage, status: DeliveryStatus) -> StoreResult<()> {
        let record = MessageRecord::new(message, status);
        self.cache.lock().map_err(handle_poison)?.insert(record.clone());
        self.enqueue(WriteOp::Message(record))
    }

    pub fn update_status(&self, id: &MessageId, status: DeliveryStatus) -> StoreResult<()> {
        self.cache.lock().map_err(handle_poison)?.update_status(id, status);
        self.enqueue(WriteOp::Status {
            id: id.clone(),
            status,
        })
    }

    pub fn save_peer(&self, peer: PeerRecord) -> StoreResult<()> {
        self.enqueue(WriteOp::Peer(peer))
    }

    pub fn save_room(&self, room: RoomRecord) -> StoreResult<()> {
        self.enqueue(WriteOp::Room(room))
    }

    /// Newest `limit` messages of a room, oldest first
    pub fn messages(&self, room: &RoomId, limit: usize) -> StoreResult<Vec<MessageRecord>> {
        let cached = self.cache.lock().map_err(handle_poison)?.slice(room);
        if cached.len() >= limit {
            let skip = cached.len() - limit;
            return Ok(cached.into_iter().skip(skip).collect());
        }

        let mut merged: BTreeMap<MessageId, MessageRecord> = BTreeMap::new();
        for record in self.durable.messages(room, limit)? {
            merged.insert(record.id().clone(), record);
        }
        for op in self.lock_queue()?.iter() {
            match op {
                WriteOp::Message(record) if record.room() == room => {
                    merged.insert(record.id().clone(), record.clone());
                }
                WriteOp::Status { id, status } => {
                    if let Some(record) = merged.get_mut(id) {
                        record.status = *status;
                    }
                }
                _ => {}
            }
        }
        for record in cached {
            merged.insert(record.id().clone(), record);
        }

        let mut records: Vec<MessageRecord> = merged.into_values().collect();
        records.sort_by(|a, b| (a.timestamp(), a.id()).cmp(&(b.timestamp(), b.id())));
        let skip = records.len().saturating_sub(limit);
        Ok(records.into_iter().skip(skip).collect())
    }

    pub fn message(&self, id: &MessageId) -> StoreResult<Option<MessageRecord>> {
        if let Some(record) = self.cache.lock().map_err(handle_poison)?.get(id) {
            return Ok(Some(record));
        }
        self.durable.message(id)
    }

    pub fn peers(&self) -> StoreResult<Vec<PeerRecord>> {
        self.durable.peers()
    }

    pub fn rooms(&self) -> StoreResult<Vec<RoomRecord>> {
        self.durable.rooms()
    }

    /// Write the queued batch. Returns how many ops were persisted.
    pub fn flush(&self) -> usize {
        let batch = match self.lock_queue() {
            Ok(mut queue) => std::mem::take(&mut *queue),
            Err(e) => {
                error!(error = %e, "Store queue unavailable");
                return 0;
            }
        };
        metrics::store_queue_depth(0);
        if batch.is_empty() {
            return 0;
        }

        let timer = metrics::Timer::new("meshlink_store_flush_duration_ms");
        let result = self.durable.apply_batch(&batch);
        timer.stop();

        match result {
            Ok(()) => {
                debug!(ops = batch.len(), "Flushed store batch");
                metrics::store_flush(true);
                batch.len()
            }
            Err(e) => {
                self.failed_flushes.fetch_add(1, Ordering::Relaxed);
                metrics::store_flush(false);
                error!(error = %e, ops = batch.len(), "Failed to persist store batch");
                0
            }
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.lock_queue().map(|q| q.len()).unwrap_or(0)
    }

    pub fn failed_flushes(&self) -> u64 {
        self.failed_flushes.load(Ordering::Relaxed)
    }

    fn enqueue(&self, op: WriteOp) -> StoreResult<()> {
        let mut queue = self.lock_queue()?;
        queue.push(op);
        metrics::store_queue_depth(queue.len());
        Ok(())
    }

    fn lock_queue(&self) -> StoreResult<MutexGuard<'_, Vec<WriteOp>>> {
        self.queue.lock().map_err(handle_poison)
    }
}

/// Flush on every tick; a final flush runs when shutdown is signalled
pub fn spawn_flusher(
    store: Arc<LocalStore>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<ShutdownSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    store.flush();
                }
                _ = shutdown.recv() => {
                    let written = store.flush();
                    info!(ops = written, "Store flusher stopped");
                    break;
                }
            }
        }
    })
}
