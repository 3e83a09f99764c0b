//! Causal message synchronization
//!
//! [`SyncEngine`] is synchronous owned state; the node drives it from its
//! event loop and moves [`PeerFrame`]s over direct transports.

pub mod engine;
pub mod errors;
pub mod frame;
pub mod message;
pub mod vector_clock;

pub use engine::{MaintenanceReport, ReceiveOutcome, SyncBatch, SyncEngine, SyncEvent};
pub use errors::{SyncError, SyncResult};
pub use frame::PeerFrame;
pub use message::{DeliveryStatus, MessageId, MessageKind, SyncMessage};
pub use vector_clock::VectorClock;
