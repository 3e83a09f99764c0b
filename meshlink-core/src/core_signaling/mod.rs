//! Peer registry and signaling relay
//!
//! The registry is plain owned state; [`SignalingService`] is the actor that
//! owns it and [`SignalingServer`] exposes it over WebSocket.

pub mod errors;
pub mod protocol;
pub mod rate_limiter;
pub mod registry;
pub mod server;
pub mod service;
pub mod types;

pub use errors::{SignalingError, SignalingResult};
pub use protocol::{ClientMessage, PeerJoined, PeerLeft, PeerList, Registered, RoomRef, ServerMessage};
pub use registry::{PeerRegistry, RegistryStats};
pub use server::{router, ServerState, SignalingServer};
pub use service::{SignalingHandle, SignalingService};
pub use types::{PeerDescriptor, PeerInfo, RoomInfo, Signal, SignalKind};
