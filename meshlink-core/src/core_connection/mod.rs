//! Direct-transport lifecycle and the client's signaling link

pub mod errors;
pub mod manager;
pub mod memory;
pub mod signaling_link;
pub mod state;
pub mod transport;

pub use errors::{ConnectionError, ConnectionResult};
pub use manager::{ConnectionEvent, ConnectionInfo, ConnectionManager, Negotiation};
pub use memory::MemoryHub;
pub use signaling_link::{
    BackoffPolicy, InProcessConnector, LinkChannels, LinkEvent, SignalingConnector, SignalingLink,
    WebSocketConnector,
};
pub use state::ConnectionState;
pub use transport::{
    DirectTransport, IceCandidate, SdpKind, SessionDescription, TransportEvent, TransportFactory,
    TransportState,
};
