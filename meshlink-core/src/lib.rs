pub mod config;
pub mod core_connection;
pub mod core_node;
pub mod core_signaling;
pub mod core_store;
pub mod core_sync;
pub mod events;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod shutdown;
pub mod types;

pub use config::Config;
pub use core_node::{MeshNode, NodeEvent};
pub use core_signaling::{PeerRegistry, SignalingServer};
pub use logging::{init_logging, LogLevel};
pub use types::{PeerId, RoomId, Timestamp};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = Config::default();
    }
}
