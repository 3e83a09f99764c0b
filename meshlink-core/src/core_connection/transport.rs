//! Direct transport abstraction
//!
//! A concrete transport (WebRTC data channel, in-memory pipe) implements
//! [`DirectTransport`] and reports asynchronous happenings as
//! [`TransportEvent`]s on the channel handed to [`TransportFactory::create`].
//! Creating an offer or answer also applies it as the local description.

use super::errors::ConnectionResult;
use crate::types::PeerId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

/// Low-level transport state as the transport sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    ChannelOpen,
    ChannelClosed,
    Data(Vec<u8>),
}

#[async_trait]
pub trait DirectTransport: Send + Sync {
    async fn create_data_channel(&self, label: &str) -> ConnectionResult<()>;

    async fn create_offer(&self) -> ConnectionResult<SessionDescription>;

    async fn create_answer(&self) -> ConnectionResult<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> ConnectionResult<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> ConnectionResult<()>;

    /// Write one payload to the data channel
    async fn send(&self, payload: &[u8]) -> ConnectionResult<()>;

    /// Current round-trip estimate, if the transport can measure one
    async fn round_trip_time(&self) -> Option<Duration>;

    async fn close(&self);
}

pub trait TransportFactory: Send + Sync {
    /// `ice_servers` are the configured STUN/TURN URLs for this transport
    fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        ice_servers: &[String],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> ConnectionResult<Arc<dyn DirectTransport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_wire_shape() {
        let desc = SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0".to_string(),
        };
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json, serde_json::json!({"type": "answer", "sdp": "v=0"}));
    }

    #[test]
    fn test_candidate_field_names() {
        let c: IceCandidate = serde_json::from_str(
            r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#,
        )
        .unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_m_line_index, Some(0));
    }
}
