/*
    MemoryHub - in-process direct transport

    Every endpoint is keyed by (local, remote). Two endpoints are linked once
    both sides have a local and a remote description; both then see
    ChannelOpen and payloads flow as TransportEvent::Data. Used by tests and
    local demos in place of a real peer-to-peer transport.
*/

use super::errors::{ConnectionError, ConnectionResult};
use super::transport::{
    DirectTransport, IceCandidate, SdpKind, SessionDescription, TransportEvent, TransportFactory,
    TransportState,
};
use crate::types::PeerId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

type EndpointKey = (PeerId, PeerId);

struct Endpoint {
    events: mpsc::UnboundedSender<TransportEvent>,
    generation: u64,
    local_set: bool,
    remote_set: bool,
    candidates: usize,
    open: bool,
    ice_servers: Vec<String>,
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<EndpointKey, Endpoint>,
    /// Round-trip measurements per (local, remote), kept across close
    rtt_samples: HashMap<EndpointKey, usize>,
    next_generation: u64,
}

#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Break the link between two peers as a network failure would
    pub fn sever(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.lock();
        for key in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            if let Some(endpoint) = state.endpoints.get_mut(&key) {
                if endpoint.open {
                    endpoint.open = false;
                    let _ = endpoint.events.send(TransportEvent::ChannelClosed);
                    let _ = endpoint
                        .events
                        .send(TransportEvent::StateChanged(TransportState::Disconnected));
                }
            }
        }
    }

    /// Relink two severed endpoints
    pub fn restore(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.lock();
        Self::try_link(&mut state, a, b);
    }

    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        let state = self.lock();
        let forward = state.endpoints.get(&(a.clone(), b.clone()));
        let backward = state.endpoints.get(&(b.clone(), a.clone()));
        matches!((forward, backward), (Some(f), Some(b)) if f.open && b.open)
    }

    /// ICE servers the (local, remote) endpoint was created with
    pub fn ice_servers(&self, local: &PeerId, remote: &PeerId) -> Vec<String> {
        self.lock()
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .map(|e| e.ice_servers.clone())
            .unwrap_or_default()
    }

    /// Round-trip measurements taken by the (local, remote) transport
    pub fn rtt_samples(&self, local: &PeerId, remote: &PeerId) -> usize {
        self.lock()
            .rtt_samples
            .get(&(local.clone(), remote.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Remote candidates applied on the (local, remote) endpoint
    pub fn candidates_applied(&self, local: &PeerId, remote: &PeerId) -> usize {
        self.lock()
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .map(|e| e.candidates)
            .unwrap_or(0)
    }

    fn try_link(state: &mut HubState, a: &PeerId, b: &PeerId) {
        let ready = |e: Option<&Endpoint>| e.map(|e| e.local_set && e.remote_set).unwrap_or(false);
        let forward = (a.clone(), b.clone());
        let backward = (b.clone(), a.clone());
        if !ready(state.endpoints.get(&forward)) || !ready(state.endpoints.get(&backward)) {
            return;
        }

        for key in [forward, backward] {
            if let Some(endpoint) = state.endpoints.get_mut(&key) {
                if !endpoint.open {
                    endpoint.open = true;
                    let _ = endpoint
                        .events
                        .send(TransportEvent::StateChanged(TransportState::Connected));
                    let _ = endpoint.events.send(TransportEvent::ChannelOpen);
                }
            }
        }
        trace!(a = %a, b = %b, "Memory endpoints linked");
    }
}

impl TransportFactory for MemoryHub {
    fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        ice_servers: &[String],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> ConnectionResult<Arc<dyn DirectTransport>> {
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        state.endpoints.insert(
            (local.clone(), remote.clone()),
            Endpoint {
                events,
                generation,
                local_set: false,
                remote_set: false,
                candidates: 0,
                open: false,
                ice_servers: ice_servers.to_vec(),
            },
        );

        Ok(Arc::new(MemoryTransport {
            hub: self.clone(),
            local: local.clone(),
            remote: remote.clone(),
            generation,
        }))
    }
}

pub struct MemoryTransport {
    hub: MemoryHub,
    local: PeerId,
    remote: PeerId,
    generation: u64,
}

impl MemoryTransport {
    fn key(&self) -> EndpointKey {
        (self.local.clone(), self.remote.clone())
    }

    /// Run `f` on this transport's endpoint unless it was replaced or closed
    fn with_endpoint<T>(
        &self,
        f: impl FnOnce(&mut Endpoint) -> T,
    ) -> ConnectionResult<T> {
        let mut state = self.hub.lock();
        match state.endpoints.get_mut(&self.key()) {
            Some(endpoint) if endpoint.generation == self.generation => Ok(f(endpoint)),
            _ => Err(ConnectionError::Transport("memory endpoint closed".to_string())),
        }
    }

    fn describe(&self, kind: SdpKind) -> ConnectionResult<SessionDescription> {
        self.with_endpoint(|endpoint| {
            endpoint.local_set = true;
            let _ = endpoint.events.send(TransportEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:memory {}", self.local),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            }));
        })?;
        Self::link(&self.hub, &self.local, &self.remote);

        let label = match kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        Ok(SessionDescription {
            kind,
            sdp: format!("memory-{} {}->{}", label, self.local, self.remote),
        })
    }

    fn link(hub: &MemoryHub, a: &PeerId, b: &PeerId) {
        let mut state = hub.lock();
        MemoryHub::try_link(&mut state, a, b);
    }
}

#[async_trait]
impl DirectTransport for MemoryTransport {
    async fn create_data_channel(&self, _label: &str) -> ConnectionResult<()> {
        self.with_endpoint(|_| ())
    }

    async fn create_offer(&self) -> ConnectionResult<SessionDescription> {
        self.describe(SdpKind::Offer)
    }

    async fn create_answer(&self) -> ConnectionResult<SessionDescription> {
        self.describe(SdpKind::Answer)
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> ConnectionResult<()> {
        self.with_endpoint(|endpoint| endpoint.remote_set = true)?;
        Self::link(&self.hub, &self.local, &self.remote);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> ConnectionResult<()> {
        self.with_endpoint(|endpoint| endpoint.candidates += 1)
    }

    async fn send(&self, payload: &[u8]) -> ConnectionResult<()> {
        let state = self.hub.lock();
        let own_open = state
            .endpoints
            .get(&self.key())
            .map(|e| e.generation == self.generation && e.open)
            .unwrap_or(false);
        match state.endpoints.get(&(self.remote.clone(), self.local.clone())) {
            Some(remote) if own_open && remote.open => remote
                .events
                .send(TransportEvent::Data(payload.to_vec()))
                .map_err(|_| ConnectionError::ChannelNotOpen),
            _ => Err(ConnectionError::ChannelNotOpen),
        }
    }

    async fn round_trip_time(&self) -> Option<Duration> {
        *self.hub.lock().rtt_samples.entry(self.key()).or_insert(0) += 1;
        let open = self.with_endpoint(|e| e.open).unwrap_or(false);
        open.then(|| Duration::from_millis(1))
    }

    async fn close(&self) {
        let mut state = self.hub.lock();
        let key = self.key();
        let owned = state
            .endpoints
            .get(&key)
            .map(|e| e.generation == self.generation)
            .unwrap_or(false);
        let removed = if owned { state.endpoints.remove(&key) } else { None };

        if let Some(endpoint) = removed {
            let _ = endpoint
                .events
                .send(TransportEvent::StateChanged(TransportState::Closed));
            if let Some(remote) = state
                .endpoints
                .get_mut(&(self.remote.clone(), self.local.clone()))
            {
                if remote.open {
                    remote.open = false;
                    let _ = remote.events.send(TransportEvent::ChannelClosed);
                }
            }
        }
    }
}
