/*
    ConnectionManager - one direct transport per remote peer

    Per-peer state lives in a single map owned by the manager. Each slot has:
    - an event pump draining the transport's TransportEvents
    - a health task sampling round-trip time while Connected
    - a grace task armed on entering Disconnected/Failed, closing the
      connection if it has not recovered when it fires

    Slots carry an epoch so that tasks belonging to a closed-and-reopened
    connection never touch the new one. Transports are cloned out of the map
    before being awaited; the map lock is never held across transport calls.

    Negotiation:
    - initiator: Init -> Offering, emits the offer
    - answerer: remote offer -> Answering, emits the answer
    - remote candidates are buffered until the remote description is applied
    - local candidates are held back until the local description is emitted
    - offer collision: the peer with the lower id keeps its offer
*/

use super::errors::{ConnectionError, ConnectionResult};
use super::state::ConnectionState;
use super::transport::{
    DirectTransport, IceCandidate, SdpKind, SessionDescription, TransportEvent, TransportFactory,
    TransportState,
};
use crate::config::ConnectionConfig;
use crate::events::{EventBus, SubscriptionId};
use crate::metrics;
use crate::types::{PeerId, Timestamp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const DATA_CHANNEL_LABEL: &str = "meshlink";

/// Negotiation output to relay to the remote peer
#[derive(Debug, Clone, PartialEq)]
pub enum Negotiation {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        peer_id: PeerId,
        state: ConnectionState,
    },
    Negotiation {
        peer_id: PeerId,
        negotiation: Negotiation,
    },
    Message {
        peer_id: PeerId,
        payload: Vec<u8>,
    },
}

/// Snapshot of one connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub state: ConnectionState,
    pub initiator: bool,
    pub latency: Option<Duration>,
    pub last_activity: Timestamp,
}

struct PeerSlot {
    epoch: u64,
    transport: Arc<dyn DirectTransport>,
    state: ConnectionState,
    initiator: bool,
    remote_description_set: bool,
    pending_remote_candidates: Vec<IceCandidate>,
    local_description_sent: bool,
    pending_local_candidates: Vec<IceCandidate>,
    latency: Option<Duration>,
    last_activity: Timestamp,
    pump: JoinHandle<()>,
    grace: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
}

impl PeerSlot {
    fn cancel_tasks(&mut self) {
        self.pump.abort();
        if let Some(grace) = self.grace.take() {
            grace.abort();
        }
        if let Some(health) = self.health.take() {
            health.abort();
        }
    }

    fn info(&self, peer_id: &PeerId) -> ConnectionInfo {
        ConnectionInfo {
            peer_id: peer_id.clone(),
            state: self.state,
            initiator: self.initiator,
            latency: self.latency,
            last_activity: self.last_activity,
        }
    }
}

struct Inner {
    factory: Arc<dyn TransportFactory>,
    config: ConnectionConfig,
    local_peer: RwLock<Option<PeerId>>,
    slots: Mutex<HashMap<PeerId, PeerSlot>>,
    events: EventBus<ConnectionEvent>,
    next_epoch: AtomicU64,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, config: ConnectionConfig) -> Self {
        ConnectionManager {
            inner: Arc::new(Inner {
                factory,
                config,
                local_peer: RwLock::new(None),
                slots: Mutex::new(HashMap::new()),
                events: EventBus::new(),
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        ConnectionManager { inner }
    }

    /// Set the id this side negotiates as. Changes after a re-registration.
    pub fn set_local_peer(&self, peer_id: PeerId) {
        *self.inner.local_peer.write().unwrap_or_else(|e| e.into_inner()) = Some(peer_id);
    }

    pub fn local_peer(&self) -> Option<PeerId> {
        self.inner
            .local_peer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<ConnectionEvent>) {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Create a connection to `peer_id`. No-op if one already exists.
    pub async fn open(&self, peer_id: &PeerId, initiator: bool) -> ConnectionResult<()> {
        let Some(epoch) = self.create_slot(peer_id, initiator).await? else {
            debug!(peer_id = %peer_id, "Connection already open");
            return Ok(());
        };
        if !initiator {
            return Ok(());
        }

        let transport = self.transport_for(peer_id, epoch).await?;
        if let Err(e) = transport.create_data_channel(DATA_CHANNEL_LABEL).await {
            return Err(self.fail(peer_id, epoch, e).await);
        }
        self.transition(peer_id, epoch, ConnectionState::Offering).await;

        match transport.create_offer().await {
            Ok(offer) => {
                self.emit_local_description(peer_id, epoch, offer).await;
                Ok(())
            }
            Err(e) => Err(self.fail(peer_id, epoch, e).await),
        }
    }

    /// Apply an offer or answer relayed from `peer_id`
    pub async fn apply_remote_description(
        &self,
        peer_id: &PeerId,
        description: SessionDescription,
    ) -> ConnectionResult<()> {
        match description.kind {
            SdpKind::Offer => self.accept_offer(peer_id, description).await,
            SdpKind::Answer => self.accept_answer(peer_id, description).await,
        }
    }

    /// Apply a candidate relayed from `peer_id`, buffering it until the
    /// remote description is known
    pub async fn apply_remote_candidate(
        &self,
        peer_id: &PeerId,
        candidate: IceCandidate,
    ) -> ConnectionResult<()> {
        let transport = {
            let mut slots = self.inner.slots.lock().await;
            let Some(slot) = slots.get_mut(peer_id) else {
                debug!(peer_id = %peer_id, "Candidate for unknown connection dropped");
                return Ok(());
            };
            if !slot.remote_description_set {
                trace!(peer_id = %peer_id, "Buffering remote candidate");
                slot.pending_remote_candidates.push(candidate);
                return Ok(());
            }
            slot.transport.clone()
        };
        transport.add_ice_candidate(candidate).await
    }

    /// Write to the peer's data channel. False if it is not open or the
    /// transport rejects the write.
    pub async fn send(&self, peer_id: &PeerId, payload: &[u8]) -> bool {
        let transport = {
            let slots = self.inner.slots.lock().await;
            match slots.get(peer_id) {
                Some(slot) if slot.state.is_open() => slot.transport.clone(),
                _ => return false,
            }
        };

        match transport.send(payload).await {
            Ok(()) => {
                if let Some(slot) = self.inner.slots.lock().await.get_mut(peer_id) {
                    slot.last_activity = Timestamp::now();
                }
                true
            }
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "Send failed");
                false
            }
        }
    }

    /// Tear down the connection and forget all per-peer state
    pub async fn close(&self, peer_id: &PeerId) {
        let slot = self.inner.slots.lock().await.remove(peer_id);
        if let Some(slot) = slot {
            self.finish_close(peer_id, slot).await;
        }
    }

    pub async fn close_all(&self) {
        let slots: Vec<(PeerId, PeerSlot)> = self.inner.slots.lock().await.drain().collect();
        for (peer_id, slot) in slots {
            self.finish_close(&peer_id, slot).await;
        }
    }

    pub async fn state(&self, peer_id: &PeerId) -> Option<ConnectionState> {
        self.inner.slots.lock().await.get(peer_id).map(|s| s.state)
    }

    pub async fn info(&self, peer_id: &PeerId) -> Option<ConnectionInfo> {
        self.inner
            .slots
            .lock()
            .await
            .get(peer_id)
            .map(|s| s.info(peer_id))
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let slots = self.inner.slots.lock().await;
        let mut peers: Vec<PeerId> = slots
            .iter()
            .filter(|(_, s)| s.state.is_open())
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    async fn create_slot(&self, peer_id: &PeerId, initiator: bool) -> ConnectionResult<Option<u64>> {
        let local = self.local_peer().ok_or(ConnectionError::NoLocalPeer)?;

        let mut slots = self.inner.slots.lock().await;
        if slots.contains_key(peer_id) {
            return Ok(None);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport =
            self.inner
                .factory
                .create(&local, peer_id, &self.inner.config.ice_servers, events_tx)?;
        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
        let pump = tokio::spawn(pump_events(
            Arc::downgrade(&self.inner),
            peer_id.clone(),
            epoch,
            events_rx,
        ));

        slots.insert(
            peer_id.clone(),
            PeerSlot {
                epoch,
                transport,
                state: ConnectionState::Init,
                initiator,
                remote_description_set: false,
                pending_remote_candidates: Vec::new(),
                local_description_sent: false,
                pending_local_candidates: Vec::new(),
                latency: None,
                last_activity: Timestamp::now(),
                pump,
                grace: None,
                health: None,
            },
        );
        info!(peer_id = %peer_id, initiator, "Connection opened");
        metrics::connection_transition(ConnectionState::Init.as_str());
        self.inner.events.publish(ConnectionEvent::StateChanged {
            peer_id: peer_id.clone(),
            state: ConnectionState::Init,
        });
        Ok(Some(epoch))
    }

    async fn accept_offer(
        &self,
        peer_id: &PeerId,
        offer: SessionDescription,
    ) -> ConnectionResult<()> {
        if let Some((state, initiator)) = self.snapshot(peer_id).await {
            let colliding = initiator && matches!(state, ConnectionState::Init | ConnectionState::Offering);
            if colliding {
                let local = self.local_peer().ok_or(ConnectionError::NoLocalPeer)?;
                if local < *peer_id {
                    debug!(peer_id = %peer_id, "Offer collision, keeping local offer");
                    return Ok(());
                }
                info!(peer_id = %peer_id, "Offer collision, answering remote offer");
                self.close(peer_id).await;
            } else if state != ConnectionState::Init {
                info!(peer_id = %peer_id, state = %state, "Renegotiation requested, restarting connection");
                self.close(peer_id).await;
            }
        }

        self.create_slot(peer_id, false).await?;
        let epoch = self.epoch_of(peer_id).await?;
        let transport = self.transport_for(peer_id, epoch).await?;

        if let Err(e) = transport.set_remote_description(offer).await {
            return Err(self.fail(peer_id, epoch, e).await);
        }
        self.transition(peer_id, epoch, ConnectionState::Answering).await;
        self.flush_remote_candidates(peer_id, epoch, &transport).await;

        match transport.create_answer().await {
            Ok(answer) => {
                self.emit_local_description(peer_id, epoch, answer).await;
                Ok(())
            }
            Err(e) => Err(self.fail(peer_id, epoch, e).await),
        }
    }

    async fn accept_answer(
        &self,
        peer_id: &PeerId,
        answer: SessionDescription,
    ) -> ConnectionResult<()> {
        match self.snapshot(peer_id).await {
            Some((ConnectionState::Offering, _)) => {}
            Some((state, _)) => {
                debug!(peer_id = %peer_id, state = %state, "Unexpected answer dropped");
                return Ok(());
            }
            None => {
                debug!(peer_id = %peer_id, "Answer for unknown connection dropped");
                return Ok(());
            }
        }

        let epoch = self.epoch_of(peer_id).await?;
        let transport = self.transport_for(peer_id, epoch).await?;
        if let Err(e) = transport.set_remote_description(answer).await {
            return Err(self.fail(peer_id, epoch, e).await);
        }
        self.flush_remote_candidates(peer_id, epoch, &transport).await;
        Ok(())
    }

    async fn flush_remote_candidates(
        &self,
        peer_id: &PeerId,
        epoch: u64,
        transport: &Arc<dyn DirectTransport>,
    ) {
        let pending = {
            let mut slots = self.inner.slots.lock().await;
            match slots.get_mut(peer_id) {
                Some(slot) if slot.epoch == epoch => {
                    slot.remote_description_set = true;
                    std::mem::take(&mut slot.pending_remote_candidates)
                }
                _ => return,
            }
        };

        for candidate in pending {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                debug!(peer_id = %peer_id, error = %e, "Buffered candidate rejected");
            }
        }
    }

    async fn emit_local_description(
        &self,
        peer_id: &PeerId,
        epoch: u64,
        description: SessionDescription,
    ) {
        let mut slots = self.inner.slots.lock().await;
        let Some(slot) = slots.get_mut(peer_id).filter(|s| s.epoch == epoch) else {
            return;
        };
        slot.local_description_sent = true;
        let held = std::mem::take(&mut slot.pending_local_candidates);

        self.inner.events.publish(ConnectionEvent::Negotiation {
            peer_id: peer_id.clone(),
            negotiation: Negotiation::Description(description),
        });
        for candidate in held {
            self.inner.events.publish(ConnectionEvent::Negotiation {
                peer_id: peer_id.clone(),
                negotiation: Negotiation::Candidate(candidate),
            });
        }
    }

    /// Move to a new state. Returns false if the slot is gone, belongs to
    /// another epoch, or the transition is not allowed.
    async fn transition(&self, peer_id: &PeerId, epoch: u64, next: ConnectionState) -> bool {
        let mut slots = self.inner.slots.lock().await;
        let Some(slot) = slots.get_mut(peer_id).filter(|s| s.epoch == epoch) else {
            return false;
        };
        if slot.state == next {
            return false;
        }
        if !slot.state.can_transition_to(next) {
            debug!(peer_id = %peer_id, from = %slot.state, to = %next, "Ignoring transition");
            return false;
        }

        let previous = slot.state;
        slot.state = next;

        if next.is_open() {
            slot.last_activity = Timestamp::now();
            if let Some(grace) = slot.grace.take() {
                grace.abort();
            }
            if slot.health.is_none() {
                slot.health = Some(self.spawn_health(peer_id.clone(), epoch));
            }
        } else if next.is_degraded() {
            if let Some(health) = slot.health.take() {
                health.abort();
            }
            if slot.grace.is_none() {
                slot.grace = Some(self.spawn_grace(peer_id.clone(), epoch));
            }
        }

        info!(peer_id = %peer_id, from = %previous, to = %next, "Connection state changed");
        metrics::connection_transition(next.as_str());
        self.inner.events.publish(ConnectionEvent::StateChanged {
            peer_id: peer_id.clone(),
            state: next,
        });
        true
    }

    /// Record a negotiation failure and hand the error back
    async fn fail(&self, peer_id: &PeerId, epoch: u64, error: ConnectionError) -> ConnectionError {
        warn!(peer_id = %peer_id, error = %error, "Negotiation failed");
        self.transition(peer_id, epoch, ConnectionState::Failed).await;
        error
    }

    async fn finish_close(&self, peer_id: &PeerId, mut slot: PeerSlot) {
        slot.cancel_tasks();
        slot.transport.close().await;

        info!(peer_id = %peer_id, from = %slot.state, "Connection closed");
        metrics::connection_transition(ConnectionState::Closed.as_str());
        self.inner.events.publish(ConnectionEvent::StateChanged {
            peer_id: peer_id.clone(),
            state: ConnectionState::Closed,
        });
    }

    fn spawn_grace(&self, peer_id: PeerId, epoch: u64) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        let grace_period = self.inner.config.grace_period;

        tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            if let Some(inner) = inner.upgrade() {
                ConnectionManager::from_inner(inner)
                    .expire_grace(&peer_id, epoch)
                    .await;
            }
        })
    }

    async fn expire_grace(&self, peer_id: &PeerId, epoch: u64) {
        let slot = {
            let mut slots = self.inner.slots.lock().await;
            let still_degraded = match slots.get_mut(peer_id).filter(|s| s.epoch == epoch) {
                Some(slot) => {
                    // This task is finishing; dropping the handle must not abort it
                    slot.grace = None;
                    slot.state.is_degraded()
                }
                None => false,
            };
            if still_degraded {
                slots.remove(peer_id)
            } else {
                None
            }
        };

        if let Some(slot) = slot {
            warn!(peer_id = %peer_id, state = %slot.state, "Grace period expired");
            self.finish_close(peer_id, slot).await;
        }
    }

    fn spawn_health(&self, peer_id: PeerId, epoch: u64) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        let interval = self.inner.config.health_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else { break };
                if !ConnectionManager::from_inner(inner)
                    .sample_latency(&peer_id, epoch)
                    .await
                {
                    break;
                }
            }
        })
    }

    /// Returns false once the connection is no longer open
    async fn sample_latency(&self, peer_id: &PeerId, epoch: u64) -> bool {
        let Ok(transport) = self.transport_for(peer_id, epoch).await else {
            return false;
        };
        let rtt = transport.round_trip_time().await;

        let mut slots = self.inner.slots.lock().await;
        let Some(slot) = slots.get_mut(peer_id).filter(|s| s.epoch == epoch) else {
            return false;
        };
        if let Some(rtt) = rtt {
            trace!(peer_id = %peer_id, rtt_ms = rtt.as_millis() as u64, "Latency sample");
            slot.latency = Some(rtt);
            metrics::connection_rtt(rtt.as_secs_f64() * 1000.0);
        }
        slot.state.is_open()
    }

    async fn handle_transport_event(&self, peer_id: &PeerId, epoch: u64, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let mut slots = self.inner.slots.lock().await;
                let Some(slot) = slots.get_mut(peer_id).filter(|s| s.epoch == epoch) else {
                    return;
                };
                if slot.local_description_sent {
                    self.inner.events.publish(ConnectionEvent::Negotiation {
                        peer_id: peer_id.clone(),
                        negotiation: Negotiation::Candidate(candidate),
                    });
                } else {
                    slot.pending_local_candidates.push(candidate);
                }
            }
            TransportEvent::StateChanged(state) => match state {
                TransportState::Connecting | TransportState::Connected => {
                    trace!(peer_id = %peer_id, ?state, "Transport state");
                }
                TransportState::Disconnected | TransportState::Closed => {
                    self.transition(peer_id, epoch, ConnectionState::Disconnected).await;
                }
                TransportState::Failed => {
                    self.transition(peer_id, epoch, ConnectionState::Failed).await;
                }
            },
            TransportEvent::ChannelOpen => {
                self.transition(peer_id, epoch, ConnectionState::Connected).await;
            }
            TransportEvent::ChannelClosed => {
                self.transition(peer_id, epoch, ConnectionState::Disconnected).await;
            }
            TransportEvent::Data(payload) => {
                {
                    let mut slots = self.inner.slots.lock().await;
                    match slots.get_mut(peer_id).filter(|s| s.epoch == epoch) {
                        Some(slot) => slot.last_activity = Timestamp::now(),
                        None => return,
                    }
                }
                self.inner.events.publish(ConnectionEvent::Message {
                    peer_id: peer_id.clone(),
                    payload,
                });
            }
        }
    }

    async fn snapshot(&self, peer_id: &PeerId) -> Option<(ConnectionState, bool)> {
        self.inner
            .slots
            .lock()
            .await
            .get(peer_id)
            .map(|s| (s.state, s.initiator))
    }

    async fn epoch_of(&self, peer_id: &PeerId) -> ConnectionResult<u64> {
        self.inner
            .slots
            .lock()
            .await
            .get(peer_id)
            .map(|s| s.epoch)
            .ok_or_else(|| ConnectionError::UnknownPeer(peer_id.clone()))
    }

    async fn transport_for(
        &self,
        peer_id: &PeerId,
        epoch: u64,
    ) -> ConnectionResult<Arc<dyn DirectTransport>> {
        self.inner
            .slots
            .lock()
            .await
            .get(peer_id)
            .filter(|s| s.epoch == epoch)
            .map(|s| s.transport.clone())
            .ok_or_else(|| ConnectionError::UnknownPeer(peer_id.clone()))
    }
}

/// Events on one transport are handled strictly in arrival order
async fn pump_events(
    inner: Weak<Inner>,
    peer_id: PeerId,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        ConnectionManager::from_inner(inner)
            .handle_transport_event(&peer_id, epoch, event)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_connection::memory::MemoryHub;

    struct Side {
        id: PeerId,
        manager: ConnectionManager,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    }

    fn side(hub: &MemoryHub, id: &str) -> Side {
        let manager = ConnectionManager::new(Arc::new(hub.clone()), ConnectionConfig::default());
        manager.set_local_peer(PeerId::from(id));
        let (_, events) = manager.subscribe();
        Side {
            id: PeerId::from(id),
            manager,
            events,
        }
    }

    async fn forward(to: &ConnectionManager, from: &PeerId, negotiation: Negotiation) {
        match negotiation {
            Negotiation::Description(d) => to.apply_remote_description(from, d).await.unwrap(),
            Negotiation::Candidate(c) => to.apply_remote_candidate(from, c).await.unwrap(),
        }
    }

    /// Relay negotiation between two sides until both report Connected
    async fn relay_until_connected(a: &mut Side, b: &mut Side) {
        for _ in 0..100 {
            if a.manager.state(&b.id).await == Some(ConnectionState::Connected)
                && b.manager.state(&a.id).await == Some(ConnectionState::Connected)
            {
                return;
            }
            tokio::select! {
                Some(event) = a.events.recv() => {
                    if let ConnectionEvent::Negotiation { negotiation, .. } = event {
                        forward(&b.manager, &a.id, negotiation).await;
                    }
                }
                Some(event) = b.events.recv() => {
                    if let ConnectionEvent::Negotiation { negotiation, .. } = event {
                        forward(&a.manager, &b.id, negotiation).await;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
        panic!("sides never connected");
    }

    async fn connected_pair() -> (MemoryHub, Side, Side) {
        let hub = MemoryHub::new();
        let mut a = side(&hub, "a");
        let mut b = side(&hub, "b");
        a.manager.open(&b.id, true).await.unwrap();
        relay_until_connected(&mut a, &mut b).await;
        (hub, a, b)
    }

    async fn wait_for_state(side: &mut Side, peer: &PeerId, wanted: ConnectionState) {
        loop {
            match side.events.recv().await {
                Some(ConnectionEvent::StateChanged { peer_id, state }) if &peer_id == peer && state == wanted => {
                    return
                }
                Some(_) => {}
                None => panic!("event stream ended"),
            }
        }
    }

    #[tokio::test]
    async fn test_negotiation_and_messaging() {
        let (_hub, a, mut b) = connected_pair().await;

        assert!(a.manager.send(&b.id, b"ping").await);
        loop {
            match b.events.recv().await.unwrap() {
                ConnectionEvent::Message { peer_id, payload } => {
                    assert_eq!(peer_id, a.id);
                    assert_eq!(payload, b"ping");
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(a.manager.connected_peers().await, vec![b.id.clone()]);
        let info = b.manager.info(&a.id).await.unwrap();
        assert!(!info.initiator);
    }

    #[tokio::test]
    async fn test_initiator_emits_offer_before_candidates() {
        let hub = MemoryHub::new();
        let mut a = side(&hub, "a");
        a.manager.open(&PeerId::from("b"), true).await.unwrap();

        let mut negotiation = Vec::new();
        while negotiation.len() < 2 {
            if let ConnectionEvent::Negotiation { negotiation: n, .. } = a.events.recv().await.unwrap() {
                negotiation.push(n);
            }
        }
        assert!(matches!(
            &negotiation[0],
            Negotiation::Description(SessionDescription { kind: SdpKind::Offer, .. })
        ));
        assert!(matches!(negotiation[1], Negotiation::Candidate(_)));
        assert_eq!(
            a.manager.state(&PeerId::from("b")).await,
            Some(ConnectionState::Offering)
        );
    }

    #[tokio::test]
    async fn test_open_is_idempotent_and_requires_local_peer() {
        let hub = MemoryHub::new();
        let unnamed = ConnectionManager::new(Arc::new(hub.clone()), ConnectionConfig::default());
        assert!(matches!(
            unnamed.open(&PeerId::from("b"), true).await,
            Err(ConnectionError::NoLocalPeer)
        ));

        let a = side(&hub, "a");
        a.manager.open(&PeerId::from("b"), false).await.unwrap();
        a.manager.open(&PeerId::from("b"), true).await.unwrap();
        let info = a.manager.info(&PeerId::from("b")).await.unwrap();
        assert_eq!(info.state, ConnectionState::Init);
        assert!(!info.initiator);
    }

    #[tokio::test]
    async fn test_candidates_buffer_until_remote_description() {
        let hub = MemoryHub::new();
        let a = side(&hub, "a");
        let b = side(&hub, "b");

        b.manager.open(&a.id, false).await.unwrap();
        let candidate = IceCandidate {
            candidate: "candidate:early".to_string(),
            sdp_mid: None,
            sdp_m_line_index: None,
        };
        b.manager.apply_remote_candidate(&a.id, candidate).await.unwrap();
        assert_eq!(hub.candidates_applied(&b.id, &a.id), 0);

        let offer = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "remote".to_string(),
        };
        b.manager.apply_remote_description(&a.id, offer).await.unwrap();
        assert_eq!(hub.candidates_applied(&b.id, &a.id), 1);
        assert_eq!(b.manager.state(&a.id).await, Some(ConnectionState::Answering));
    }

    #[tokio::test]
    async fn test_send_without_open_channel_returns_false() {
        let hub = MemoryHub::new();
        let a = side(&hub, "a");

        assert!(!a.manager.send(&PeerId::from("nobody"), b"x").await);
        a.manager.open(&PeerId::from("b"), true).await.unwrap();
        assert!(!a.manager.send(&PeerId::from("b"), b"x").await);
    }

    #[tokio::test]
    async fn test_close_clears_state() {
        let (_hub, mut a, b) = connected_pair().await;

        a.manager.close(&b.id).await;
        wait_for_state(&mut a, &b.id, ConnectionState::Closed).await;
        assert!(a.manager.state(&b.id).await.is_none());
        assert!(!a.manager.send(&b.id, b"late").await);

        // Repeated close is a no-op
        a.manager.close(&b.id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_closes_unrecovered_connection() {
        let (hub, mut a, b) = connected_pair().await;

        hub.sever(&a.id, &b.id);
        wait_for_state(&mut a, &b.id, ConnectionState::Disconnected).await;

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(a.manager.state(&b.id).await, Some(ConnectionState::Disconnected));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(a.manager.state(&b.id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_cancels_grace_period() {
        let (hub, mut a, b) = connected_pair().await;

        hub.sever(&a.id, &b.id);
        wait_for_state(&mut a, &b.id, ConnectionState::Disconnected).await;
        hub.restore(&a.id, &b.id);
        wait_for_state(&mut a, &b.id, ConnectionState::Connected).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(a.manager.state(&b.id).await, Some(ConnectionState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_polling_records_latency() {
        let (_hub, a, b) = connected_pair().await;
        assert!(a.manager.info(&b.id).await.unwrap().latency.is_none());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(
            a.manager.info(&b.id).await.unwrap().latency,
            Some(Duration::from_millis(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_polling_stops_at_close() {
        let (hub, mut a, b) = connected_pair().await;

        tokio::time::sleep(Duration::from_secs(11)).await;
        let sampled = hub.rtt_samples(&a.id, &b.id);
        assert!(sampled >= 2);

        a.manager.close(&b.id).await;
        wait_for_state(&mut a, &b.id, ConnectionState::Closed).await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(hub.rtt_samples(&a.id, &b.id), sampled);
    }

    #[tokio::test]
    async fn test_transport_receives_configured_ice_servers() {
        let hub = MemoryHub::new();
        let config = ConnectionConfig {
            ice_servers: vec!["stun:stun.example.org:3478".to_string()],
            ..ConnectionConfig::default()
        };
        let manager = ConnectionManager::new(Arc::new(hub.clone()), config);
        manager.set_local_peer(PeerId::from("a"));
        manager.open(&PeerId::from("b"), true).await.unwrap();

        assert_eq!(
            hub.ice_servers(&PeerId::from("a"), &PeerId::from("b")),
            vec!["stun:stun.example.org:3478".to_string()]
        );
    }

    #[tokio::test]
    async fn test_offer_collision_lower_id_keeps_offer() {
        let hub = MemoryHub::new();
        let a = side(&hub, "a");
        a.manager.open(&PeerId::from("b"), true).await.unwrap();

        let remote_offer = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "from b".to_string(),
        };
        a.manager
            .apply_remote_description(&PeerId::from("b"), remote_offer)
            .await
            .unwrap();

        let info = a.manager.info(&PeerId::from("b")).await.unwrap();
        assert!(info.initiator);
        assert_eq!(info.state, ConnectionState::Offering);
    }
}
