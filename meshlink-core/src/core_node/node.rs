/*
    MeshNode - client side of the mesh

    Wires the signaling link, the connection manager, the sync engine and
    the local store, and drives them from one event loop:

    - link up: register (with every room currently joined)
    - registered: adopt the assigned id; the sync engine is created once,
      on the first registration, and kept across re-registrations
    - peer lists: the newcomer opens as initiator to each listed peer,
      existing members wait for its offer
    - relayed signals feed the connection manager; its negotiation output
      goes back out as webrtc_signal
    - a connection reaching Connected triggers a catch-up sync request
    - peer frames feed the engine; delivered messages are stored and
      published
    - gossip and retention sweeps run on their own intervals

    Messages are broadcast to every connected peer regardless of `to`, so
    later messages never wait on a dependency the peer was not sent.
*/

use super::errors::{NodeError, NodeResult};
use crate::config::{Config, LinkConfig, SyncConfig};
use crate::core_connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, IceCandidate, LinkEvent, Negotiation,
    SdpKind, SessionDescription, SignalingConnector, SignalingLink, TransportFactory,
};
use crate::core_signaling::protocol::CreateRoomRequest;
use crate::core_signaling::{
    ClientMessage, PeerDescriptor, PeerInfo, RoomInfo, RoomRef, ServerMessage, Signal, SignalKind,
};
use crate::core_store::{spawn_flusher, LocalStore, MessageRecord, PeerRecord, RoomRecord};
use crate::core_sync::{
    DeliveryStatus, MessageId, MessageKind, PeerFrame, ReceiveOutcome, SyncEngine, SyncError,
    SyncEvent, SyncMessage,
};
use crate::events::{EventBus, SubscriptionId};
use crate::health::{checks, ComponentHealth};
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};
use crate::types::{PeerId, RoomId, Timestamp};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Queued writes beyond this mark the store unhealthy
const MAX_QUEUE_DEPTH: usize = 10_000;

/// What a node reports to its application
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Registered(PeerId),
    SignalingDisconnected,
    PeersDiscovered {
        room_id: Option<RoomId>,
        peers: Vec<PeerInfo>,
    },
    PeerJoined {
        room_id: RoomId,
        peer: PeerInfo,
    },
    PeerLeft {
        room_id: RoomId,
        peer_id: PeerId,
    },
    RoomCreated(RoomInfo),
    Connection {
        peer_id: PeerId,
        state: ConnectionState,
    },
    /// A remote message delivered in causal order
    Message(SyncMessage),
    Conflict {
        room: RoomId,
        messages: Vec<MessageId>,
    },
    Undeliverable(SyncMessage),
    /// Error reply from the signaling server
    ServerError(String),
}

struct EngineSlot {
    engine: SyncEngine,
    events: mpsc::UnboundedReceiver<SyncEvent>,
}

struct NodeInner {
    descriptor: PeerDescriptor,
    sync_config: SyncConfig,
    link_config: LinkConfig,
    flush_interval: std::time::Duration,
    link: SignalingLink,
    connections: ConnectionManager,
    store: Arc<LocalStore>,
    engine: Mutex<Option<EngineSlot>>,
    local_peer: RwLock<Option<PeerId>>,
    rooms: Mutex<BTreeSet<RoomId>>,
    /// Rooms each remote peer is known to share with this node
    peer_rooms: Mutex<HashMap<PeerId, BTreeSet<RoomId>>>,
    events: EventBus<NodeEvent>,
}

#[derive(Clone)]
pub struct MeshNode {
    inner: Arc<NodeInner>,
}

impl MeshNode {
    pub fn new(
        config: &Config,
        descriptor: PeerDescriptor,
        factory: Arc<dyn TransportFactory>,
        store: Arc<LocalStore>,
    ) -> Self {
        let rooms = descriptor.rooms.iter().cloned().collect();
        MeshNode {
            inner: Arc::new(NodeInner {
                descriptor,
                sync_config: config.sync.clone(),
                link_config: config.link.clone(),
                flush_interval: config.store.flush_interval,
                link: SignalingLink::new(),
                connections: ConnectionManager::new(factory, config.connection.clone()),
                store,
                engine: Mutex::new(None),
                local_peer: RwLock::new(None),
                rooms: Mutex::new(rooms),
                peer_rooms: Mutex::new(HashMap::new()),
                events: EventBus::new(),
            }),
        }
    }

    /// Spawn the signaling link, the store flusher and the event loop.
    /// All three stop on the coordinator's shutdown signal.
    pub fn start(&self, connector: Arc<dyn SignalingConnector>, shutdown: &ShutdownCoordinator) {
        let (_, link_events) = self.inner.link.subscribe();
        let (_, connection_events) = self.inner.connections.subscribe();

        let event_loop = tokio::spawn(self.clone().run(
            link_events,
            connection_events,
            shutdown.subscribe(),
        ));
        let link = self
            .inner
            .link
            .start(connector, &self.inner.link_config, shutdown.subscribe());
        let flusher = spawn_flusher(
            self.inner.store.clone(),
            self.inner.flush_interval,
            shutdown.subscribe(),
        );

        shutdown.register_task("node_loop", event_loop);
        shutdown.register_task("signaling_link", link);
        shutdown.register_task("store_flusher", flusher);
        info!(nickname = %self.inner.descriptor.nickname, "Mesh node started");
    }

    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<NodeEvent>) {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Id assigned by the signaling server, once registered
    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.inner
            .local_peer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_signaling_connected(&self) -> bool {
        self.inner.link.is_connected()
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.inner.store
    }

    pub async fn send_message(
        &self,
        room: &RoomId,
        content: impl Into<String>,
    ) -> NodeResult<SyncMessage> {
        self.send_message_with(room, content, MessageKind::Text, None).await
    }

    /// Author a message, persist it and broadcast it to connected peers
    pub async fn send_message_with(
        &self,
        room: &RoomId,
        content: impl Into<String>,
        kind: MessageKind,
        to: Option<PeerId>,
    ) -> NodeResult<SyncMessage> {
        let content = content.into();
        let message = self
            .with_engine(|engine| {
                engine.create_message_at(content, room.clone(), kind, to, Timestamp::now())
            })
            .ok_or(NodeError::NotRegistered)?;

        self.inner
            .store
            .save_message(message.clone(), DeliveryStatus::Pending)?;

        let sent = self.broadcast(&PeerFrame::Message(message.clone())).await;
        if sent > 0 {
            self.inner.store.update_status(&message.id, DeliveryStatus::Sent)?;
        }
        debug!(id = %message.id, room = %room, peers = sent, "Message sent");
        Ok(message)
    }

    pub fn join_room(&self, room_id: &RoomId) -> NodeResult<()> {
        self.lock_rooms().insert(room_id.clone());
        self.send_signaling(ClientMessage::JoinRoom(RoomRef {
            room_id: room_id.clone(),
        }))
    }

    /// Connections to peers that shared only this room are closed
    pub async fn leave_room(&self, room_id: &RoomId) -> NodeResult<()> {
        self.lock_rooms().remove(room_id);
        let sent = self.send_signaling(ClientMessage::LeaveRoom(RoomRef {
            room_id: room_id.clone(),
        }));

        for peer_id in self.forget_shared_room(room_id) {
            debug!(peer_id = %peer_id, room_id = %room_id, "No rooms left in common, closing");
            self.inner.connections.close(&peer_id).await;
        }
        sent
    }

    /// The reply arrives as [`NodeEvent::RoomCreated`]
    pub fn create_room(&self, name: impl Into<String>, is_private: bool) -> NodeResult<()> {
        self.send_signaling(ClientMessage::CreateRoom(CreateRoomRequest {
            name: name.into(),
            is_private,
        }))
    }

    /// The reply arrives as [`NodeEvent::PeersDiscovered`]
    pub fn discover(&self, room_id: &RoomId) -> NodeResult<()> {
        self.send_signaling(ClientMessage::PeerDiscover(RoomRef {
            room_id: room_id.clone(),
        }))
    }

    pub fn joined_rooms(&self) -> Vec<RoomId> {
        self.lock_rooms().iter().cloned().collect()
    }

    /// Rooms currently shared with `peer_id`
    pub fn shared_rooms(&self, peer_id: &PeerId) -> Vec<RoomId> {
        self.lock_peer_rooms()
            .get(peer_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Causally ordered room history held by the engine
    pub fn timeline(&self, room: &RoomId) -> Vec<SyncMessage> {
        self.with_engine(|engine| engine.room_timeline(room))
            .unwrap_or_default()
    }

    /// Component checks for the signaling link and the store write path
    pub fn health(&self) -> Vec<ComponentHealth> {
        let store = &self.inner.store;
        vec![
            checks::check_link(self.is_signaling_connected()),
            checks::check_store(store.queue_depth(), store.failed_flushes(), MAX_QUEUE_DEPTH),
        ]
    }

    /// Persisted room history with delivery status
    pub fn history(&self, room: &RoomId, limit: usize) -> NodeResult<Vec<MessageRecord>> {
        Ok(self.inner.store.messages(room, limit)?)
    }

    async fn run(
        self,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut shutdown: broadcast::Receiver<ShutdownSignal>,
    ) {
        let gossip_every = self.inner.sync_config.gossip_interval;
        let sweep_every = self.inner.sync_config.maintenance_interval;
        let mut gossip = interval_at(Instant::now() + gossip_every, gossip_every);
        let mut sweep = interval_at(Instant::now() + sweep_every, sweep_every);
        gossip.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(event) = link_events.recv() => self.handle_link_event(event).await,
                Some(event) = connection_events.recv() => self.handle_connection_event(event).await,
                _ = gossip.tick() => self.gossip_round().await,
                _ = sweep.tick() => self.maintenance(),
                _ = shutdown.recv() => break,
            }
        }

        self.inner.connections.close_all().await;
        info!("Mesh node stopped");
    }

    async fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                let descriptor = PeerDescriptor {
                    rooms: self.joined_rooms(),
                    ..self.inner.descriptor.clone()
                };
                self.inner.link.send(&ClientMessage::PeerRegister(descriptor));
            }
            LinkEvent::Disconnected => self.inner.events.publish(NodeEvent::SignalingDisconnected),
            LinkEvent::Message(message) => self.handle_server_message(message).await,
        }
    }

    async fn handle_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Registered(registered) => {
                let peer_id = registered.peer_id;
                *self.inner.local_peer.write().unwrap_or_else(|e| e.into_inner()) =
                    Some(peer_id.clone());
                self.inner.connections.set_local_peer(peer_id.clone());

                {
                    let mut slot = self.lock_engine();
                    if slot.is_none() {
                        let engine = SyncEngine::new(peer_id.clone(), self.inner.sync_config.clone());
                        let (_, events) = engine.subscribe();
                        *slot = Some(EngineSlot { engine, events });
                    }
                }

                // The peer list that follows rebuilds the shared rooms
                self.lock_peer_rooms().clear();

                info!(peer_id = %peer_id, rooms = registered.rooms.len(), "Registered with signaling server");
                self.inner.events.publish(NodeEvent::Registered(peer_id));
            }
            ServerMessage::PeerList(list) => {
                let local = self.local_peer_id();
                for peer in &list.peers {
                    self.remember_peer(peer);
                    if Some(&peer.peer_id) == local.as_ref() {
                        continue;
                    }
                    for room_id in list.rooms_of(&peer.peer_id) {
                        self.share_room(&peer.peer_id, room_id);
                    }
                    if self.inner.connections.state(&peer.peer_id).await.is_none() {
                        if let Err(e) = self.inner.connections.open(&peer.peer_id, true).await {
                            warn!(peer_id = %peer.peer_id, error = %e, "Failed to open connection");
                        }
                    }
                }
                self.inner.events.publish(NodeEvent::PeersDiscovered {
                    room_id: list.room_id,
                    peers: list.peers,
                });
            }
            ServerMessage::PeerJoined(joined) => {
                self.remember_peer(&joined.peer);
                self.share_room(&joined.peer.peer_id, joined.room_id.clone());
                self.inner.events.publish(NodeEvent::PeerJoined {
                    room_id: joined.room_id,
                    peer: joined.peer,
                });
            }
            ServerMessage::PeerLeft(left) => {
                if self.unshare_room(&left.peer_id, &left.room_id) {
                    self.inner.connections.close(&left.peer_id).await;
                } else {
                    debug!(peer_id = %left.peer_id, room_id = %left.room_id, "Peer left a room, other rooms still shared");
                }
                self.inner.events.publish(NodeEvent::PeerLeft {
                    room_id: left.room_id,
                    peer_id: left.peer_id,
                });
            }
            ServerMessage::RoomCreated(room) => {
                if let Err(e) = self.inner.store.save_room(RoomRecord::from(&room)) {
                    warn!(error = %e, "Failed to queue room record");
                }
                self.inner.events.publish(NodeEvent::RoomCreated(room));
            }
            ServerMessage::WebrtcSignal(signal) => self.handle_signal(signal).await,
            ServerMessage::Error(error) => {
                warn!(message = %error.message, "Signaling server error");
                self.inner.events.publish(NodeEvent::ServerError(error.message));
            }
        }
    }

    async fn handle_signal(&self, signal: Signal) {
        if self.local_peer_id().as_ref() != Some(&signal.to) {
            debug!(to = %signal.to, "Signal not addressed to this node");
            return;
        }

        let result = match signal.kind {
            SignalKind::Offer | SignalKind::Answer => {
                match serde_json::from_value::<SessionDescription>(signal.data) {
                    Ok(description) => {
                        self.inner
                            .connections
                            .apply_remote_description(&signal.from, description)
                            .await
                    }
                    Err(e) => {
                        debug!(from = %signal.from, error = %e, "Malformed session description");
                        return;
                    }
                }
            }
            SignalKind::IceCandidate => match serde_json::from_value::<IceCandidate>(signal.data) {
                Ok(candidate) => {
                    self.inner
                        .connections
                        .apply_remote_candidate(&signal.from, candidate)
                        .await
                }
                Err(e) => {
                    debug!(from = %signal.from, error = %e, "Malformed candidate");
                    return;
                }
            },
        };

        if let Err(e) = result {
            warn!(from = %signal.from, error = %e, "Failed to apply remote signal");
        }
    }

    async fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged { peer_id, state } => {
                if state == ConnectionState::Connected {
                    if let Some(clock) = self.with_engine(|engine| engine.create_sync_request()) {
                        self.send_frame(&peer_id, &PeerFrame::SyncRequest { clock }).await;
                    }
                }
                self.inner
                    .events
                    .publish(NodeEvent::Connection { peer_id, state });
            }
            ConnectionEvent::Negotiation {
                peer_id,
                negotiation,
            } => {
                let Some(local) = self.local_peer_id() else {
                    return;
                };
                match negotiation_to_signal(local, peer_id, &negotiation) {
                    Ok(signal) => {
                        self.inner.link.send(&ClientMessage::WebrtcSignal(signal));
                    }
                    Err(e) => warn!(error = %e, "Failed to encode negotiation"),
                }
            }
            ConnectionEvent::Message { peer_id, payload } => match PeerFrame::decode(&payload) {
                Ok(frame) => self.handle_frame(&peer_id, frame).await,
                Err(e) => debug!(peer_id = %peer_id, error = %e, "Ignoring malformed peer frame"),
            },
        }
    }

    async fn handle_frame(&self, peer_id: &PeerId, frame: PeerFrame) {
        match frame {
            PeerFrame::Message(message) => self.receive(vec![message]),
            PeerFrame::Gossip { messages } => self.receive(messages),
            PeerFrame::SyncRequest { clock } => {
                let Some(batch) = self.with_engine(|engine| engine.handle_sync_request(&clock)) else {
                    return;
                };
                debug!(peer_id = %peer_id, count = batch.messages.len(), has_more = batch.has_more, "Answering sync request");
                let response = PeerFrame::SyncResponse {
                    messages: batch.messages,
                    has_more: batch.has_more,
                };
                self.send_frame(peer_id, &response).await;
            }
            PeerFrame::SyncResponse { messages, has_more } => {
                self.receive(messages);
                if has_more {
                    if let Some(clock) = self.with_engine(|engine| engine.create_sync_request()) {
                        self.send_frame(peer_id, &PeerFrame::SyncRequest { clock }).await;
                    }
                }
            }
        }
    }

    fn receive(&self, messages: Vec<SyncMessage>) {
        let outcomes = self.with_engine(|engine| {
            messages
                .into_iter()
                .map(|message| {
                    let id = message.id.clone();
                    (id, engine.receive_message(message))
                })
                .collect::<Vec<_>>()
        });

        for (id, outcome) in outcomes.unwrap_or_default() {
            if let ReceiveOutcome::Rejected(reason) = outcome {
                let error = SyncError::InvalidMessage {
                    id: id.to_string(),
                    reason,
                };
                warn!(error = %error, "Discarding message");
            }
        }
    }

    async fn gossip_round(&self) {
        let count = self.inner.sync_config.gossip_count;
        let Some(messages) = self.with_engine(|engine| engine.get_gossip_messages(count)) else {
            return;
        };
        if messages.is_empty() {
            return;
        }
        let peers = self.broadcast(&PeerFrame::Gossip { messages }).await;
        debug!(peers, "Gossip round");
    }

    fn maintenance(&self) {
        if let Some(report) = self.with_engine(|engine| engine.maintenance(Timestamp::now())) {
            debug!(
                pruned = report.pruned_history,
                dropped = report.dropped_pending,
                "Maintenance tick"
            );
        }
    }

    /// Send a frame to every connected peer. Returns how many accepted it.
    async fn broadcast(&self, frame: &PeerFrame) -> usize {
        let payload = match frame.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode peer frame");
                return 0;
            }
        };

        let mut sent = 0;
        for peer_id in self.inner.connections.connected_peers().await {
            if self.inner.connections.send(&peer_id, &payload).await {
                sent += 1;
            }
        }
        sent
    }

    async fn send_frame(&self, peer_id: &PeerId, frame: &PeerFrame) -> bool {
        match frame.encode() {
            Ok(payload) => self.inner.connections.send(peer_id, &payload).await,
            Err(e) => {
                warn!(error = %e, "Failed to encode peer frame");
                false
            }
        }
    }

    fn send_signaling(&self, message: ClientMessage) -> NodeResult<()> {
        if self.inner.link.send(&message) {
            Ok(())
        } else {
            Err(NodeError::SignalingUnavailable)
        }
    }

    fn remember_peer(&self, peer: &PeerInfo) {
        if let Err(e) = self.inner.store.save_peer(PeerRecord::from(peer)) {
            warn!(peer_id = %peer.peer_id, error = %e, "Failed to queue peer record");
        }
    }

    /// Run `f` against the engine, then persist and publish whatever the
    /// engine emitted. None before the first registration.
    fn with_engine<R>(&self, f: impl FnOnce(&mut SyncEngine) -> R) -> Option<R> {
        let (result, emitted) = {
            let mut slot = self.lock_engine();
            let slot = slot.as_mut()?;
            let result = f(&mut slot.engine);
            let mut emitted = Vec::new();
            while let Ok(event) = slot.events.try_recv() {
                emitted.push(event);
            }
            (result, emitted)
        };

        for event in emitted {
            self.dispatch_sync_event(event);
        }
        Some(result)
    }

    fn dispatch_sync_event(&self, event: SyncEvent) {
        match event {
            SyncEvent::Delivered(message) => {
                if let Err(e) = self
                    .inner
                    .store
                    .save_message(message.clone(), DeliveryStatus::Delivered)
                {
                    warn!(id = %message.id, error = %e, "Failed to store delivered message");
                }
                self.inner.events.publish(NodeEvent::Message(message));
            }
            SyncEvent::Conflict { room, messages } => {
                self.inner
                    .events
                    .publish(NodeEvent::Conflict { room, messages });
            }
            SyncEvent::Undeliverable(message) => {
                if let Err(e) = self
                    .inner
                    .store
                    .save_message(message.clone(), DeliveryStatus::Failed)
                {
                    warn!(id = %message.id, error = %e, "Failed to store undeliverable message");
                }
                self.inner.events.publish(NodeEvent::Undeliverable(message));
            }
        }
    }

    fn lock_engine(&self) -> MutexGuard<'_, Option<EngineSlot>> {
        self.inner.engine.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_rooms(&self) -> MutexGuard<'_, BTreeSet<RoomId>> {
        self.inner.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_peer_rooms(&self) -> MutexGuard<'_, HashMap<PeerId, BTreeSet<RoomId>>> {
        self.inner.peer_rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn share_room(&self, peer_id: &PeerId, room_id: RoomId) {
        self.lock_peer_rooms()
            .entry(peer_id.clone())
            .or_default()
            .insert(room_id);
    }

    /// Drop one shared room. True when nothing is shared with the peer any more.
    fn unshare_room(&self, peer_id: &PeerId, room_id: &RoomId) -> bool {
        let mut peer_rooms = self.lock_peer_rooms();
        let Some(rooms) = peer_rooms.get_mut(peer_id) else {
            return true;
        };
        rooms.remove(room_id);
        if rooms.is_empty() {
            peer_rooms.remove(peer_id);
            true
        } else {
            false
        }
    }

    /// Drop a room this node left; returns peers no longer sharing any room
    fn forget_shared_room(&self, room_id: &RoomId) -> Vec<PeerId> {
        let mut peer_rooms = self.lock_peer_rooms();
        let mut orphaned = Vec::new();
        peer_rooms.retain(|peer_id, rooms| {
            rooms.remove(room_id);
            if rooms.is_empty() {
                orphaned.push(peer_id.clone());
                false
            } else {
                true
            }
        });
        orphaned
    }

}

/// Wrap a local description or candidate as a relayable signal
pub fn negotiation_to_signal(
    from: PeerId,
    to: PeerId,
    negotiation: &Negotiation,
) -> Result<Signal, serde_json::Error> {
    let (kind, data) = match negotiation {
        Negotiation::Description(description) => {
            let kind = match description.kind {
                SdpKind::Offer => SignalKind::Offer,
                SdpKind::Answer => SignalKind::Answer,
            };
            (kind, serde_json::to_value(description)?)
        }
        Negotiation::Candidate(candidate) => {
            (SignalKind::IceCandidate, serde_json::to_value(candidate)?)
        }
    };

    Ok(Signal {
        from,
        to,
        kind,
        data,
        timestamp: Timestamp::now(),
    })
}
