/*
    SignalingService - single actor owning the registry

    Every network arrival and timer expiry becomes a ServiceCommand processed
    to completion before the next one, so the registry, transport bindings
    and liveness timers are only touched from this task.

    Liveness:
    - registration and each heartbeat replace the peer's timer wholesale
    - a timer fires after 2x the heartbeat interval and reports its generation
    - an expiry whose generation is stale (a newer timer exists) is ignored
    - a current expiry evicts the peer and notifies its rooms

    Outbound frames are serialized here and pushed as text to the connection's
    writer, so the WebSocket server and in-process clients see the same bytes.
*/

use super::errors::{SignalingError, SignalingResult};
use super::protocol::{
    ClientMessage, PeerJoined, PeerLeft, PeerList, Registered, RoomRef, ServerMessage,
};
use super::rate_limiter::RateLimiter;
use super::registry::{Departure, PeerRegistry, RegistryStats};
use super::types::{PeerDescriptor, Signal};
use crate::config::SignalingConfig;
use crate::metrics::{self, RemovalReason};
use crate::types::{ConnId, PeerId, RoomId, Timestamp};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 1024;

enum ServiceCommand {
    Attach {
        conn_id: ConnId,
        outbound: mpsc::UnboundedSender<String>,
    },
    Inbound {
        conn_id: ConnId,
        text: String,
    },
    Detach {
        conn_id: ConnId,
    },
    LivenessExpired {
        peer_id: PeerId,
        generation: u64,
    },
    Stats {
        reply: oneshot::Sender<RegistryStats>,
    },
    Shutdown,
}

/// Cloneable entry point to a running [`SignalingService`]
#[derive(Clone)]
pub struct SignalingHandle {
    command_tx: mpsc::Sender<ServiceCommand>,
    next_conn_id: Arc<AtomicU64>,
}

impl SignalingHandle {
    /// Bind a new connection. Frames for it arrive on the returned receiver.
    pub async fn attach(&self) -> SignalingResult<(ConnId, mpsc::UnboundedReceiver<String>)> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (outbound, rx) = mpsc::unbounded_channel();
        self.send(ServiceCommand::Attach { conn_id, outbound }).await?;
        Ok((conn_id, rx))
    }

    /// Hand a received text frame to the service
    pub async fn inbound(&self, conn_id: ConnId, text: impl Into<String>) -> SignalingResult<()> {
        self.send(ServiceCommand::Inbound {
            conn_id,
            text: text.into(),
        })
        .await
    }

    /// The connection closed; unregisters its peer if any
    pub async fn detach(&self, conn_id: ConnId) {
        if self.send(ServiceCommand::Detach { conn_id }).await.is_err() {
            debug!(conn_id, "Service already stopped on detach");
        }
    }

    pub async fn stats(&self) -> SignalingResult<RegistryStats> {
        let (reply, rx) = oneshot::channel();
        self.send(ServiceCommand::Stats { reply }).await?;
        rx.await.map_err(|_| SignalingError::ServiceStopped)
    }

    pub async fn shutdown(&self) {
        let _ = self.send(ServiceCommand::Shutdown).await;
    }

    async fn send(&self, command: ServiceCommand) -> SignalingResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SignalingError::ServiceStopped)
    }
}

struct LivenessTimer {
    generation: u64,
    task: JoinHandle<()>,
}

pub struct SignalingService {
    registry: PeerRegistry,
    outbound: HashMap<ConnId, mpsc::UnboundedSender<String>>,
    timers: HashMap<PeerId, LivenessTimer>,
    next_generation: u64,
    limiter: RateLimiter,
    liveness_timeout: Duration,
    commands: mpsc::Receiver<ServiceCommand>,
    self_tx: mpsc::WeakSender<ServiceCommand>,
}

impl SignalingService {
    /// Spawn the actor over an owned registry
    pub fn spawn(registry: PeerRegistry, config: &SignalingConfig) -> (SignalingHandle, JoinHandle<()>) {
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);

        let service = SignalingService {
            registry,
            outbound: HashMap::new(),
            timers: HashMap::new(),
            next_generation: 0,
            limiter: RateLimiter::new(config.rate_limit_window, config.rate_limit_max),
            liveness_timeout: config.heartbeat_interval * 2,
            commands,
            self_tx: command_tx.downgrade(),
        };

        let handle = SignalingHandle {
            command_tx,
            next_conn_id: Arc::new(AtomicU64::new(1)),
        };
        (handle, tokio::spawn(service.run()))
    }

    async fn run(mut self) {
        info!(
            liveness_timeout_ms = self.liveness_timeout.as_millis() as u64,
            "Signaling service started"
        );

        while let Some(command) = self.commands.recv().await {
            match command {
                ServiceCommand::Attach { conn_id, outbound } => {
                    debug!(conn_id, "Connection attached");
                    self.outbound.insert(conn_id, outbound);
                }
                ServiceCommand::Inbound { conn_id, text } => self.handle_inbound(conn_id, &text),
                ServiceCommand::Detach { conn_id } => self.handle_detach(conn_id),
                ServiceCommand::LivenessExpired {
                    peer_id,
                    generation,
                } => self.handle_expiry(peer_id, generation),
                ServiceCommand::Stats { reply } => {
                    let _ = reply.send(self.registry.stats());
                }
                ServiceCommand::Shutdown => break,
            }
        }

        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
        info!("Signaling service stopped");
    }

    fn handle_inbound(&mut self, conn_id: ConnId, text: &str) {
        if !self.limiter.check(conn_id, tokio::time::Instant::now()) {
            metrics::signaling_rate_limited();
            self.send_to_conn(conn_id, &ServerMessage::error(SignalingError::RateLimited.to_string()));
            return;
        }

        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(conn_id, error = %e, "Dropping malformed frame");
                return;
            }
        };

        match message {
            ClientMessage::PeerRegister(descriptor) => self.handle_register(conn_id, descriptor),
            ClientMessage::PeerDiscover(RoomRef { room_id }) => self.handle_discover(conn_id, room_id),
            ClientMessage::WebrtcSignal(signal) => self.handle_signal(conn_id, signal),
            ClientMessage::PeerHeartbeat => self.handle_heartbeat(conn_id),
            ClientMessage::JoinRoom(RoomRef { room_id }) => self.handle_join(conn_id, room_id),
            ClientMessage::LeaveRoom(RoomRef { room_id }) => self.handle_leave(conn_id, room_id),
            ClientMessage::CreateRoom(request) => {
                if self.registry.peer_for_conn(conn_id).is_none() {
                    debug!(conn_id, "{}", SignalingError::NotRegistered(conn_id));
                    return;
                }
                let room = self
                    .registry
                    .create_room(request.name, request.is_private, Timestamp::now());
                info!(room_id = %room.room_id, name = %room.name, "Room created");
                self.send_to_conn(conn_id, &ServerMessage::RoomCreated(room));
                self.publish_size();
            }
        }
    }

    fn handle_register(&mut self, conn_id: ConnId, descriptor: PeerDescriptor) {
        let registration = self.registry.register(descriptor, conn_id, Timestamp::now());

        if let Some(replaced) = registration.replaced {
            info!(peer_id = %replaced.peer_id, conn_id, "Replacing registration on connection");
            self.finish_departure(replaced, RemovalReason::Replaced);
        }

        let peer_id = registration.peer.peer_id.clone();
        info!(
            peer_id = %peer_id,
            conn_id,
            rooms = registration.joined.len(),
            "Peer registered"
        );
        metrics::peer_registered();
        self.schedule_liveness(&peer_id);

        self.send_to_conn(
            conn_id,
            &ServerMessage::Registered(Registered {
                peer_id: peer_id.clone(),
                rooms: registration.joined.iter().map(|(room, _)| room.clone()).collect(),
            }),
        );

        // One entry per distinct peer across all joined rooms
        let mut known = BTreeMap::new();
        let mut shared_rooms: BTreeMap<PeerId, Vec<RoomId>> = BTreeMap::new();
        for (room_id, others) in &registration.joined {
            for other in others {
                if let Some(peer) = self.registry.peer(other) {
                    known.entry(other.clone()).or_insert_with(|| peer.info());
                    shared_rooms.entry(other.clone()).or_default().push(room_id.clone());
                }
            }
        }
        self.send_to_conn(
            conn_id,
            &ServerMessage::PeerList(PeerList {
                room_id: None,
                peers: known.into_values().collect(),
                shared_rooms,
            }),
        );

        for room_id in &registration.rejected {
            self.send_to_conn(
                conn_id,
                &ServerMessage::error(SignalingError::RoomFull(room_id.clone()).to_string()),
            );
        }

        for (room_id, others) in registration.joined {
            let joined = ServerMessage::PeerJoined(PeerJoined {
                room_id,
                peer: registration.peer.clone(),
            });
            self.broadcast(&others, &joined);
        }
        self.publish_size();
    }

    fn handle_discover(&mut self, conn_id: ConnId, room_id: RoomId) {
        let peers = match self.registry.peer_for_conn(conn_id) {
            Some(caller) => self.registry.discover(caller, &room_id),
            None => Vec::new(),
        };
        self.send_to_conn(
            conn_id,
            &ServerMessage::PeerList(PeerList {
                room_id: Some(room_id),
                peers,
                shared_rooms: BTreeMap::new(),
            }),
        );
    }

    fn handle_signal(&mut self, conn_id: ConnId, signal: Signal) {
        let Some(sender) = self.registry.peer_for_conn(conn_id) else {
            debug!(conn_id, "{}", SignalingError::NotRegistered(conn_id));
            metrics::signal_dropped();
            return;
        };
        if *sender != signal.from {
            let e = SignalingError::SenderMismatch {
                claimed: signal.from.clone(),
                actual: sender.clone(),
            };
            debug!(conn_id, "Dropping signal: {}", e);
            metrics::signal_dropped();
            return;
        }

        match self.registry.conn_for_peer(&signal.to) {
            Some(target) if self.outbound.contains_key(&target) => {
                debug!(from = %signal.from, to = %signal.to, kind = ?signal.kind, "Relaying signal");
                self.send_to_conn(target, &ServerMessage::WebrtcSignal(signal));
                metrics::signal_relayed();
            }
            _ => {
                debug!(to = %signal.to, "Signal target offline, dropping");
                metrics::signal_dropped();
            }
        }
    }

    fn handle_heartbeat(&mut self, conn_id: ConnId) {
        let Some(peer_id) = self.registry.peer_for_conn(conn_id).cloned() else {
            debug!(conn_id, "Heartbeat from unregistered connection");
            return;
        };
        self.registry.touch(&peer_id, Timestamp::now());
        self.schedule_liveness(&peer_id);
    }

    fn handle_join(&mut self, conn_id: ConnId, room_id: RoomId) {
        let Some(peer_id) = self.registry.peer_for_conn(conn_id).cloned() else {
            debug!(conn_id, "{}", SignalingError::NotRegistered(conn_id));
            return;
        };

        match self.registry.join_room(&peer_id, &room_id, Timestamp::now()) {
            Ok(Some(others)) => {
                info!(peer_id = %peer_id, room_id = %room_id, "Peer joined room");
                let peers = self.registry.discover(&peer_id, &room_id);
                self.send_to_conn(
                    conn_id,
                    &ServerMessage::PeerList(PeerList {
                        room_id: Some(room_id.clone()),
                        peers,
                        shared_rooms: BTreeMap::new(),
                    }),
                );
                if let Some(peer) = self.registry.peer(&peer_id).map(|p| p.info()) {
                    self.broadcast(&others, &ServerMessage::PeerJoined(PeerJoined { room_id, peer }));
                }
                self.publish_size();
            }
            Ok(None) => debug!(peer_id = %peer_id, room_id = %room_id, "Already a member"),
            Err(e) => self.send_to_conn(conn_id, &ServerMessage::error(e.to_string())),
        }
    }

    fn handle_leave(&mut self, conn_id: ConnId, room_id: RoomId) {
        let Some(peer_id) = self.registry.peer_for_conn(conn_id).cloned() else {
            return;
        };
        if let Some(remaining) = self.registry.leave_room(&peer_id, &room_id) {
            info!(peer_id = %peer_id, room_id = %room_id, "Peer left room");
            self.broadcast(&remaining, &ServerMessage::PeerLeft(PeerLeft { room_id, peer_id }));
            self.publish_size();
        }
    }

    fn handle_detach(&mut self, conn_id: ConnId) {
        self.limiter.forget(conn_id);
        self.outbound.remove(&conn_id);
        if let Some(departure) = self.registry.unregister_conn(conn_id) {
            info!(peer_id = %departure.peer_id, conn_id, "Peer disconnected");
            self.finish_departure(departure, RemovalReason::Disconnect);
            self.publish_size();
        }
    }

    fn handle_expiry(&mut self, peer_id: PeerId, generation: u64) {
        match self.timers.get(&peer_id) {
            Some(timer) if timer.generation == generation => {}
            _ => {
                debug!(peer_id = %peer_id, generation, "Ignoring stale liveness expiry");
                return;
            }
        }

        if let Some(departure) = self.registry.unregister(&peer_id) {
            warn!(peer_id = %peer_id, "Peer evicted after missing heartbeats");
            self.finish_departure(departure, RemovalReason::LivenessTimeout);
            self.publish_size();
        }
    }

    /// Cancel the departed peer's timer and notify the rooms it was in
    fn finish_departure(&mut self, departure: Departure, reason: RemovalReason) {
        if let Some(timer) = self.timers.remove(&departure.peer_id) {
            timer.task.abort();
        }
        metrics::peer_removed(reason);

        for (room_id, remaining) in departure.rooms {
            let left = ServerMessage::PeerLeft(PeerLeft {
                room_id,
                peer_id: departure.peer_id.clone(),
            });
            self.broadcast(&remaining, &left);
        }
    }

    fn schedule_liveness(&mut self, peer_id: &PeerId) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let timeout = self.liveness_timeout;
        let weak_tx = self.self_tx.clone();
        let expired = peer_id.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = weak_tx.upgrade() {
                let _ = tx
                    .send(ServiceCommand::LivenessExpired {
                        peer_id: expired,
                        generation,
                    })
                    .await;
            }
        });

        if let Some(previous) = self
            .timers
            .insert(peer_id.clone(), LivenessTimer { generation, task })
        {
            previous.task.abort();
        }
    }

    fn send_to_conn(&self, conn_id: ConnId, message: &ServerMessage) {
        match message.to_text() {
            Ok(text) => self.send_text(conn_id, text),
            Err(e) => warn!(error = %e, "Failed to serialize server message"),
        }
    }

    fn send_text(&self, conn_id: ConnId, text: String) {
        if let Some(outbound) = self.outbound.get(&conn_id) {
            if outbound.send(text).is_err() {
                debug!(conn_id, "Writer gone, frame dropped");
            }
        }
    }

    fn broadcast(&self, peers: &[PeerId], message: &ServerMessage) {
        if peers.is_empty() {
            return;
        }
        let text = match message.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to serialize broadcast");
                return;
            }
        };
        for peer_id in peers {
            if let Some(conn_id) = self.registry.conn_for_peer(peer_id) {
                self.send_text(conn_id, text.clone());
            }
        }
    }

    fn publish_size(&self) {
        let stats = self.registry.stats();
        metrics::registry_size(stats.total_peers, stats.total_rooms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_signaling::types::SignalKind;

    fn config() -> SignalingConfig {
        SignalingConfig {
            heartbeat_interval: Duration::from_secs(30),
            ..SignalingConfig::default()
        }
    }

    fn spawn_service(config: &SignalingConfig) -> SignalingHandle {
        let (handle, _task) = SignalingService::spawn(PeerRegistry::new(config.max_peers_per_room), config);
        handle
    }

    fn register_frame(nickname: &str, rooms: &[&str]) -> String {
        ClientMessage::PeerRegister(PeerDescriptor {
            nickname: nickname.to_string(),
            rooms: rooms.iter().map(|r| RoomId::from(*r)).collect(),
            public_key: String::new(),
        })
        .to_text()
        .unwrap()
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> ServerMessage {
        let text = rx.recv().await.expect("frame");
        ServerMessage::parse(&text).unwrap()
    }

    async fn register(
        handle: &SignalingHandle,
        nickname: &str,
        rooms: &[&str],
    ) -> (ConnId, PeerId, mpsc::UnboundedReceiver<String>) {
        let (conn_id, mut rx) = handle.attach().await.unwrap();
        handle
            .inbound(conn_id, register_frame(nickname, rooms))
            .await
            .unwrap();
        let peer_id = match next(&mut rx).await {
            ServerMessage::Registered(r) => r.peer_id,
            other => panic!("expected registered, got {:?}", other),
        };
        match next(&mut rx).await {
            ServerMessage::PeerList(_) => {}
            other => panic!("expected peer_list, got {:?}", other),
        }
        (conn_id, peer_id, rx)
    }

    #[tokio::test]
    async fn test_register_notifies_room() {
        let handle = spawn_service(&config());
        let (_, a, mut rx_a) = register(&handle, "a", &["ops"]).await;

        let (conn_b, mut rx_b) = handle.attach().await.unwrap();
        handle.inbound(conn_b, register_frame("b", &["ops"])).await.unwrap();

        let b = match next(&mut rx_b).await {
            ServerMessage::Registered(r) => {
                assert_eq!(r.rooms, vec![RoomId::from("ops")]);
                r.peer_id
            }
            other => panic!("unexpected {:?}", other),
        };
        match next(&mut rx_b).await {
            ServerMessage::PeerList(list) => {
                assert_eq!(list.peers.len(), 1);
                assert_eq!(list.peers[0].peer_id, a);
                assert_eq!(list.rooms_of(&a), vec![RoomId::from("ops")]);
            }
            other => panic!("unexpected {:?}", other),
        }
        match next(&mut rx_a).await {
            ServerMessage::PeerJoined(joined) => assert_eq!(joined.peer.peer_id, b),
            other => panic!("unexpected {:?}", other),
        }

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.total_peers, 2);
        assert_eq!(stats.active_rooms, 1);
    }

    #[tokio::test]
    async fn test_signal_relay_and_spoofing() {
        let handle = spawn_service(&config());
        let (conn_a, a, _rx_a) = register(&handle, "a", &["ops"]).await;
        let (_, b, mut rx_b) = register(&handle, "b", &["ops"]).await;

        let spoofed = Signal {
            from: PeerId::from("mallory"),
            to: b.clone(),
            kind: SignalKind::Offer,
            data: serde_json::json!({"sdp": "x"}),
            timestamp: Timestamp::from_millis(1),
        };
        handle
            .inbound(conn_a, ClientMessage::WebrtcSignal(spoofed).to_text().unwrap())
            .await
            .unwrap();

        let genuine = Signal {
            from: a.clone(),
            to: b.clone(),
            kind: SignalKind::Offer,
            data: serde_json::json!({"sdp": "v=0"}),
            timestamp: Timestamp::from_millis(2),
        };
        handle
            .inbound(conn_a, ClientMessage::WebrtcSignal(genuine.clone()).to_text().unwrap())
            .await
            .unwrap();

        // Only the genuine signal arrives, unchanged
        assert_eq!(next(&mut rx_b).await, ServerMessage::WebrtcSignal(genuine));
    }

    #[tokio::test]
    async fn test_signal_to_offline_peer_is_dropped() {
        let handle = spawn_service(&config());
        let (conn_a, a, mut rx_a) = register(&handle, "a", &["ops"]).await;
        let (conn_b, b, _rx_b) = register(&handle, "b", &["dev"]).await;
        handle.detach(conn_b).await;

        for target in [PeerId::from("ghost"), b] {
            let signal = Signal {
                from: a.clone(),
                to: target,
                kind: SignalKind::Offer,
                data: serde_json::json!({"sdp": "v=0"}),
                timestamp: Timestamp::from_millis(1),
            };
            handle
                .inbound(conn_a, ClientMessage::WebrtcSignal(signal).to_text().unwrap())
                .await
                .unwrap();
        }

        // Nothing, not even an error, reaches the sender before the next reply
        handle
            .inbound(conn_a, r#"{"type":"peer_discover","payload":{"roomId":"ops"}}"#)
            .await
            .unwrap();
        match next(&mut rx_a).await {
            ServerMessage::PeerList(list) => assert!(list.peers.is_empty()),
            other => panic!("expected peer_list, got {:?}", other),
        }
        assert_eq!(handle.stats().await.unwrap().total_peers, 1);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_rooms() {
        let handle = spawn_service(&config());
        let (conn_a, a, _rx_a) = register(&handle, "a", &["ops"]).await;
        let (_, _b, mut rx_b) = register(&handle, "b", &["ops"]).await;

        handle.detach(conn_a).await;
        handle.detach(conn_a).await;

        assert_eq!(
            next(&mut rx_b).await,
            ServerMessage::PeerLeft(PeerLeft {
                room_id: RoomId::from("ops"),
                peer_id: a
            })
        );
        assert_eq!(handle.stats().await.unwrap().total_peers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_evicted() {
        let handle = spawn_service(&config());
        let (_, a, _rx_a) = register(&handle, "a", &["ops"]).await;
        let (conn_b, _b, mut rx_b) = register(&handle, "b", &["ops"]).await;

        // b keeps heartbeating, a stays silent
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(25)).await;
            handle
                .inbound(conn_b, ClientMessage::PeerHeartbeat.to_text().unwrap())
                .await
                .unwrap();
        }

        match next(&mut rx_b).await {
            ServerMessage::PeerLeft(left) => assert_eq!(left.peer_id, a),
            other => panic!("unexpected {:?}", other),
        }
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.total_peers, 1);
        assert_eq!(stats.active_rooms, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_replaces_timer() {
        let handle = spawn_service(&config());
        let (conn_a, _a, _rx_a) = register(&handle, "a", &[]).await;

        tokio::time::sleep(Duration::from_secs(50)).await;
        handle
            .inbound(conn_a, ClientMessage::PeerHeartbeat.to_text().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(50)).await;

        // 100s since registration but only 50s since the last heartbeat
        assert_eq!(handle.stats().await.unwrap().total_peers, 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(handle.stats().await.unwrap().total_peers, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_answers_with_error() {
        let config = SignalingConfig {
            rate_limit_max: 2,
            ..config()
        };
        let handle = spawn_service(&config);
        let (conn, mut rx) = handle.attach().await.unwrap();

        for _ in 0..3 {
            handle
                .inbound(conn, r#"{"type":"peer_discover","payload":{"roomId":"ops"}}"#)
                .await
                .unwrap();
        }

        assert!(matches!(next(&mut rx).await, ServerMessage::PeerList(_)));
        assert!(matches!(next(&mut rx).await, ServerMessage::PeerList(_)));
        match next(&mut rx).await {
            ServerMessage::Error(e) => assert_eq!(e.message, "Rate limit exceeded"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_and_join_named_room() {
        let handle = spawn_service(&config());
        let (conn_a, _a, mut rx_a) = register(&handle, "a", &[]).await;

        handle
            .inbound(
                conn_a,
                r#"{"type":"create_room","payload":{"name":"Lobby","isPrivate":true}}"#,
            )
            .await
            .unwrap();
        let room = match next(&mut rx_a).await {
            ServerMessage::RoomCreated(room) => room,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(room.name, "Lobby");
        assert!(room.is_private);

        let join = ClientMessage::JoinRoom(RoomRef {
            room_id: room.room_id.clone(),
        });
        handle.inbound(conn_a, join.to_text().unwrap()).await.unwrap();
        match next(&mut rx_a).await {
            ServerMessage::PeerList(list) => {
                assert_eq!(list.room_id, Some(room.room_id.clone()));
                assert!(list.peers.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }

        let leave = ClientMessage::LeaveRoom(RoomRef {
            room_id: room.room_id,
        });
        handle.inbound(conn_a, leave.to_text().unwrap()).await.unwrap();

        // Named rooms survive becoming empty
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.total_rooms, 1);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let handle = spawn_service(&config());
        let (conn, mut rx) = handle.attach().await.unwrap();

        handle.inbound(conn, "{not json").await.unwrap();
        handle
            .inbound(conn, r#"{"type":"peer_discover","payload":{"roomId":"x"}}"#)
            .await
            .unwrap();

        // The first reply belongs to the valid frame
        assert!(matches!(next(&mut rx).await, ServerMessage::PeerList(_)));
    }
}
