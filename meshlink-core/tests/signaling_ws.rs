//! Signaling protocol over a real WebSocket connection

use futures_util::{SinkExt, StreamExt};
use meshlink_core::config::SignalingConfig;
use meshlink_core::core_signaling::{
    ClientMessage, PeerDescriptor, RoomRef, ServerMessage, Signal, SignalKind, SignalingServer,
};
use meshlink_core::shutdown::ShutdownCoordinator;
use meshlink_core::{PeerId, RoomId, Timestamp};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn server(coordinator: &ShutdownCoordinator) -> SignalingServer {
    let config = SignalingConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        ..SignalingConfig::default()
    };
    SignalingServer::start(&config, coordinator).await.unwrap()
}

async fn send(socket: &mut Socket, message: ClientMessage) {
    socket
        .send(Message::Text(message.to_text().unwrap().into()))
        .await
        .unwrap();
}

async fn recv(socket: &mut Socket) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return ServerMessage::parse(text.as_str()).unwrap();
        }
    }
}

async fn register(socket: &mut Socket, nickname: &str, room: &str) -> PeerId {
    send(
        socket,
        ClientMessage::PeerRegister(PeerDescriptor {
            nickname: nickname.to_string(),
            rooms: vec![RoomId::from(room)],
            public_key: String::new(),
        }),
    )
    .await;

    match recv(socket).await {
        ServerMessage::Registered(registered) => registered.peer_id,
        other => panic!("expected registered, got {:?}", other),
    }
}

#[tokio::test]
async fn test_register_join_and_relay() {
    let coordinator = ShutdownCoordinator::new(Duration::from_secs(2));
    let server = server(&coordinator).await;

    let (mut first, _) = connect_async(server.ws_url()).await.unwrap();
    let first_id = register(&mut first, "first", "ops").await;
    match recv(&mut first).await {
        ServerMessage::PeerList(list) => assert!(list.peers.is_empty()),
        other => panic!("expected peer_list, got {:?}", other),
    }

    let (mut second, _) = connect_async(server.ws_url()).await.unwrap();
    let second_id = register(&mut second, "second", "ops").await;
    match recv(&mut second).await {
        ServerMessage::PeerList(list) => {
            assert_eq!(list.peers.len(), 1);
            assert_eq!(list.peers[0].peer_id, first_id);
        }
        other => panic!("expected peer_list, got {:?}", other),
    }

    match recv(&mut first).await {
        ServerMessage::PeerJoined(joined) => {
            assert_eq!(joined.room_id, RoomId::from("ops"));
            assert_eq!(joined.peer.peer_id, second_id);
            assert_eq!(joined.peer.nickname, "second");
        }
        other => panic!("expected peer_joined, got {:?}", other),
    }

    let offer = Signal {
        from: second_id.clone(),
        to: first_id.clone(),
        kind: SignalKind::Offer,
        data: serde_json::json!({"type": "offer", "sdp": "v=0"}),
        timestamp: Timestamp::now(),
    };
    send(&mut second, ClientMessage::WebrtcSignal(offer.clone())).await;
    assert_eq!(recv(&mut first).await, ServerMessage::WebrtcSignal(offer));

    send(
        &mut first,
        ClientMessage::PeerDiscover(RoomRef {
            room_id: RoomId::from("ops"),
        }),
    )
    .await;
    match recv(&mut first).await {
        ServerMessage::PeerList(list) => {
            assert_eq!(list.room_id, Some(RoomId::from("ops")));
            assert_eq!(list.peers.len(), 1);
        }
        other => panic!("expected peer_list, got {:?}", other),
    }

    // Closing the socket removes the peer from its rooms
    second.close(None).await.unwrap();
    match recv(&mut first).await {
        ServerMessage::PeerLeft(left) => assert_eq!(left.peer_id, second_id),
        other => panic!("expected peer_left, got {:?}", other),
    }

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frame_is_dropped_silently() {
    let coordinator = ShutdownCoordinator::new(Duration::from_secs(2));
    let server = server(&coordinator).await;

    let (mut socket, _) = connect_async(server.ws_url()).await.unwrap();
    socket
        .send(Message::Text("{not json".to_string().into()))
        .await
        .unwrap();

    // The connection stays usable and the next reply is the registration
    register(&mut socket, "after-garbage", "ops").await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_health_counts_registered_peers() {
    let coordinator = ShutdownCoordinator::new(Duration::from_secs(2));
    let server = server(&coordinator).await;

    let (mut socket, _) = connect_async(server.ws_url()).await.unwrap();
    register(&mut socket, "solo", "ops").await;

    let stats = server.handle.stats().await.unwrap();
    assert_eq!(stats.total_peers, 1);
    assert_eq!(stats.active_rooms, 1);

    coordinator.shutdown().await;
}
