//! WebSocket signaling server
//!
//! `GET /ws` upgrades to the JSON signaling protocol, `GET /health` reports
//! registry counts. Each socket is split into a writer task draining the
//! service's outbound frames and a reader loop feeding inbound frames to the
//! service; when the reader ends the connection is detached.

use super::errors::{SignalingError, SignalingResult};
use super::registry::PeerRegistry;
use super::service::{SignalingHandle, SignalingService};
use crate::config::SignalingConfig;
use crate::health::HealthChecker;
use crate::shutdown::ShutdownCoordinator;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::ORIGIN, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared state for axum handlers
#[derive(Clone)]
pub struct ServerState {
    handle: SignalingHandle,
    health: HealthChecker,
    allowed_origin: Arc<str>,
}

impl ServerState {
    pub fn new(handle: SignalingHandle, health: HealthChecker, allowed_origin: &str) -> Self {
        ServerState {
            handle,
            health,
            allowed_origin: Arc::from(allowed_origin),
        }
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// `*` allows any origin; requests without an Origin header are not browsers
fn origin_allowed(allowed: &str, headers: &HeaderMap) -> bool {
    if allowed == "*" {
        return true;
    }
    match headers.get(ORIGIN) {
        None => true,
        Some(origin) => origin.to_str().map(|o| o == allowed).unwrap_or(false),
    }
}

async fn websocket_handler(
    State(state): State<ServerState>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if !origin_allowed(&state.allowed_origin, &headers) {
        warn!(origin = ?headers.get(ORIGIN), "Rejecting WebSocket upgrade from disallowed origin");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    match ws {
        Some(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state)),
        None => (StatusCode::UPGRADE_REQUIRED, "Expected WebSocket upgrade").into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (conn_id, mut outbound) = match state.handle.attach().await {
        Ok(attached) => attached,
        Err(e) => {
            warn!("Refusing connection: {}", e);
            return;
        }
    };
    info!(conn_id, "WebSocket connection opened");

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if state.handle.inbound(conn_id, text).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => debug!(conn_id, "Ignoring binary frame"),
            Ok(_) => {}
            Err(e) => {
                debug!(conn_id, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    state.handle.detach(conn_id).await;
    writer.abort();
    info!(conn_id, "WebSocket connection closed");
}

async fn health_handler(State(state): State<ServerState>) -> Response {
    let stats = match state.handle.stats().await {
        Ok(stats) => stats,
        Err(e) => {
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    let report = state.health.report(stats).await;
    let status = StatusCode::from_u16(report.status.to_http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(report)).into_response()
}

/// A running signaling service plus its HTTP surface
pub struct SignalingServer {
    pub local_addr: SocketAddr,
    pub handle: SignalingHandle,
}

impl SignalingServer {
    /// Bind, spawn the service and server, and register both with the
    /// shutdown coordinator
    pub async fn start(
        config: &SignalingConfig,
        coordinator: &ShutdownCoordinator,
    ) -> SignalingResult<Self> {
        let listener = TcpListener::bind(config.bind_address)
            .await
            .map_err(|e| SignalingError::Server(format!("bind {}: {}", config.bind_address, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SignalingError::Server(e.to_string()))?;

        let registry = PeerRegistry::new(config.max_peers_per_room);
        let (handle, service_task) = SignalingService::spawn(registry, config);

        let health = HealthChecker::new(env!("CARGO_PKG_VERSION"));
        let state = ServerState::new(handle.clone(), health, &config.allowed_origin);
        let app = router(state);

        let mut shutdown_rx = coordinator.subscribe();
        let service = handle.clone();
        let server_task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await;
            if let Err(e) = result {
                error!("Signaling server failed: {}", e);
            }
            service.shutdown().await;
        });

        coordinator.register_task("signaling_server", server_task);
        coordinator.register_task("signaling_service", service_task);
        info!(%local_addr, "Signaling server listening");

        Ok(SignalingServer { local_addr, handle })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }
}
