/*
    SignalingLink - client side of the signaling connection

    A cooperative retry task:
    1. connect through a SignalingConnector
    2. publish Connected, forward every server frame as LinkEvent::Message,
       send peer_heartbeat on every heartbeat tick
    3. on disconnect publish Disconnected and wait the backoff delay
       (doubling from initial_backoff up to max_backoff, reset after a
       successful connect), then go to 1

    The task stops on the shutdown signal. It knows nothing about per-peer
    transports.
*/

use super::errors::{ConnectionError, ConnectionResult};
use crate::config::LinkConfig;
use crate::core_signaling::{ClientMessage, ServerMessage, SignalingHandle};
use crate::events::{EventBus, SubscriptionId};
use crate::metrics;
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Text frames in both directions. Dropping `outbound` closes the connection;
/// `inbound` ends when the server side goes away.
pub struct LinkChannels {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self) -> ConnectionResult<LinkChannels>;
}

/// Connects to a signaling server over WebSocket
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        WebSocketConnector { url: url.into() }
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self) -> ConnectionResult<LinkChannels> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectionError::Link(format!("connect {}: {}", self.url, e)))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "Signaling socket read failed");
                        break;
                    }
                }
            }
        });

        Ok(LinkChannels { outbound, inbound })
    }
}

/// Connects to a signaling service running in the same process
pub struct InProcessConnector {
    handle: SignalingHandle,
}

impl InProcessConnector {
    pub fn new(handle: SignalingHandle) -> Self {
        InProcessConnector { handle }
    }
}

#[async_trait]
impl SignalingConnector for InProcessConnector {
    async fn connect(&self) -> ConnectionResult<LinkChannels> {
        let (conn_id, inbound) = self
            .handle
            .attach()
            .await
            .map_err(|e| ConnectionError::Link(e.to_string()))?;
        let (outbound, mut out_rx) = mpsc::unbounded_channel::<String>();

        let handle = self.handle.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if handle.inbound(conn_id, text).await.is_err() {
                    break;
                }
            }
            handle.detach(conn_id).await;
        });

        Ok(LinkChannels { outbound, inbound })
    }
}

/// Doubling delay with a ceiling
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        BackoffPolicy {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Message(ServerMessage),
    Disconnected,
}

struct LinkShared {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    connected: AtomicBool,
    events: EventBus<LinkEvent>,
}

#[derive(Clone)]
pub struct SignalingLink {
    shared: Arc<LinkShared>,
}

impl SignalingLink {
    pub fn new() -> Self {
        SignalingLink {
            shared: Arc::new(LinkShared {
                outbound: Mutex::new(None),
                connected: AtomicBool::new(false),
                events: EventBus::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<LinkEvent>) {
        self.shared.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Send a frame if connected. Returns false while disconnected.
    pub fn send(&self, message: &ClientMessage) -> bool {
        let text = match message.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to serialize client message");
                return false;
            }
        };
        let outbound = self.shared.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match outbound.as_ref() {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        }
    }

    /// Spawn the connect/retry task
    pub fn start(
        &self,
        connector: Arc<dyn SignalingConnector>,
        config: &LinkConfig,
        shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> JoinHandle<()> {
        let link = self.clone();
        let backoff = BackoffPolicy::new(config.initial_backoff, config.max_backoff);
        let heartbeat = config.heartbeat_interval;
        tokio::spawn(link.run(connector, backoff, heartbeat, shutdown))
    }

    async fn run(
        self,
        connector: Arc<dyn SignalingConnector>,
        mut backoff: BackoffPolicy,
        heartbeat: Duration,
        mut shutdown: broadcast::Receiver<ShutdownSignal>,
    ) {
        loop {
            let attempt = tokio::select! {
                attempt = connector.connect() => attempt,
                _ = shutdown.recv() => break,
            };

            match attempt {
                Ok(channels) => {
                    backoff.reset();
                    info!("Signaling link connected");
                    let stopping = self.run_session(channels, heartbeat, &mut shutdown).await;
                    if stopping {
                        break;
                    }
                    metrics::link_reconnect();
                }
                Err(e) => warn!(error = %e, "Signaling link connect failed"),
            }

            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
        }
        info!("Signaling link stopped");
    }

    /// Returns true if the session ended because of shutdown
    async fn run_session(
        &self,
        channels: LinkChannels,
        heartbeat: Duration,
        shutdown: &mut broadcast::Receiver<ShutdownSignal>,
    ) -> bool {
        let LinkChannels {
            outbound,
            mut inbound,
        } = channels;
        *self.shared.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(outbound);
        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared.events.publish(LinkEvent::Connected);

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
        let stopping = loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(text) => match ServerMessage::parse(&text) {
                        Ok(message) => self.shared.events.publish(LinkEvent::Message(message)),
                        Err(e) => debug!(error = %e, "Ignoring malformed server frame"),
                    },
                    None => break false,
                },
                _ = ticker.tick() => {
                    self.send(&ClientMessage::PeerHeartbeat);
                }
                _ = shutdown.recv() => break true,
            }
        };

        // Dropping the sender closes the connection
        self.shared.outbound.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.events.publish(LinkEvent::Disconnected);
        if !stopping {
            warn!("Signaling link lost");
        }
        stopping
    }
}

impl Default for SignalingLink {
    fn default() -> Self {
        Self::new()
    }
}
