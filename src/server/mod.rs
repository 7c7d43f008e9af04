//! WebSocket Connection Server
//!
//! Accepts persistent client connections, enforces the connection cap,
//! runs the handshake state machine and heartbeat, and routes inbound
//! messages. The server answers `ClientHandshake`, `Ping` and `Echo`
//! itself; everything else is surfaced as a [`ServerEvent`] for the
//! orchestrator.

mod connection;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec;
use crate::protocol::{MessageBody, MessageType, WireMessage};

use connection::Connection;
pub use connection::REJECT_CLOSE_CODE;

/// Connection server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket port to bind on all interfaces
    pub port: u16,
    /// Hard cap on simultaneous sessions
    pub max_connections: usize,
    /// Interval between server PING frames
    pub heartbeat_interval: Duration,
    /// Slack past the interval before a silent peer is dropped
    pub heartbeat_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8765,
            max_connections: 10,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_grace: Duration::from_secs(5),
        }
    }
}

/// Connection server error types
#[derive(Debug)]
pub enum ServerError {
    /// `start()` called while already listening
    AlreadyRunning,
    /// Failed to bind the listener
    Bind(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::AlreadyRunning => write!(f, "server is already running"),
            ServerError::Bind(e) => write!(f, "failed to bind listener: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

/// Connection lifecycle states.
///
/// The server only ever moves Connecting → Connected → Disconnected; a
/// dropped remote reopens a fresh socket with a new id. Reconnecting
/// and Failed exist for clients that report their own view of the
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Disconnected,
}

/// Public view of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub client_type: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub connected_at: u64,
    pub last_activity: u64,
    pub state: ConnectionState,
}

/// Server events, fanned out over a broadcast channel
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Handshake completed
    ClientConnected { id: Uuid },
    /// Socket closed, timed out or errored
    ClientDisconnected { id: Uuid, reason: String },
    /// A validated inbound message the server does not handle itself
    MessageReceived { id: Uuid, message: WireMessage },
    /// A non-system message was written to a connection
    MessageSent {
        id: Uuid,
        message_type: MessageType,
    },
    /// Non-fatal protocol error on a connection
    Error { id: Uuid, message: String },
}

/// Outbound instruction for a connection task
#[derive(Debug)]
pub(crate) enum OutboundFrame {
    /// A serialized wire message
    Message(String),
    /// Close the socket with a code and reason
    Close { code: u16, reason: String },
}

pub(crate) struct ConnectionHandle {
    pub(crate) info: ConnectionInfo,
    pub(crate) sender: mpsc::Sender<OutboundFrame>,
}

pub(crate) type Registry = Arc<RwLock<HashMap<Uuid, ConnectionHandle>>>;

/// The WebSocket connection server
pub struct ConnectionServer {
    config: ServerConfig,
    connections: Registry,
    events: broadcast::Sender<ServerEvent>,
    shutdown: broadcast::Sender<()>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl ConnectionServer {
    pub fn new(config: ServerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            connections: Arc::new(RwLock::new(HashMap::new())),
            events,
            shutdown,
            listener_task: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Subscribe to server events
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Bind the listener and start accepting. Fails if already running
    /// or the port cannot be bound.
    pub async fn start(&self) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = match TcpListener::bind(("0.0.0.0", self.config.port)).await {
            Ok(l) => l,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(ServerError::Bind(e));
            }
        };
        info!("Sync server listening on ws://0.0.0.0:{}", self.config.port);

        let connections = self.connections.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("New socket from {}", addr);
                        let at_capacity =
                            connections.read().len() >= config.max_connections;
                        let connection = Connection {
                            registry: connections.clone(),
                            events: events.clone(),
                            config: config.clone(),
                        };
                        let shutdown_rx = shutdown.subscribe();
                        tokio::spawn(async move {
                            if at_capacity {
                                connection.reject(stream, addr).await;
                            } else {
                                connection.run(stream, addr, shutdown_rx).await;
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        });
        *self.listener_task.lock() = Some(task);
        Ok(())
    }

    /// Close every connection and stop listening. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        if let Some(task) = self.listener_task.lock().take() {
            task.abort();
        }

        // Give connection tasks a moment to flush their close frames
        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        while !self.connections.read().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.connections.write().clear();
        info!("Sync server stopped");
    }

    /// Write a message to one connection. Returns false when the
    /// connection is absent or its socket is no longer writable.
    pub fn send_message(&self, id: Uuid, message: &WireMessage) -> bool {
        let serialized = codec::encode(message);
        let sent = {
            let connections = self.connections.read();
            match connections.get(&id) {
                Some(handle) => handle
                    .sender
                    .try_send(OutboundFrame::Message(serialized))
                    .is_ok(),
                None => false,
            }
        };

        if !sent {
            debug!("Send to {} failed ({})", id, message.message_type());
            return false;
        }
        // Keep heartbeat noise out of telemetry
        if !message.is_system() {
            let _ = self.events.send(ServerEvent::MessageSent {
                id,
                message_type: message.message_type(),
            });
        }
        true
    }

    /// Send to every Connected session; one slow peer never blocks the
    /// loop. Returns the number of successful sends.
    pub fn broadcast(&self, message: &WireMessage) -> usize {
        let targets: Vec<Uuid> = self
            .connections
            .read()
            .values()
            .filter(|h| h.info.state == ConnectionState::Connected)
            .map(|h| h.info.id)
            .collect();

        let mut delivered = 0;
        for id in targets {
            if self.send_message(id, message) {
                delivered += 1;
            } else {
                warn!("Broadcast skipped unreachable connection {}", id);
            }
        }
        delivered
    }

    /// Disconnect one client with a reason
    pub fn disconnect(&self, id: Uuid, reason: &str) {
        let connections = self.connections.read();
        if let Some(handle) = connections.get(&id) {
            let _ = handle.sender.try_send(OutboundFrame::Close {
                code: 1000,
                reason: reason.to_string(),
            });
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Snapshot of Connected sessions
    pub fn connected_clients(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .values()
            .filter(|h| h.info.state == ConnectionState::Connected)
            .map(|h| h.info.clone())
            .collect()
    }

    /// Snapshot of all sessions, any state
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .values()
            .map(|h| h.info.clone())
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }
}

/// Reason string for capacity rejections
pub const CAPACITY_REASON: &str = "Server at maximum capacity";

/// Build the rejection message sent before a 1013 close
pub(crate) fn rejection_message() -> WireMessage {
    WireMessage::new(MessageBody::ConnectionRejected {
        reason: CAPACITY_REASON.to_string(),
    })
}
