//! Sync Service orchestrator
//!
//! Owns the lifecycle and wiring of the network probe, connection
//! server, discovery endpoint and AI bridge: starts them in order with
//! rollback on failure, pumps server events into bridge dispatch,
//! forwards bridge-generated messages to their connections, and keeps
//! the host UI informed of the connection list.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{AiBridge, ClientMessage};
use crate::config::{Config, HeartbeatConfig, SyncConfig};
use crate::discovery::{DiscoveryConfig, DiscoveryError, DiscoveryServer};
use crate::host::{ClientInfo, HostProvider, StatusSnapshot};
use crate::netinfo::{self, NetworkInfo};
use crate::protocol::MessageBody;
use crate::server::{
    ConnectionInfo, ConnectionServer, ServerConfig, ServerError, ServerEvent,
};

/// Service events, fanned out over a broadcast channel
#[derive(Debug, Clone)]
pub enum SyncEvent {
    ServiceStarted { port: u16, discovery_port: u16 },
    ServiceStopped,
    ClientConnected { id: Uuid },
    ClientDisconnected { id: Uuid, reason: String },
    Error { message: String },
}

/// Service error types. Only startup errors escape to the caller.
#[derive(Debug)]
pub enum ServiceError {
    /// `start()` called while already running
    AlreadyRunning,
    /// No free port within the scan range
    NoAvailablePort { start: u16 },
    /// Connection server failed to start
    Server(ServerError),
    /// Discovery endpoint failed to start
    Discovery(DiscoveryError),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::AlreadyRunning => write!(f, "sync service is already running"),
            ServiceError::NoAvailablePort { start } => {
                write!(f, "no available port in range {}..{}", start, start + 10)
            }
            ServiceError::Server(e) => write!(f, "connection server: {}", e),
            ServiceError::Discovery(e) => write!(f, "discovery endpoint: {}", e),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<ServerError> for ServiceError {
    fn from(e: ServerError) -> Self {
        ServiceError::Server(e)
    }
}

impl From<DiscoveryError> for ServiceError {
    fn from(e: DiscoveryError) -> Self {
        ServiceError::Discovery(e)
    }
}

/// Public status snapshot
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub running: bool,
    pub config: SyncConfig,
    pub network_info: Option<NetworkInfo>,
    pub connections: usize,
    pub connected_clients: Vec<ConnectionInfo>,
    pub websocket_port: Option<u16>,
    pub discovery_port: Option<u16>,
}

/// Everything owned while the service is up
struct Running {
    server: Arc<ConnectionServer>,
    discovery: Arc<DiscoveryServer>,
    bridge: Arc<AiBridge>,
    network: NetworkInfo,
    pumps: Vec<JoinHandle<()>>,
}

/// The sync service
pub struct SyncService {
    config: RwLock<SyncConfig>,
    heartbeat: HeartbeatConfig,
    events: broadcast::Sender<SyncEvent>,
    running: Mutex<Option<Running>>,
}

impl SyncService {
    pub fn new(config: Config) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config: RwLock::new(config.sync),
            heartbeat: config.heartbeat,
            events,
            running: Mutex::new(None),
        }
    }

    /// Subscribe to service events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Replace the sync configuration. Takes effect at the next
    /// `start()`, never on a running instance.
    pub fn update_config(&self, config: SyncConfig) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> SyncConfig {
        self.config.read().clone()
    }

    /// Start the service against a host provider. A disabled config is
    /// a successful no-op. Any step failure rolls back what already
    /// started and surfaces the error.
    pub async fn start(&self, provider: Arc<dyn HostProvider>) -> Result<(), ServiceError> {
        let config = self.config.read().clone();
        if !config.enabled {
            info!("Sync service disabled by configuration");
            return Ok(());
        }

        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServiceError::AlreadyRunning);
        }

        let network = netinfo::probe().await;
        info!(
            "Network: {} on {} ({}), online={}",
            network.ip_address, network.interface_name, network.network_segment, network.is_online
        );

        let ws_port = netinfo::find_available_port(config.port)
            .ok_or(ServiceError::NoAvailablePort { start: config.port })?;
        let discovery_port = (config.discovery_port..config.discovery_port.saturating_add(10))
            .find(|&p| p != ws_port && netinfo::is_port_available(p))
            .ok_or(ServiceError::NoAvailablePort {
                start: config.discovery_port,
            })?;

        let server = Arc::new(ConnectionServer::new(ServerConfig {
            port: ws_port,
            max_connections: config.max_connections,
            heartbeat_interval: self.heartbeat.interval,
            heartbeat_grace: self.heartbeat.grace,
        }));
        server.start().await?;

        let discovery = Arc::new(DiscoveryServer::new(DiscoveryConfig {
            port: discovery_port,
            service_name: config.service_name.clone(),
            websocket_port: ws_port,
            network: network.clone(),
        }));
        if let Err(e) = discovery.start().await {
            server.stop().await;
            return Err(e.into());
        }

        let (bridge, bridge_rx) = AiBridge::new(provider.clone(), config.consecutive_mistake_limit);
        bridge.start();

        let pumps = vec![
            self.spawn_event_pump(server.clone(), bridge.clone(), provider, discovery_port),
            Self::spawn_bridge_pump(server.clone(), bridge_rx),
            Self::spawn_cleanup(server.clone(), bridge.clone()),
        ];

        *running = Some(Running {
            server,
            discovery,
            bridge,
            network,
            pumps,
        });
        drop(running);

        info!(
            "Sync service started (ws={}, discovery={})",
            ws_port, discovery_port
        );
        let _ = self.events.send(SyncEvent::ServiceStarted {
            port: ws_port,
            discovery_port,
        });
        Ok(())
    }

    /// Stop everything. Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        for pump in running.pumps {
            pump.abort();
        }
        running.bridge.shutdown();
        running.discovery.stop().await;
        running.server.stop().await;
        info!("Sync service stopped");
        let _ = self.events.send(SyncEvent::ServiceStopped);
    }

    /// Current status snapshot
    pub async fn status(&self) -> SyncStatus {
        let config = self.config.read().clone();
        match self.running.lock().await.as_ref() {
            Some(running) => SyncStatus {
                running: true,
                config,
                network_info: Some(running.network.clone()),
                connections: running.server.connection_count(),
                connected_clients: running.server.connected_clients(),
                websocket_port: Some(running.server.port()),
                discovery_port: Some(running.discovery.port()),
            },
            None => SyncStatus {
                running: false,
                config,
                network_info: None,
                connections: 0,
                connected_clients: Vec::new(),
                websocket_port: None,
                discovery_port: None,
            },
        }
    }

    /// Pump server events: dispatch AI messages to the bridge and keep
    /// the host UI status current. Each event kind is handled
    /// independently.
    fn spawn_event_pump(
        &self,
        server: Arc<ConnectionServer>,
        bridge: Arc<AiBridge>,
        provider: Arc<dyn HostProvider>,
        discovery_port: u16,
    ) -> JoinHandle<()> {
        let mut events = server.subscribe();
        let sync_events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ServerEvent::ClientConnected { id }) => {
                        info!("Client connected: {}", id);
                        let _ = sync_events.send(SyncEvent::ClientConnected { id });
                        push_status(&server, &provider, discovery_port);
                    }
                    Ok(ServerEvent::ClientDisconnected { id, reason }) => {
                        info!("Client disconnected: {} ({})", id, reason);
                        bridge.unregister_client(id);
                        let _ = sync_events.send(SyncEvent::ClientDisconnected { id, reason });
                        push_status(&server, &provider, discovery_port);
                    }
                    Ok(ServerEvent::MessageReceived { id, message }) => {
                        if message.is_ai() {
                            dispatch(&bridge, &server, id, message).await;
                        } else {
                            debug!(
                                "Unhandled {} from {}",
                                message.message_type(),
                                id
                            );
                        }
                    }
                    Ok(ServerEvent::MessageSent { .. }) => {}
                    Ok(ServerEvent::Error { id, message }) => {
                        let _ = sync_events.send(SyncEvent::Error {
                            message: format!("connection {}: {}", id, message),
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Service event pump lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Hourly sweep dropping bridge records whose connection is gone.
    /// Disconnects normally clean these up; the sweep catches anything
    /// missed.
    fn spawn_cleanup(server: Arc<ConnectionServer>, bridge: Arc<AiBridge>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            // Skip the first immediate tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let live: Vec<Uuid> = server.connections().into_iter().map(|c| c.id).collect();
                bridge.prune(&live);
            }
        })
    }

    /// Forward bridge-generated messages to their connections
    fn spawn_bridge_pump(
        server: Arc<ConnectionServer>,
        mut rx: mpsc::Receiver<ClientMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some((connection_id, message)) = rx.recv().await {
                if !server.send_message(connection_id, &message) {
                    debug!("Bridge message for {} not delivered", connection_id);
                }
            }
        })
    }
}

/// Register the sender with the bridge, run the matching handler and
/// answer on the originating connection.
async fn dispatch(
    bridge: &Arc<AiBridge>,
    server: &Arc<ConnectionServer>,
    id: Uuid,
    message: crate::protocol::WireMessage,
) {
    let response = match &message.body {
        MessageBody::AiConversation(conversation) => {
            bridge.register_client(id, &conversation.session_id).await;
            bridge
                .handle_conversation(id, conversation, message.id)
                .await
        }
        MessageBody::AskResponse(reply) => {
            bridge.register_client(id, &reply.session_id).await;
            Some(bridge.handle_ask_response(id, reply, message.id).await)
        }
        MessageBody::TriggerSend { session_id, action } => {
            bridge.register_client(id, session_id).await;
            Some(bridge.handle_trigger(session_id, *action, message.id).await)
        }
        _ => None,
    };
    if let Some(response) = response {
        server.send_message(id, &response);
    }
}

/// Push the current connection list to the host UI
fn push_status(
    server: &Arc<ConnectionServer>,
    provider: &Arc<dyn HostProvider>,
    discovery_port: u16,
) {
    let connections = server
        .connected_clients()
        .into_iter()
        .map(|info| ClientInfo {
            id: info.id,
            client_type: info.client_type,
            version: info.version,
        })
        .collect();
    provider.push_status(StatusSnapshot {
        running: true,
        websocket_port: Some(server.port()),
        discovery_port: Some(discovery_port),
        connections,
    });
}
