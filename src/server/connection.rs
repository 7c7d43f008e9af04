//! Per-connection handler
//!
//! One task per socket: performs the WebSocket upgrade, then runs a
//! select loop over inbound frames, outbound instructions from the
//! registry handle, the heartbeat ticker and server shutdown.

use std::net::SocketAddr;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec;
use crate::protocol::{now_millis, MessageBody, MessageType, ServerInfo, WireMessage};

use super::{
    rejection_message, ConnectionHandle, ConnectionInfo, ConnectionState, OutboundFrame,
    Registry, ServerConfig, ServerEvent, CAPACITY_REASON,
};

/// Close code for capacity rejections (1013, "try again later")
pub const REJECT_CLOSE_CODE: u16 = 1013;

/// Close code for normal server-initiated shutdown
const NORMAL_CLOSE_CODE: u16 = 1000;

pub(crate) struct Connection {
    pub(crate) registry: Registry,
    pub(crate) events: broadcast::Sender<ServerEvent>,
    pub(crate) config: ServerConfig,
}

impl Connection {
    /// Refuse a socket over capacity: complete the WebSocket upgrade,
    /// deliver `ConnectionRejected` and close with 1013. No connection
    /// record is allocated.
    pub(crate) async fn reject(self, stream: TcpStream, addr: SocketAddr) {
        warn!("Rejecting {}: at maximum capacity", addr);
        let mut ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("WebSocket upgrade failed for {}: {}", addr, e);
                return;
            }
        };
        let _ = ws
            .send(Message::Text(codec::encode(&rejection_message())))
            .await;
        let _ = ws
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(REJECT_CLOSE_CODE),
                reason: CAPACITY_REASON.into(),
            })))
            .await;
    }

    /// Run one accepted connection to completion
    pub(crate) async fn run(
        self,
        stream: TcpStream,
        addr: SocketAddr,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("WebSocket upgrade failed for {}: {}", addr, e);
                return;
            }
        };

        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel::<OutboundFrame>(64);
        {
            let now = now_millis();
            self.registry.write().insert(
                id,
                ConnectionHandle {
                    info: ConnectionInfo {
                        id,
                        client_type: "unknown".to_string(),
                        version: String::new(),
                        capabilities: Vec::new(),
                        connected_at: now,
                        last_activity: now,
                        state: ConnectionState::Connecting,
                    },
                    sender: tx,
                },
            );
        }
        debug!("Connection {} allocated for {}", id, addr);

        let (mut sink, mut inbound) = ws.split();

        let mut ping_ticker = tokio::time::interval(self.config.heartbeat_interval);
        // Skip the first immediate tick
        ping_ticker.tick().await;
        // A silent peer is dropped exactly at interval + grace past its
        // last frame, not at the next ping tick
        let pong_timeout = self.config.heartbeat_interval + self.config.heartbeat_grace;
        let mut pong_deadline = tokio::time::Instant::now() + pong_timeout;

        let reason: String = loop {
            tokio::select! {
                biased;

                result = shutdown_rx.recv() => {
                    match result {
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        _ => {
                            let _ = sink.send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(NORMAL_CLOSE_CODE),
                                reason: "Server shutdown".into(),
                            }))).await;
                            break "Server shutdown".to_string();
                        }
                    }
                }

                outbound = rx.recv() => {
                    match outbound {
                        Some(OutboundFrame::Message(text)) => {
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                debug!("Write to {} failed: {}", id, e);
                                break format!("write failed: {}", e);
                            }
                        }
                        Some(OutboundFrame::Close { code, reason }) => {
                            let _ = sink.send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.clone().into(),
                            }))).await;
                            break reason;
                        }
                        None => break "Server shutdown".to_string(),
                    }
                }

                frame = inbound.next() => {
                    // Any inbound frame proves the peer is alive
                    if let Some(Ok(_)) = &frame {
                        pong_deadline = tokio::time::Instant::now() + pong_timeout;
                    }
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reason) = self.handle_frame(id, &text, &mut sink).await {
                                break reason;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            break "closed by client".to_string();
                        }
                        Some(Ok(_)) => {
                            // Binary and raw frames are not part of the protocol
                            debug!("Ignoring non-text frame from {}", id);
                        }
                        Some(Err(e)) => {
                            debug!("Read error from {}: {}", id, e);
                            break format!("read error: {}", e);
                        }
                    }
                }

                _ = tokio::time::sleep_until(pong_deadline) => {
                    warn!("Connection {}: ping timeout", id);
                    let _ = sink.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::from(NORMAL_CLOSE_CODE),
                        reason: "Ping timeout".into(),
                    }))).await;
                    break "Ping timeout".to_string();
                }

                _ = ping_ticker.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break "write failed: ping".to_string();
                    }
                }
            }
        };

        self.registry.write().remove(&id);
        debug!("Connection {} closed: {}", id, reason);
        let _ = self
            .events
            .send(ServerEvent::ClientDisconnected { id, reason });
    }

    /// Decode and dispatch one text frame. Returns a close reason only
    /// when the socket became unwritable; protocol errors are logged
    /// and never fatal.
    async fn handle_frame(
        &self,
        id: Uuid,
        text: &str,
        sink: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    ) -> Option<String> {
        let message = match codec::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Invalid message from {}: {}", id, e);
                let _ = self.events.send(ServerEvent::Error {
                    id,
                    message: e.to_string(),
                });
                return None;
            }
        };

        {
            let mut registry = self.registry.write();
            if let Some(handle) = registry.get_mut(&id) {
                handle.info.last_activity = now_millis();
            }
        }
        let _ = self.events.send(ServerEvent::MessageReceived {
            id,
            message: message.clone(),
        });

        match &message.body {
            MessageBody::ClientHandshake(handshake) => {
                {
                    let mut registry = self.registry.write();
                    if let Some(handle) = registry.get_mut(&id) {
                        handle.info.client_type = handshake.client_type.clone();
                        handle.info.version = handshake.version.clone();
                        handle.info.capabilities = handshake.capabilities.clone();
                        handle.info.state = ConnectionState::Connected;
                    }
                }
                let reply = WireMessage::new(MessageBody::ConnectionAccepted {
                    connection_id: id,
                    server_info: ServerInfo::local(),
                });
                if let Err(e) = sink.send(Message::Text(codec::encode(&reply))).await {
                    return Some(format!("write failed: {}", e));
                }
                let _ = self.events.send(ServerEvent::MessageSent {
                    id,
                    message_type: MessageType::ConnectionAccepted,
                });
                let _ = self.events.send(ServerEvent::ClientConnected { id });
            }
            MessageBody::Ping => {
                let reply = WireMessage::new(MessageBody::Pong);
                if let Err(e) = sink.send(Message::Text(codec::encode(&reply))).await {
                    return Some(format!("write failed: {}", e));
                }
            }
            MessageBody::Echo { message: echoed } => {
                let reply = WireMessage::new(MessageBody::Echo {
                    message: echoed.clone(),
                });
                if let Err(e) = sink.send(Message::Text(codec::encode(&reply))).await {
                    return Some(format!("write failed: {}", e));
                }
            }
            _ => {}
        }
        None
    }
}
