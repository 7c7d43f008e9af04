//! VisionSync - LAN sync bridge for host AI sessions
//!
//! Mirrors a conversational AI session running inside a host editor to
//! remote spatial-computing clients over WebSocket, and funnels client
//! commands back into the host's task engine. A small HTTP endpoint
//! makes the service discoverable on the local network.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod host;
pub mod netinfo;
pub mod protocol;
pub mod server;
pub mod service;

pub use bridge::{AiBridge, BridgeClient};
pub use config::{Config, SyncConfig};
pub use discovery::{DiscoveryConfig, DiscoveryServer};
pub use host::{HostProvider, HostTask, TaskMessage, TaskOptions};
pub use netinfo::NetworkInfo;
pub use protocol::{CodecError, MessageBody, MessageType, WireMessage};
pub use server::{ConnectionInfo, ConnectionServer, ConnectionState, ServerConfig, ServerEvent};
pub use service::{SyncEvent, SyncService, SyncStatus};
