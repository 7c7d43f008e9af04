//! Sync protocol message model
//!
//! The wire protocol is a closed set of JSON messages exchanged between
//! the bridge and remote spatial clients. Every message carries a type
//! tag, a millisecond timestamp and a UUID; the payload shape is
//! determined by the type.

mod error;

pub use error::CodecError;

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use uuid::Uuid;

/// Protocol version advertised during handshake and discovery
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Server name surfaced in `ConnectionAccepted.serverInfo`
pub const SERVER_NAME: &str = "Roo Code";

/// Capabilities advertised by the server during handshake
pub const SERVER_CAPABILITIES: [&str; 3] = ["ai_conversation", "trigger_send", "echo"];

/// Capabilities advertised by the discovery endpoint
pub const DISCOVERY_CAPABILITIES: [&str; 4] =
    ["ai_conversation", "trigger_send", "echo", "ping_pong"];

/// Current wall clock as millisecond epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Message type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ClientHandshake,
    ConnectionAccepted,
    ConnectionRejected,
    AiConversation,
    AskResponse,
    TriggerSend,
    Ping,
    Pong,
    Echo,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientHandshake => "ClientHandshake",
            Self::ConnectionAccepted => "ConnectionAccepted",
            Self::ConnectionRejected => "ConnectionRejected",
            Self::AiConversation => "AIConversation",
            Self::AskResponse => "AskResponse",
            Self::TriggerSend => "TriggerSend",
            Self::Ping => "Ping",
            Self::Pong => "Pong",
            Self::Echo => "Echo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ClientHandshake" => Some(Self::ClientHandshake),
            "ConnectionAccepted" => Some(Self::ConnectionAccepted),
            "ConnectionRejected" => Some(Self::ConnectionRejected),
            "AIConversation" => Some(Self::AiConversation),
            "AskResponse" => Some(Self::AskResponse),
            "TriggerSend" => Some(Self::TriggerSend),
            "Ping" => Some(Self::Ping),
            "Pong" => Some(Self::Pong),
            "Echo" => Some(Self::Echo),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversation role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Answer kinds accepted by the host's pending-prompt operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskResponseKind {
    YesButtonClicked,
    NoButtonClicked,
    MessageResponse,
    ObjectResponse,
}

impl AskResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::YesButtonClicked => "yesButtonClicked",
            Self::NoButtonClicked => "noButtonClicked",
            Self::MessageResponse => "messageResponse",
            Self::ObjectResponse => "objectResponse",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "yesButtonClicked" => Some(Self::YesButtonClicked),
            "noButtonClicked" => Some(Self::NoButtonClicked),
            "messageResponse" => Some(Self::MessageResponse),
            "objectResponse" => Some(Self::ObjectResponse),
            _ => None,
        }
    }
}

/// TriggerSend actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    Send,
    Cancel,
}

impl TriggerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Cancel => "cancel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "send" => Some(Self::Send),
            "cancel" => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// Declared client identity, normalized from either handshake encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub client_type: String,
    pub version: String,
    pub capabilities: Vec<String>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            client_type: "visionOS".to_string(),
            version: "1.0.0".to_string(),
            capabilities: Vec::new(),
        }
    }
}

/// Server identity echoed in `ConnectionAccepted`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub platform: String,
    pub capabilities: Vec<String>,
}

impl ServerInfo {
    /// The server info this bridge advertises
    pub fn local() -> Self {
        Self {
            name: SERVER_NAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            platform: std::env::consts::OS.to_string(),
            capabilities: SERVER_CAPABILITIES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Streaming extension fields carried on `AIConversation` messages.
///
/// `stream_id` is the stable identity a client uses to fold a sequence
/// of partial deltas and a final message into one rendered bubble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub is_streaming: bool,
    pub is_final: bool,
    pub stream_id: String,
    pub chunk_index: u32,
}

/// `AIConversation` payload
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub metadata: Option<Value>,
    pub partial: Option<bool>,
    pub stream: Option<StreamInfo>,
}

/// `AskResponse` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskReply {
    pub session_id: String,
    pub response: AskResponseKind,
    pub text: Option<String>,
    pub images: Option<Vec<String>>,
}

/// Payload union over the closed message type set
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    ClientHandshake(Handshake),
    ConnectionAccepted {
        connection_id: Uuid,
        server_info: ServerInfo,
    },
    ConnectionRejected {
        reason: String,
    },
    AiConversation(Conversation),
    AskResponse(AskReply),
    TriggerSend {
        session_id: String,
        action: TriggerAction,
    },
    Ping,
    Pong,
    Echo {
        message: String,
    },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ClientHandshake(_) => MessageType::ClientHandshake,
            Self::ConnectionAccepted { .. } => MessageType::ConnectionAccepted,
            Self::ConnectionRejected { .. } => MessageType::ConnectionRejected,
            Self::AiConversation(_) => MessageType::AiConversation,
            Self::AskResponse(_) => MessageType::AskResponse,
            Self::TriggerSend { .. } => MessageType::TriggerSend,
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
            Self::Echo { .. } => MessageType::Echo,
        }
    }
}

/// A complete wire message: base fields plus the typed payload
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub id: Uuid,
    pub timestamp: u64,
    pub body: MessageBody,
}

impl WireMessage {
    /// Build a message with a fresh id and the current timestamp
    pub fn new(body: MessageBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: now_millis(),
            body,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Ping, Pong and Echo frames (kept out of send telemetry)
    pub fn is_system(&self) -> bool {
        matches!(
            self.body,
            MessageBody::Ping | MessageBody::Pong | MessageBody::Echo { .. }
        )
    }

    /// The three handshake variants
    pub fn is_connection(&self) -> bool {
        matches!(
            self.body,
            MessageBody::ClientHandshake(_)
                | MessageBody::ConnectionAccepted { .. }
                | MessageBody::ConnectionRejected { .. }
        )
    }

    /// Messages dispatched to the AI bridge
    pub fn is_ai(&self) -> bool {
        matches!(
            self.body,
            MessageBody::AiConversation(_)
                | MessageBody::AskResponse(_)
                | MessageBody::TriggerSend { .. }
        )
    }
}
