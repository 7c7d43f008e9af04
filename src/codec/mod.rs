//! Wire message codec
//!
//! Decodes one JSON object per WebSocket text frame into a typed
//! [`WireMessage`], and encodes typed messages back to JSON. Decoding
//! is tolerant where the protocol demands it:
//!
//! - missing `timestamp` / `id` are back-filled (wall clock, fresh UUID)
//! - `ClientHandshake` details may sit at the top level or under
//!   `payload`; both normalize to the same in-memory form
//! - inbound `payload.session_id` is accepted as `sessionId`
//!
//! Unknown `type` values and missing required fields are codec errors;
//! the connection handler logs them and drops the frame.


use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::protocol::{
    now_millis, AskReply, AskResponseKind, CodecError, Conversation, Handshake, MessageBody,
    MessageType, Role, ServerInfo, StreamInfo, TriggerAction, WireMessage,
};

/// Decode a single text frame into a typed message
pub fn decode(text: &str) -> Result<WireMessage, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    let obj = value.as_object().ok_or(CodecError::NotAnObject)?;

    let type_str = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingType)?;
    let message_type = MessageType::parse(type_str)
        .ok_or_else(|| CodecError::UnknownType(type_str.to_string()))?;

    // Back-fill base fields so legacy clients are not rejected
    let timestamp = obj
        .get("timestamp")
        .and_then(Value::as_u64)
        .unwrap_or_else(now_millis);
    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    let body = match message_type {
        MessageType::ClientHandshake => decode_handshake(obj)?,
        MessageType::ConnectionAccepted => decode_accepted(obj)?,
        MessageType::ConnectionRejected => decode_rejected(obj)?,
        MessageType::AiConversation => decode_conversation(obj)?,
        MessageType::AskResponse => decode_ask_response(obj)?,
        MessageType::TriggerSend => decode_trigger(obj)?,
        MessageType::Ping => MessageBody::Ping,
        MessageType::Pong => MessageBody::Pong,
        MessageType::Echo => decode_echo(obj)?,
    };

    Ok(WireMessage {
        id,
        timestamp,
        body,
    })
}

/// Encode a typed message to its JSON wire form.
///
/// Output is always in the normalized encoding (handshake details at
/// the top level, `sessionId` spelling).
pub fn encode(msg: &WireMessage) -> String {
    let mut obj = Map::new();
    obj.insert(
        "type".to_string(),
        Value::from(msg.message_type().as_str()),
    );
    obj.insert("timestamp".to_string(), Value::from(msg.timestamp));
    obj.insert("id".to_string(), Value::from(msg.id.to_string()));

    match &msg.body {
        MessageBody::ClientHandshake(h) => {
            obj.insert("clientType".to_string(), Value::from(h.client_type.clone()));
            obj.insert("version".to_string(), Value::from(h.version.clone()));
            obj.insert(
                "capabilities".to_string(),
                Value::from(h.capabilities.clone()),
            );
        }
        MessageBody::ConnectionAccepted {
            connection_id,
            server_info,
        } => {
            obj.insert(
                "payload".to_string(),
                json!({
                    "connectionId": connection_id.to_string(),
                    "serverInfo": {
                        "name": server_info.name,
                        "version": server_info.version,
                        "platform": server_info.platform,
                        "capabilities": server_info.capabilities,
                    },
                }),
            );
        }
        MessageBody::ConnectionRejected { reason } => {
            obj.insert("reason".to_string(), Value::from(reason.clone()));
        }
        MessageBody::AiConversation(conv) => {
            let mut payload = Map::new();
            payload.insert("sessionId".to_string(), Value::from(conv.session_id.clone()));
            payload.insert("role".to_string(), Value::from(conv.role.as_str()));
            payload.insert("content".to_string(), Value::from(conv.content.clone()));
            if let Some(metadata) = &conv.metadata {
                payload.insert("metadata".to_string(), metadata.clone());
            }
            if let Some(partial) = conv.partial {
                payload.insert("partial".to_string(), Value::from(partial));
            }
            obj.insert("payload".to_string(), Value::Object(payload));

            // Streaming extension fields ride on the message itself
            if let Some(stream) = &conv.stream {
                obj.insert("isStreaming".to_string(), Value::from(stream.is_streaming));
                obj.insert("isFinal".to_string(), Value::from(stream.is_final));
                obj.insert("streamId".to_string(), Value::from(stream.stream_id.clone()));
                obj.insert("chunkIndex".to_string(), Value::from(stream.chunk_index));
            }
        }
        MessageBody::AskResponse(reply) => {
            let mut payload = Map::new();
            payload.insert(
                "sessionId".to_string(),
                Value::from(reply.session_id.clone()),
            );
            payload.insert(
                "askResponse".to_string(),
                Value::from(reply.response.as_str()),
            );
            if let Some(text) = &reply.text {
                payload.insert("text".to_string(), Value::from(text.clone()));
            }
            if let Some(images) = &reply.images {
                payload.insert("images".to_string(), Value::from(images.clone()));
            }
            obj.insert("payload".to_string(), Value::Object(payload));
        }
        MessageBody::TriggerSend { session_id, action } => {
            obj.insert(
                "payload".to_string(),
                json!({
                    "sessionId": session_id,
                    "action": action.as_str(),
                }),
            );
        }
        MessageBody::Ping | MessageBody::Pong => {}
        MessageBody::Echo { message } => {
            obj.insert("payload".to_string(), json!({ "message": message }));
        }
    }

    Value::Object(obj).to_string()
}

/// Accept handshake details at the top level or nested under `payload`,
/// with defaults for anything missing.
fn decode_handshake(obj: &Map<String, Value>) -> Result<MessageBody, CodecError> {
    let payload = obj.get("payload").and_then(Value::as_object);
    let field = |name: &str| -> Option<&Value> {
        obj.get(name).or_else(|| payload.and_then(|p| p.get(name)))
    };

    let defaults = Handshake::default();
    let client_type = field("clientType")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or(defaults.client_type);
    let version = field("version")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or(defaults.version);
    let capabilities = match field("capabilities") {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(other) => {
            return Err(CodecError::InvalidField {
                field: "capabilities",
                value: other.to_string(),
            })
        }
    };

    Ok(MessageBody::ClientHandshake(Handshake {
        client_type,
        version,
        capabilities,
    }))
}

fn decode_accepted(obj: &Map<String, Value>) -> Result<MessageBody, CodecError> {
    let payload = require_payload(obj)?;
    let connection_id = payload
        .get("connectionId")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingField("payload.connectionId"))?;
    let connection_id =
        Uuid::parse_str(connection_id).map_err(|_| CodecError::InvalidField {
            field: "payload.connectionId",
            value: connection_id.to_string(),
        })?;

    let info = payload
        .get("serverInfo")
        .and_then(Value::as_object)
        .ok_or(CodecError::MissingField("payload.serverInfo"))?;
    let server_info = ServerInfo {
        name: string_or_default(info, "name"),
        version: string_or_default(info, "version"),
        platform: string_or_default(info, "platform"),
        capabilities: string_array(info, "capabilities"),
    };

    Ok(MessageBody::ConnectionAccepted {
        connection_id,
        server_info,
    })
}

fn decode_rejected(obj: &Map<String, Value>) -> Result<MessageBody, CodecError> {
    let reason = obj
        .get("reason")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingField("reason"))?;
    Ok(MessageBody::ConnectionRejected {
        reason: reason.to_string(),
    })
}

fn decode_conversation(obj: &Map<String, Value>) -> Result<MessageBody, CodecError> {
    let payload = require_payload(obj)?;

    let session_id = session_id(payload)?;
    let role_str = payload
        .get("role")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingField("payload.role"))?;
    let role = Role::parse(role_str).ok_or_else(|| CodecError::InvalidField {
        field: "payload.role",
        value: role_str.to_string(),
    })?;
    let content = payload
        .get("content")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingField("payload.content"))?
        .to_string();

    let metadata = payload.get("metadata").cloned();
    let partial = payload.get("partial").and_then(Value::as_bool);

    // Streaming extension fields, keyed off streamId
    let stream = obj
        .get("streamId")
        .and_then(Value::as_str)
        .map(|stream_id| {
            let is_streaming = obj
                .get("isStreaming")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            StreamInfo {
                is_streaming,
                is_final: obj
                    .get("isFinal")
                    .and_then(Value::as_bool)
                    .unwrap_or(!is_streaming),
                stream_id: stream_id.to_string(),
                chunk_index: obj
                    .get("chunkIndex")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32,
            }
        });

    Ok(MessageBody::AiConversation(Conversation {
        session_id,
        role,
        content,
        metadata,
        partial,
        stream,
    }))
}

fn decode_ask_response(obj: &Map<String, Value>) -> Result<MessageBody, CodecError> {
    let payload = require_payload(obj)?;

    let session_id = session_id(payload)?;
    let response_str = payload
        .get("askResponse")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingField("payload.askResponse"))?;
    let response =
        AskResponseKind::parse(response_str).ok_or_else(|| CodecError::InvalidField {
            field: "payload.askResponse",
            value: response_str.to_string(),
        })?;

    let text = payload
        .get("text")
        .and_then(Value::as_str)
        .map(str::to_string);
    let images = payload.get("images").and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    });

    Ok(MessageBody::AskResponse(AskReply {
        session_id,
        response,
        text,
        images,
    }))
}

fn decode_trigger(obj: &Map<String, Value>) -> Result<MessageBody, CodecError> {
    let payload = require_payload(obj)?;

    let session_id = session_id(payload)?;
    let action_str = payload
        .get("action")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingField("payload.action"))?;
    let action = TriggerAction::parse(action_str).ok_or_else(|| CodecError::InvalidField {
        field: "payload.action",
        value: action_str.to_string(),
    })?;

    Ok(MessageBody::TriggerSend { session_id, action })
}

fn decode_echo(obj: &Map<String, Value>) -> Result<MessageBody, CodecError> {
    let payload = require_payload(obj)?;
    let message = payload
        .get("message")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingField("payload.message"))?;
    Ok(MessageBody::Echo {
        message: message.to_string(),
    })
}

fn require_payload(obj: &Map<String, Value>) -> Result<&Map<String, Value>, CodecError> {
    obj.get("payload")
        .and_then(Value::as_object)
        .ok_or(CodecError::MissingField("payload"))
}

/// `sessionId`, accepting the snake_case spelling some clients send
fn session_id(payload: &Map<String, Value>) -> Result<String, CodecError> {
    payload
        .get("sessionId")
        .or_else(|| payload.get("session_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(CodecError::MissingField("payload.sessionId"))
}

fn string_or_default(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn string_array(obj: &Map<String, Value>, key: &str) -> Vec<String> {
    obj.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
