//! AI Bridge
//!
//! The adapter between the host's AI task engine and the wire protocol.
//! Outbound, it listens to task message streams and converts every
//! created/updated event into an `AIConversation` targeted at each
//! registered client. Inbound, it executes client commands (new user
//! message, ask answer, send/cancel trigger) against the host and
//! produces per-client acknowledgments.


use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::host::{HostProvider, HostTask, TaskEvent, TaskMessage, TaskMessageKind, TaskOptions};
use crate::protocol::{
    AskReply, Conversation, MessageBody, Role, StreamInfo, TriggerAction, WireMessage,
};

/// Session id used before any client has declared one. Kept for
/// clients that handshake but never send an AI message.
pub const FALLBACK_SESSION: &str = "current-session";

/// Bridge-side record of a registered client.
///
/// Exists iff the connection exists and has sent at least one AI-typed
/// message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeClient {
    pub connection_id: Uuid,
    /// Session id echoed from the client's AI messages
    pub session_id: String,
    /// Task this client caused to be created or is currently driving
    pub current_task_id: Option<String>,
    /// Messages delivered to this client during replay
    pub synced_message_count: usize,
}

/// A message addressed to one registered client
pub type ClientMessage = (Uuid, WireMessage);

/// The AI Bridge adapter
pub struct AiBridge {
    provider: Arc<dyn HostProvider>,
    clients: RwLock<HashMap<Uuid, BridgeClient>>,
    outbound: mpsc::Sender<ClientMessage>,
    /// Per-task listener handles, detached on TaskDestroyed and cleanup
    listeners: Mutex<HashMap<String, JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    /// Mistake limit for tasks created from remote messages; None means
    /// unbounded
    mistake_limit: Option<u64>,
}

impl AiBridge {
    /// Build the bridge and the channel the orchestrator drains for
    /// client-addressed messages.
    pub fn new(
        provider: Arc<dyn HostProvider>,
        mistake_limit: Option<u64>,
    ) -> (Arc<Self>, mpsc::Receiver<ClientMessage>) {
        let (outbound, rx) = mpsc::channel(256);
        let bridge = Arc::new(Self {
            provider,
            clients: RwLock::new(HashMap::new()),
            outbound,
            listeners: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
            mistake_limit,
        });
        (bridge, rx)
    }

    /// Subscribe to task lifecycle events and attach to the current
    /// task, if any.
    pub fn start(self: &Arc<Self>) {
        if let Some(task) = self.provider.current_task() {
            self.attach_task(task);
        }

        let bridge = self.clone();
        let mut tasks_rx = self.provider.subscribe_tasks();
        let watcher = tokio::spawn(async move {
            loop {
                match tasks_rx.recv().await {
                    Ok(TaskEvent::Created { task_id }) => {
                        match bridge.provider.current_task() {
                            Some(task) if task.task_id() == task_id => {
                                bridge.attach_task(task);
                            }
                            _ => debug!("Created task {} is not current, skipping", task_id),
                        }
                    }
                    Ok(TaskEvent::Destroyed { task_id }) => {
                        bridge.detach_task(&task_id);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Bridge task watcher lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.watcher.lock() = Some(watcher);
    }

    /// Detach all listeners and clear the client table
    pub fn shutdown(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        for (_, handle) in self.listeners.lock().drain() {
            handle.abort();
        }
        self.clients.write().clear();
    }

    /// Install the message-stream listener for a task
    fn attach_task(self: &Arc<Self>, task: Arc<dyn HostTask>) {
        let task_id = task.task_id();
        let mut listeners = self.listeners.lock();
        if listeners.contains_key(&task_id) {
            return;
        }
        debug!("Bridge attaching to task {}", task_id);

        let bridge = self.clone();
        let listen_id = task_id.clone();
        let mut events = task.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => bridge.fan_out(&event.message, &listen_id),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Bridge listener for {} lagged by {} events", listen_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        listeners.insert(task_id, handle);
    }

    fn detach_task(&self, task_id: &str) {
        if let Some(handle) = self.listeners.lock().remove(task_id) {
            debug!("Bridge detaching from task {}", task_id);
            handle.abort();
        }
    }

    /// Register a connection on its first AI-typed message. Idempotent:
    /// an existing record only refreshes its session id. A fresh
    /// registration replays the current task history to that client.
    pub async fn register_client(&self, connection_id: Uuid, session_id: &str) {
        let fresh = {
            let mut clients = self.clients.write();
            match clients.get_mut(&connection_id) {
                Some(client) => {
                    client.session_id = session_id.to_string();
                    false
                }
                None => {
                    clients.insert(
                        connection_id,
                        BridgeClient {
                            connection_id,
                            session_id: session_id.to_string(),
                            current_task_id: None,
                            synced_message_count: 0,
                        },
                    );
                    true
                }
            }
        };
        if fresh {
            debug!("Bridge registered client {}", connection_id);
            self.replay(connection_id).await;
        }
    }

    /// Drop the record for a closed connection
    pub fn unregister_client(&self, connection_id: Uuid) {
        if self.clients.write().remove(&connection_id).is_some() {
            debug!("Bridge unregistered client {}", connection_id);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Drop records whose connection no longer exists. Run from the
    /// orchestrator's periodic cleanup sweep.
    pub fn prune(&self, live: &[Uuid]) {
        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|id, _| live.contains(id));
        let removed = before - clients.len();
        if removed > 0 {
            debug!("Bridge pruned {} stale client records", removed);
        }
    }

    /// Replay the current task's message log to one client, preserving
    /// `partial` flags so a mid-stream reconnect resumes its stream id.
    async fn replay(&self, connection_id: Uuid) {
        let Some(task) = self.provider.current_task() else {
            return;
        };
        let task_id = task.task_id();
        let mut delivered = 0;
        for message in task.messages() {
            if let Some(wire) = self.convert(&message, Some(&task_id)) {
                if self.outbound.send((connection_id, wire)).await.is_ok() {
                    delivered += 1;
                }
            }
        }
        if let Some(client) = self.clients.write().get_mut(&connection_id) {
            client.synced_message_count = delivered;
        }
        debug!(
            "Replayed {} messages of task {} to {}",
            delivered, task_id, connection_id
        );
    }

    /// Convert one live task event and queue it for every registered
    /// client.
    fn fan_out(&self, message: &TaskMessage, task_id: &str) {
        let Some(wire) = self.convert(message, Some(task_id)) else {
            return;
        };
        let targets: Vec<Uuid> = self.clients.read().keys().copied().collect();
        for connection_id in targets {
            if let Err(e) = self.outbound.try_send((connection_id, wire.clone())) {
                warn!("Dropping bridge message for {}: {}", connection_id, e);
            }
        }
    }

    /// The session id attached to host-originated messages: any
    /// registered client's, else the compatibility fallback.
    fn active_session(&self) -> String {
        self.clients
            .read()
            .values()
            .next()
            .map(|c| c.session_id.clone())
            .unwrap_or_else(|| FALLBACK_SESSION.to_string())
    }

    /// Convert a task message to wire form. Empty-after-trim messages
    /// produce nothing.
    fn convert(&self, message: &TaskMessage, task_id: Option<&str>) -> Option<WireMessage> {
        if message.text.trim().is_empty() {
            return None;
        }

        let role = match &message.kind {
            TaskMessageKind::Ask(_) => Role::User,
            TaskMessageKind::Say(say) => match say.as_str() {
                "text" | "completion_result" => Role::Assistant,
                "error" | "tool" => Role::System,
                _ => Role::Assistant,
            },
        };

        let mut metadata = Map::new();
        metadata.insert("timestamp".to_string(), Value::from(message.ts));
        metadata.insert("messageId".to_string(), Value::from(message.ts));
        metadata.insert("source".to_string(), Value::from("roo-code"));
        match &message.kind {
            TaskMessageKind::Ask(ask) => {
                metadata.insert("originalType".to_string(), Value::from("ask"));
                metadata.insert("askType".to_string(), Value::from(ask.clone()));
            }
            TaskMessageKind::Say(say) => {
                metadata.insert("originalType".to_string(), Value::from("say"));
                metadata.insert("sayType".to_string(), Value::from(say.clone()));
            }
        }
        if let Some(task_id) = task_id {
            metadata.insert("taskId".to_string(), Value::from(task_id));
        }

        let is_streaming = message.partial;
        // The logical message identity: explicit id when the host set
        // one, else the timestamp. Every update of the same message
        // must carry the same stream id.
        let stream_id = message
            .id
            .clone()
            .unwrap_or_else(|| message.ts.to_string());

        Some(WireMessage::new(MessageBody::AiConversation(Conversation {
            session_id: self.active_session(),
            role,
            content: message.text.clone(),
            metadata: Some(Value::Object(metadata)),
            partial: Some(message.partial),
            stream: Some(StreamInfo {
                is_streaming,
                is_final: !is_streaming,
                stream_id,
                chunk_index: 0,
            }),
        })))
    }

    /// Handle an inbound `AIConversation`. Only user-role messages are
    /// commands; anything else is ignored.
    pub async fn handle_conversation(
        &self,
        connection_id: Uuid,
        conversation: &Conversation,
        inbound_id: Uuid,
    ) -> Option<WireMessage> {
        if conversation.role != Role::User {
            debug!(
                "Ignoring inbound conversation with role {} from {}",
                conversation.role.as_str(),
                connection_id
            );
            return None;
        }

        let driving = {
            let clients = self.clients.read();
            let client_task = clients
                .get(&connection_id)
                .and_then(|c| c.current_task_id.clone());
            match (client_task, self.provider.current_task()) {
                (Some(client_task), Some(current)) if client_task == current.task_id() => {
                    Some(current)
                }
                _ => None,
            }
        };

        let ack = if let Some(task) = driving {
            // Continue the task the sender is already driving
            match task
                .submit_ask_response(
                    crate::protocol::AskResponseKind::MessageResponse,
                    Some(conversation.content.clone()),
                    Some(Vec::new()),
                )
                .await
            {
                Ok(()) => self.ack(
                    &conversation.session_id,
                    "Message sent to current task",
                    json!({
                        "type": "task_created",
                        "taskId": task.task_id(),
                        "originalMessageId": inbound_id.to_string(),
                    }),
                ),
                Err(e) => self.error_ack(&conversation.session_id, &e.to_string(), inbound_id),
            }
        } else {
            // Start a new task for this client
            match self
                .provider
                .create_task(
                    &conversation.content,
                    &[],
                    TaskOptions {
                        consecutive_mistake_limit: self.mistake_limit,
                    },
                )
                .await
            {
                Ok(task) => {
                    let task_id = task.task_id();
                    if let Some(client) = self.clients.write().get_mut(&connection_id) {
                        client.current_task_id = Some(task_id.clone());
                    }
                    self.ack(
                        &conversation.session_id,
                        "Task created",
                        json!({
                            "type": "task_created",
                            "taskId": task_id,
                            "originalMessageId": inbound_id.to_string(),
                        }),
                    )
                }
                Err(e) => self.error_ack(&conversation.session_id, &e.to_string(), inbound_id),
            }
        };
        Some(ack)
    }

    /// Handle an inbound `AskResponse`
    pub async fn handle_ask_response(
        &self,
        connection_id: Uuid,
        reply: &AskReply,
        inbound_id: Uuid,
    ) -> WireMessage {
        match self.provider.current_task() {
            Some(task) => {
                if let Err(e) = task
                    .submit_ask_response(reply.response, reply.text.clone(), reply.images.clone())
                    .await
                {
                    return self.error_ack(&reply.session_id, &e.to_string(), inbound_id);
                }
            }
            None => {
                warn!(
                    "Ask response from {} with no active task",
                    connection_id
                );
            }
        }
        self.ack(
            &reply.session_id,
            "Ask response processed",
            json!({
                "type": "ask_response_result",
                "success": true,
                "askResponse": reply.response.as_str(),
                "originalMessageId": inbound_id.to_string(),
            }),
        )
    }

    /// Handle an inbound `TriggerSend`
    pub async fn handle_trigger(
        &self,
        session_id: &str,
        action: TriggerAction,
        inbound_id: Uuid,
    ) -> WireMessage {
        let (result, content, ack_type) = match action {
            TriggerAction::Send => (
                self.provider.trigger_send().await,
                "Send triggered",
                "trigger_result",
            ),
            TriggerAction::Cancel => (
                self.provider.cancel_task().await,
                "Operation cancelled",
                "cancel_result",
            ),
        };
        match result {
            Ok(()) => self.ack(
                session_id,
                content,
                json!({
                    "type": ack_type,
                    "success": true,
                    "originalMessageId": inbound_id.to_string(),
                }),
            ),
            Err(e) => self.error_ack(session_id, &e.to_string(), inbound_id),
        }
    }

    fn ack(&self, session_id: &str, content: &str, metadata: Value) -> WireMessage {
        WireMessage::new(MessageBody::AiConversation(Conversation {
            session_id: session_id.to_string(),
            role: Role::Assistant,
            content: content.to_string(),
            metadata: Some(metadata),
            partial: None,
            stream: None,
        }))
    }

    fn error_ack(&self, session_id: &str, message: &str, inbound_id: Uuid) -> WireMessage {
        self.ack(
            session_id,
            message,
            json!({
                "type": "error",
                "originalMessageId": inbound_id.to_string(),
            }),
        )
    }
}
