//! Host editor integration seam
//!
//! The bridge never talks to the editor directly; it consumes a
//! [`HostProvider`] handle that exposes the AI task engine: task
//! lifecycle events, the current task's message log, and the four
//! control operations (create task, answer pending prompt, trigger
//! send, cancel). The in-process stub in [`stub`] implements the same
//! traits for standalone runs and tests.

pub mod stub;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::AskResponseKind;

/// Errors surfaced by host operations
#[derive(Debug, Clone)]
pub enum HostError {
    /// No task is currently active
    NoActiveTask,
    /// The host task engine rejected or failed the operation
    TaskFailed(String),
    /// The provider handle is gone (editor shutting down)
    Unavailable(String),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::NoActiveTask => write!(f, "no active task"),
            HostError::TaskFailed(msg) => write!(f, "task operation failed: {}", msg),
            HostError::Unavailable(msg) => write!(f, "host unavailable: {}", msg),
        }
    }
}

impl std::error::Error for HostError {}

/// The two top-level kinds of task message: a blocking prompt waiting
/// for a user answer, or a non-blocking utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskMessageKind {
    Ask(String),
    Say(String),
}

/// One entry of a task's message log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    /// Millisecond timestamp, doubles as the logical message identity
    pub ts: u64,
    /// Explicit identity when the host assigns one
    pub id: Option<String>,
    pub kind: TaskMessageKind,
    pub text: String,
    /// Streaming delta that a later update with the same identity
    /// supersedes
    pub partial: bool,
}

impl TaskMessage {
    pub fn say(ts: u64, say_type: &str, text: &str, partial: bool) -> Self {
        Self {
            ts,
            id: None,
            kind: TaskMessageKind::Say(say_type.to_string()),
            text: text.to_string(),
            partial,
        }
    }

    pub fn ask(ts: u64, ask_type: &str, text: &str) -> Self {
        Self {
            ts,
            id: None,
            kind: TaskMessageKind::Ask(ask_type.to_string()),
            text: text.to_string(),
            partial: false,
        }
    }
}

/// Whether a message event introduces a new log entry or supersedes one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageAction {
    Created,
    Updated,
}

/// A created/updated event on a task's message stream
#[derive(Debug, Clone)]
pub struct TaskMessageEvent {
    pub action: MessageAction,
    pub message: TaskMessage,
}

/// Task lifecycle events from the provider
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Created { task_id: String },
    Destroyed { task_id: String },
}

/// Options for task creation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOptions {
    /// `None` means unbounded: a remote client is a trusted driver whose
    /// session must not be terminated by the host's anti-runaway
    /// heuristic.
    pub consecutive_mistake_limit: Option<u64>,
}

/// Connection summary included in status pushes to the host UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: Uuid,
    pub client_type: String,
    pub version: String,
}

/// Snapshot pushed to the host UI after every connect/disconnect
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusSnapshot {
    pub running: bool,
    pub websocket_port: Option<u16>,
    pub discovery_port: Option<u16>,
    pub connections: Vec<ClientInfo>,
}

/// One conversation session inside the host's AI engine
#[async_trait]
pub trait HostTask: Send + Sync {
    fn task_id(&self) -> String;

    /// Ordered snapshot of the task's message log
    fn messages(&self) -> Vec<TaskMessage>;

    /// Subscribe to created/updated events on the message stream
    fn subscribe(&self) -> broadcast::Receiver<TaskMessageEvent>;

    /// Answer the currently-pending prompt
    async fn submit_ask_response(
        &self,
        response: AskResponseKind,
        text: Option<String>,
        images: Option<Vec<String>>,
    ) -> Result<(), HostError>;
}

/// Handle to the host editor's AI task engine
#[async_trait]
pub trait HostProvider: Send + Sync {
    /// Subscribe to task lifecycle events
    fn subscribe_tasks(&self) -> broadcast::Receiver<TaskEvent>;

    /// The single active task, if any
    fn current_task(&self) -> Option<Arc<dyn HostTask>>;

    /// Start a new task from user text and images
    async fn create_task(
        &self,
        text: &str,
        images: &[String],
        options: TaskOptions,
    ) -> Result<Arc<dyn HostTask>, HostError>;

    /// Trigger the host's default action for the composed input
    async fn trigger_send(&self) -> Result<(), HostError>;

    /// Cancel the current operation
    async fn cancel_task(&self) -> Result<(), HostError>;

    /// Push a connection status snapshot to the host UI
    fn push_status(&self, status: StatusSnapshot);
}
