//! In-process fake host
//!
//! A scripted [`HostProvider`] used by the standalone binary and by the
//! test suite. Tasks record every control call so tests can assert on
//! them, and an optional auto-reply mode streams a canned assistant
//! answer for interactive demos.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    HostError, HostProvider, HostTask, MessageAction, StatusSnapshot, TaskEvent, TaskMessage,
    TaskMessageEvent, TaskMessageKind, TaskOptions,
};
use crate::protocol::{now_millis, AskResponseKind};

/// A recorded `create_task` invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCall {
    pub text: String,
    pub images: Vec<String>,
    pub options: TaskOptions,
}

/// A recorded `submit_ask_response` invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskCall {
    pub response: AskResponseKind,
    pub text: Option<String>,
    pub images: Option<Vec<String>>,
}

/// Scripted task backing the stub provider
pub struct StubTask {
    task_id: String,
    messages: RwLock<Vec<TaskMessage>>,
    events: broadcast::Sender<TaskMessageEvent>,
    ask_calls: Mutex<Vec<AskCall>>,
}

impl StubTask {
    fn new(task_id: String) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            task_id,
            messages: RwLock::new(Vec::new()),
            events,
            ask_calls: Mutex::new(Vec::new()),
        }
    }

    /// Append or supersede a log entry and broadcast the event.
    ///
    /// An `Updated` action replaces the entry with the same logical
    /// identity (explicit id, else timestamp), matching how the host
    /// engine folds streaming deltas.
    pub fn emit(&self, action: MessageAction, message: TaskMessage) {
        {
            let mut log = self.messages.write();
            match action {
                MessageAction::Created => log.push(message.clone()),
                MessageAction::Updated => {
                    let same_identity = |m: &TaskMessage| match (&m.id, &message.id) {
                        (Some(a), Some(b)) => a == b,
                        _ => m.ts == message.ts,
                    };
                    if let Some(existing) = log.iter_mut().find(|m| same_identity(m)) {
                        *existing = message.clone();
                    } else {
                        log.push(message.clone());
                    }
                }
            }
        }
        let _ = self.events.send(TaskMessageEvent { action, message });
    }

    /// Recorded ask responses, oldest first
    pub fn ask_calls(&self) -> Vec<AskCall> {
        self.ask_calls.lock().clone()
    }
}

#[async_trait]
impl HostTask for StubTask {
    fn task_id(&self) -> String {
        self.task_id.clone()
    }

    fn messages(&self) -> Vec<TaskMessage> {
        self.messages.read().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskMessageEvent> {
        self.events.subscribe()
    }

    async fn submit_ask_response(
        &self,
        response: AskResponseKind,
        text: Option<String>,
        images: Option<Vec<String>>,
    ) -> Result<(), HostError> {
        self.ask_calls.lock().push(AskCall {
            response,
            text,
            images,
        });
        Ok(())
    }
}

/// Scripted host provider
pub struct StubProvider {
    tasks: broadcast::Sender<TaskEvent>,
    current: RwLock<Option<Arc<StubTask>>>,
    next_task: AtomicU64,
    create_calls: Mutex<Vec<CreateCall>>,
    trigger_count: AtomicU64,
    cancel_count: AtomicU64,
    status_pushes: Mutex<Vec<StatusSnapshot>>,
    auto_reply: bool,
}

impl StubProvider {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    /// A provider whose tasks stream a canned assistant reply after
    /// creation. Used by the standalone binary so a connected client
    /// sees live traffic.
    pub fn with_auto_reply() -> Arc<Self> {
        Self::build(true)
    }

    fn build(auto_reply: bool) -> Arc<Self> {
        let (tasks, _) = broadcast::channel(16);
        Arc::new(Self {
            tasks,
            current: RwLock::new(None),
            next_task: AtomicU64::new(1),
            create_calls: Mutex::new(Vec::new()),
            trigger_count: AtomicU64::new(0),
            cancel_count: AtomicU64::new(0),
            status_pushes: Mutex::new(Vec::new()),
            auto_reply,
        })
    }

    /// The active task as its concrete stub type
    pub fn current_stub(&self) -> Option<Arc<StubTask>> {
        self.current.read().clone()
    }

    /// Install a pre-built task without going through `create_task`
    pub fn install_task(&self, task_id: &str) -> Arc<StubTask> {
        let task = Arc::new(StubTask::new(task_id.to_string()));
        *self.current.write() = Some(task.clone());
        let _ = self.tasks.send(TaskEvent::Created {
            task_id: task_id.to_string(),
        });
        task
    }

    /// Tear down the active task and broadcast its destruction
    pub fn destroy_current(&self) {
        if let Some(task) = self.current.write().take() {
            let _ = self.tasks.send(TaskEvent::Destroyed {
                task_id: task.task_id.clone(),
            });
        }
    }

    pub fn create_calls(&self) -> Vec<CreateCall> {
        self.create_calls.lock().clone()
    }

    pub fn trigger_count(&self) -> u64 {
        self.trigger_count.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> u64 {
        self.cancel_count.load(Ordering::SeqCst)
    }

    pub fn status_pushes(&self) -> Vec<StatusSnapshot> {
        self.status_pushes.lock().clone()
    }

    fn spawn_auto_reply(task: Arc<StubTask>, prompt: String) {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let ts = now_millis();
            let full = format!("You said: {}", prompt);
            let mut shown = String::new();
            for word in full.split_inclusive(' ') {
                shown.push_str(word);
                task.emit(
                    MessageAction::Updated,
                    TaskMessage {
                        ts,
                        id: None,
                        kind: TaskMessageKind::Say("text".to_string()),
                        text: shown.clone(),
                        partial: true,
                    },
                );
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            task.emit(
                MessageAction::Updated,
                TaskMessage {
                    ts,
                    id: None,
                    kind: TaskMessageKind::Say("completion_result".to_string()),
                    text: full,
                    partial: false,
                },
            );
        });
    }
}

#[async_trait]
impl HostProvider for StubProvider {
    fn subscribe_tasks(&self) -> broadcast::Receiver<TaskEvent> {
        self.tasks.subscribe()
    }

    fn current_task(&self) -> Option<Arc<dyn HostTask>> {
        self.current
            .read()
            .clone()
            .map(|t| t as Arc<dyn HostTask>)
    }

    async fn create_task(
        &self,
        text: &str,
        images: &[String],
        options: TaskOptions,
    ) -> Result<Arc<dyn HostTask>, HostError> {
        let seq = self.next_task.fetch_add(1, Ordering::SeqCst);
        let task_id = format!("task-{}", seq);
        debug!("Stub host: creating {}", task_id);

        self.create_calls.lock().push(CreateCall {
            text: text.to_string(),
            images: images.to_vec(),
            options,
        });

        let task = Arc::new(StubTask::new(task_id.clone()));
        *self.current.write() = Some(task.clone());
        let _ = self.tasks.send(TaskEvent::Created { task_id });

        if self.auto_reply {
            Self::spawn_auto_reply(task.clone(), text.to_string());
        }

        Ok(task as Arc<dyn HostTask>)
    }

    async fn trigger_send(&self) -> Result<(), HostError> {
        self.trigger_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cancel_task(&self) -> Result<(), HostError> {
        self.cancel_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn push_status(&self, status: StatusSnapshot) {
        self.status_pushes.lock().push(status);
    }
}
