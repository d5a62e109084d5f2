use crate::message::{Artifact, Message};
use crate::task::{Task, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status block carried by status updates and task snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// State after the transition.
    pub state: TaskState,
    /// Message attached by the transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
}

impl TaskStatus {
    /// Status block describing the current state of `task`.
    pub fn of(task: &Task) -> Self {
        Self {
            state: task.state(),
            message: task.message().cloned(),
            timestamp: task.updated_at(),
        }
    }
}

/// Emitted whenever a task changes state or reports progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusUpdateEvent {
    /// Task that changed.
    pub task_id: String,
    /// Conversation of the task.
    pub context_id: String,
    /// New status.
    pub status: TaskStatus,
    /// Set on the last event of a stream.
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// Emitted whenever a task gains an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskArtifactUpdateEvent {
    /// Task the artifact belongs to.
    pub task_id: String,
    /// Conversation of the task.
    pub context_id: String,
    /// The artifact added.
    pub artifact: Artifact,
}

/// Event payload, tagged with its wire `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EventPayload {
    /// Status change.
    #[serde(rename = "status-update")]
    StatusUpdate(TaskStatusUpdateEvent),
    /// New artifact.
    #[serde(rename = "artifact-update")]
    ArtifactUpdate(TaskArtifactUpdateEvent),
}

/// Key used to register handlers on the event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    /// [`EventPayload::StatusUpdate`].
    StatusUpdate,
    /// [`EventPayload::ArtifactUpdate`].
    ArtifactUpdate,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::StatusUpdate => write!(f, "status-update"),
            EventType::ArtifactUpdate => write!(f, "artifact-update"),
        }
    }
}

/// A transient event travelling through the [`EventQueue`](crate::EventQueue).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id.
    pub id: Uuid,
    /// What happened.
    pub data: EventPayload,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Event stamped now.
    pub fn new(data: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Kind of payload.
    pub fn event_type(&self) -> EventType {
        match self.data {
            EventPayload::StatusUpdate(_) => EventType::StatusUpdate,
            EventPayload::ArtifactUpdate(_) => EventType::ArtifactUpdate,
        }
    }

    /// Task the event concerns.
    pub fn task_id(&self) -> &str {
        match &self.data {
            EventPayload::StatusUpdate(e) => &e.task_id,
            EventPayload::ArtifactUpdate(e) => &e.task_id,
        }
    }

    /// Whether this is the closing status update of a task stream.
    pub fn is_final(&self) -> bool {
        matches!(&self.data, EventPayload::StatusUpdate(e) if e.is_final)
    }
}
