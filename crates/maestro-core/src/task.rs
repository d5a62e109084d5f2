use crate::error::{MaestroError, MaestroResult};
use crate::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, not yet picked up.
    Pending,
    /// Being worked on.
    Working,
    /// Paused until the client supplies more input.
    InputRequired,
    /// Finished successfully (terminal).
    Completed,
    /// Finished with an error (terminal).
    Failed,
    /// Cancelled by the client (terminal).
    Cancelled,
}

impl TaskState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Whether `self -> target` is an edge of the lifecycle.
    pub fn can_transition_to(self, target: TaskState) -> bool {
        use TaskState::*;
        match self {
            Pending => matches!(target, Working | Failed | Cancelled),
            // Working -> Working is a progress update with a new message.
            Working => matches!(
                target,
                Working | InputRequired | Completed | Failed | Cancelled
            ),
            InputRequired => matches!(target, Working | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Working => write!(f, "working"),
            TaskState::InputRequired => write!(f, "input_required"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A unit of work tracked through the lifecycle.
///
/// The state can only be changed through [`TaskStateMachine::transition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    id: String,
    context_id: String,
    state: TaskState,
    message: Option<Message>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Task {
    /// Creates a pending task in a fresh context.
    pub fn new() -> Self {
        Self::with_context(Uuid::new_v4().to_string())
    }

    /// Creates a pending task in the given context.
    pub fn with_context(context_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            context_id: context_id.into(),
            state: TaskState::Pending,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Unique task id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Conversation the task belongs to.
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// The message attached by the latest transition.
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the latest transition.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Whether the task reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

/// Validates and applies lifecycle transitions.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Move `task` to `target`, replacing its message.
    ///
    /// Fails with [`MaestroError::InvalidStateTransition`] on an illegal edge,
    /// leaving the task untouched.
    pub fn transition(
        task: &mut Task,
        target: TaskState,
        message: Option<Message>,
    ) -> MaestroResult<()> {
        if !task.state.can_transition_to(target) {
            return Err(MaestroError::InvalidStateTransition {
                from: task.state,
                to: target,
            });
        }
        task.state = target;
        task.message = message;
        task.updated_at = Utc::now();
        Ok(())
    }
}
