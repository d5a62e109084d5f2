use crate::error::{MaestroError, MaestroResult};
use crate::event::{Event, EventPayload, TaskArtifactUpdateEvent, TaskStatus, TaskStatusUpdateEvent};
use crate::message::{Artifact, Message, Metadata, Part};
use crate::queue::EventQueue;
use crate::task::{Task, TaskState, TaskStateMachine};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// A task together with the artifacts it accumulated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// The task.
    pub task: Task,
    /// Its artifacts, in insertion order.
    pub artifacts: Vec<Artifact>,
}

struct UpdaterState {
    task: Task,
    artifacts: Vec<Artifact>,
    finalized: bool,
}

/// Task-scoped façade that turns progress into transitions and events.
///
/// The local artifact list is authoritative: [`TaskUpdater::artifacts`]
/// never depends on what the queue consumer does with the emitted events.
pub struct TaskUpdater {
    queue: Arc<EventQueue>,
    task_id: String,
    context_id: String,
    state: Mutex<UpdaterState>,
    // Serializes emission so events leave in the order transitions happened.
    emit_lock: tokio::sync::Mutex<()>,
}

impl TaskUpdater {
    /// Wrap a task that has not been picked up yet.
    pub fn new(task: Task, queue: Arc<EventQueue>) -> Self {
        Self::from_record(
            TaskRecord {
                task,
                artifacts: Vec::new(),
            },
            queue,
        )
    }

    /// Continue a task that is waiting for input.
    ///
    /// Fails unless the task is `input_required`; the caller is expected to
    /// move it back to `working` with [`TaskUpdater::start_work`].
    pub fn resume(record: TaskRecord, queue: Arc<EventQueue>) -> MaestroResult<Self> {
        let state = record.task.state();
        if state != TaskState::InputRequired {
            return Err(MaestroError::InvalidStateTransition {
                from: state,
                to: TaskState::Working,
            });
        }
        Ok(Self::from_record(record, queue))
    }

    fn from_record(record: TaskRecord, queue: Arc<EventQueue>) -> Self {
        Self {
            queue,
            task_id: record.task.id().to_string(),
            context_id: record.task.context_id().to_string(),
            state: Mutex::new(UpdaterState {
                finalized: record.task.is_terminal(),
                task: record.task,
                artifacts: record.artifacts,
            }),
            emit_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Id of the task.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Conversation of the task.
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.state.lock().task.state()
    }

    /// Whether the final update was already emitted.
    pub fn is_finalized(&self) -> bool {
        self.state.lock().finalized
    }

    /// Copy of the task as it is now.
    pub fn task(&self) -> Task {
        self.state.lock().task.clone()
    }

    /// Artifacts in insertion order.
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.state.lock().artifacts.clone()
    }

    /// Copy of the task and its artifacts.
    pub fn snapshot(&self) -> TaskRecord {
        let inner = self.state.lock();
        TaskRecord {
            task: inner.task.clone(),
            artifacts: inner.artifacts.clone(),
        }
    }

    /// Validate and apply a transition, then emit a status update.
    ///
    /// Terminal states always produce a final event. Once a final event has
    /// been emitted every further status update fails.
    pub async fn update_status(
        &self,
        state: TaskState,
        message: Option<Message>,
        is_final: bool,
    ) -> MaestroResult<()> {
        let _emit = self.emit_lock.lock().await;
        let event = {
            let mut inner = self.state.lock();
            if inner.finalized {
                return Err(MaestroError::InvalidStateTransition {
                    from: inner.task.state(),
                    to: state,
                });
            }
            TaskStateMachine::transition(&mut inner.task, state, message)?;
            let is_final = is_final || state.is_terminal();
            inner.finalized = is_final;
            self.status_event(&inner.task, is_final)
        };
        debug!(task_id = %self.task_id, state = %state, "Task status updated");
        self.queue.enqueue(event).await
    }

    /// Append an artifact and emit an artifact update.
    pub async fn add_artifact(
        &self,
        parts: Vec<Part>,
        name: impl Into<String>,
        metadata: Metadata,
    ) -> MaestroResult<Artifact> {
        let _emit = self.emit_lock.lock().await;
        let (artifact, event) = {
            let mut inner = self.state.lock();
            if inner.finalized {
                return Err(MaestroError::TaskFinalized(self.task_id.clone()));
            }
            let artifact = Artifact::new(name, parts, metadata);
            inner.artifacts.push(artifact.clone());
            let event = Event::new(EventPayload::ArtifactUpdate(TaskArtifactUpdateEvent {
                task_id: self.task_id.clone(),
                context_id: self.context_id.clone(),
                artifact: artifact.clone(),
            }));
            (artifact, event)
        };
        debug!(task_id = %self.task_id, artifact = %artifact.name, "Artifact added");
        self.queue.enqueue(event).await?;
        Ok(artifact)
    }

    /// Move to (or stay in) `working` with a progress message.
    pub async fn start_work(&self, message: impl Into<String>) -> MaestroResult<()> {
        let message = self.agent_message(message);
        self.update_status(TaskState::Working, Some(message), false)
            .await
    }

    /// Pause the task until the client answers `question`.
    pub async fn request_input(&self, question: impl Into<String>) -> MaestroResult<()> {
        let message = self.agent_message(question);
        self.update_status(TaskState::InputRequired, Some(message), true)
            .await
    }

    /// Complete with a generic message.
    pub async fn complete(&self) -> MaestroResult<()> {
        self.complete_with_message("Task completed").await
    }

    /// Complete with `text` as the final message.
    pub async fn complete_with_message(&self, text: impl Into<String>) -> MaestroResult<()> {
        let message = self.agent_message(text);
        self.update_status(TaskState::Completed, Some(message), true)
            .await?;
        info!(task_id = %self.task_id, "Task completed");
        Ok(())
    }

    /// Mark the task failed with a readable cause.
    pub async fn fail(&self, error: impl std::fmt::Display) -> MaestroResult<()> {
        let message = self.agent_message(format!("Task failed: {error}"));
        self.update_status(TaskState::Failed, Some(message), true)
            .await?;
        info!(task_id = %self.task_id, error = %error, "Task failed");
        Ok(())
    }

    /// Record cancellation immediately, then emit the final event.
    ///
    /// Unlike other updates this does not wait behind an emission blocked on
    /// a full queue before the state changes.
    pub async fn cancel(&self) -> MaestroResult<()> {
        let event = {
            let mut inner = self.state.lock();
            let message = self.agent_message("Task cancelled");
            TaskStateMachine::transition(&mut inner.task, TaskState::Cancelled, Some(message))?;
            inner.finalized = true;
            self.status_event(&inner.task, true)
        };
        info!(task_id = %self.task_id, "Task cancelled");
        let _emit = self.emit_lock.lock().await;
        self.queue.enqueue(event).await
    }

    fn agent_message(&self, text: impl Into<String>) -> Message {
        Message::agent(text).for_task(&self.task_id, &self.context_id)
    }

    fn status_event(&self, task: &Task, is_final: bool) -> Event {
        Event::new(EventPayload::StatusUpdate(TaskStatusUpdateEvent {
            task_id: self.task_id.clone(),
            context_id: self.context_id.clone(),
            status: TaskStatus::of(task),
            is_final,
        }))
    }
}
