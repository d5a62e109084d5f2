use maestro_core::{EventQueue, MaestroError, MaestroResult, TaskRecord, TaskState, TaskUpdater};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Finished tasks kept for `tasks/get` when no bound is given.
pub const DEFAULT_MAX_FINISHED_TASKS: usize = 1000;

/// A live task: its updater and the token that cancels its run.
#[derive(Clone)]
pub struct TaskEntry {
    /// Updater of the current (or last) run.
    pub updater: Arc<TaskUpdater>,
    /// Cancels the current run.
    pub cancel: CancellationToken,
}

impl TaskEntry {
    /// Paused with its final event out, and not yet taken by a resume.
    fn is_resumable(&self) -> bool {
        self.updater.state() == TaskState::InputRequired && self.updater.is_finalized()
    }
}

/// Task registry backing `tasks/get` and `tasks/cancel`.
///
/// Live tasks are never evicted. Once more than `max_finished` tasks are in a
/// terminal state, the least recently updated ones are dropped along with
/// their event queues.
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<String, TaskEntry>>,
    max_finished: usize,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::with_retention(DEFAULT_MAX_FINISHED_TASKS)
    }
}

impl InMemoryTaskStore {
    /// Store keeping [`DEFAULT_MAX_FINISHED_TASKS`] finished tasks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store keeping at most `max_finished` finished tasks.
    pub fn with_retention(max_finished: usize) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            max_finished,
        }
    }

    /// Insert or replace the entry for the updater's task.
    pub fn insert(&self, updater: Arc<TaskUpdater>, cancel: CancellationToken) {
        let id = updater.task_id().to_string();
        let mut tasks = self.tasks.write();
        tasks.insert(id, TaskEntry { updater, cancel });
        self.evict_finished(&mut tasks);
    }

    /// Hand a paused task to exactly one resuming caller.
    ///
    /// The paused entry is swapped for a fresh run under the write lock, so a
    /// concurrent resume of the same task sees the claimed entry and fails
    /// with [`MaestroError::InvalidStateTransition`].
    pub fn claim_for_resume(
        &self,
        task_id: &str,
        queue: Arc<EventQueue>,
    ) -> MaestroResult<TaskEntry> {
        let mut tasks = self.tasks.write();
        let paused = tasks
            .get(task_id)
            .ok_or_else(|| MaestroError::TaskNotFound(task_id.to_string()))?;
        if !paused.is_resumable() {
            return Err(MaestroError::InvalidStateTransition {
                from: paused.updater.state(),
                to: TaskState::Working,
            });
        }
        let resumed = TaskEntry {
            updater: Arc::new(TaskUpdater::resume(paused.updater.snapshot(), queue)?),
            cancel: CancellationToken::new(),
        };
        tasks.insert(task_id.to_string(), resumed.clone());
        debug!(task_id = %task_id, "Paused task claimed for resume");
        Ok(resumed)
    }

    /// Entry for `task_id`.
    pub fn get(&self, task_id: &str) -> Option<TaskEntry> {
        self.tasks.read().get(task_id).cloned()
    }

    /// Current record of `task_id`.
    pub fn snapshot(&self, task_id: &str) -> Option<TaskRecord> {
        self.get(task_id).map(|entry| entry.updater.snapshot())
    }

    /// Drop a task.
    pub fn remove(&self, task_id: &str) -> Option<TaskEntry> {
        self.tasks.write().remove(task_id)
    }

    /// Number of tracked tasks.
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    /// Whether no task is tracked.
    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    fn evict_finished(&self, tasks: &mut HashMap<String, TaskEntry>) {
        let mut finished: Vec<_> = tasks
            .iter()
            .map(|(id, entry)| (id, entry.updater.task()))
            .filter(|(_, task)| task.is_terminal())
            .map(|(id, task)| (task.updated_at(), id.clone()))
            .collect();
        if finished.len() <= self.max_finished {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.max_finished;
        for (_, id) in finished.into_iter().take(excess) {
            tasks.remove(&id);
            debug!(task_id = %id, "Evicted finished task");
        }
    }
}
