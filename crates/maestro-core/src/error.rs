use crate::task::TaskState;
use thiserror::Error;

/// A convenience `Result` alias using [`MaestroError`].
pub type MaestroResult<T> = Result<T, MaestroError>;

/// Top-level error type for the Maestro orchestration engine.
#[derive(Error, Debug)]
pub enum MaestroError {
    /// An edge that the task lifecycle does not allow.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// State the task was in.
        from: TaskState,
        /// State that was requested.
        to: TaskState,
    },

    /// The task already emitted its final update.
    #[error("Task {0} is finalized")]
    TaskFinalized(String),

    /// No usable session to a remote worker.
    #[error("Connection unavailable: {0}")]
    ConnectionUnavailable(String),

    /// A single analysis did not finish within its timeout.
    #[error("Analysis '{analysis}' timed out after {timeout_ms}ms")]
    AnalysisTimeout {
        /// Analysis that timed out.
        analysis: String,
        /// Timeout that was applied.
        timeout_ms: u64,
    },

    /// The synthesized result did not pass the quality gate.
    #[error("Quality gate rejected: {0}")]
    QualityGateRejected(String),

    /// The transport or peer does not support the requested operation.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// No task with the given id.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// The event queue no longer accepts events.
    #[error("Event queue closed")]
    QueueClosed,

    /// Event queue failure other than closing.
    #[error("Queue error: {0}")]
    Queue(String),

    /// An analysis provider reported a failure.
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// Malformed JSON-RPC traffic or an error returned by a peer.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid or unreadable configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Non-success HTTP status from a worker.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The root task was cancelled.
    #[error("Task cancelled")]
    Cancelled,

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MaestroError {
    /// Human-readable message safe to hand to a client.
    ///
    /// Transport, serialization and I/O details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            MaestroError::InvalidStateTransition { from, to } => {
                format!("The task cannot move from {from} to {to}")
            }
            MaestroError::TaskFinalized(_) => "The task has already finished".to_string(),
            MaestroError::ConnectionUnavailable(_) | MaestroError::Http(_) => {
                "A worker agent could not be reached".to_string()
            }
            MaestroError::AnalysisTimeout { analysis, .. } => {
                format!("The '{analysis}' analysis took too long to respond")
            }
            MaestroError::QualityGateRejected(reason) => {
                format!("The result did not meet the quality bar: {reason}")
            }
            MaestroError::UnsupportedOperation(op) => format!("Unsupported operation: {op}"),
            MaestroError::TaskNotFound(id) => format!("Task {id} was not found"),
            MaestroError::Cancelled => "The task was cancelled".to_string(),
            MaestroError::Analysis(reason) => format!("Analysis failed: {reason}"),
            MaestroError::Config(_) => "The orchestrator is misconfigured".to_string(),
            MaestroError::QueueClosed
            | MaestroError::Queue(_)
            | MaestroError::Protocol(_)
            | MaestroError::Serialization(_)
            | MaestroError::Io(_) => "An internal error interrupted the task".to_string(),
        }
    }

    /// Whether the error should abort the whole task rather than one analysis.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            MaestroError::ConnectionUnavailable(_)
                | MaestroError::AnalysisTimeout { .. }
                | MaestroError::QualityGateRejected(_)
                | MaestroError::Analysis(_)
                | MaestroError::Http(_)
        )
    }
}
