//! Core types for the Maestro orchestration engine.
//!
//! This crate holds everything a single task needs while it is being driven:
//! the lifecycle state machine, the bounded event queue that decouples agent
//! execution from transport, and the task-scoped updater that turns progress
//! into transitions and artifacts.
//!
//! # Main types
//!
//! - [`MaestroError`]: Unified error enum for all Maestro subsystems.
//! - [`MaestroResult`]: Convenience alias for `Result<T, MaestroError>`.
//! - [`Task`] / [`TaskState`] / [`TaskStateMachine`]: Lifecycle and legal transitions.
//! - [`Message`] / [`Part`] / [`Artifact`]: Content exchanged with clients and workers.
//! - [`Event`]: Status and artifact updates flowing through the [`EventQueue`].
//! - [`TaskUpdater`]: Task-scoped façade emitting events for every change.

/// Error taxonomy shared by every crate.
pub mod error;
/// Status and artifact update events.
pub mod event;
/// Messages, parts and artifacts.
pub mod message;
/// Bounded async event queue.
pub mod queue;
/// Task lifecycle and state machine.
pub mod task;
/// Task-scoped update façade.
pub mod updater;

pub use error::{MaestroError, MaestroResult};
pub use event::{
    Event, EventPayload, EventType, TaskArtifactUpdateEvent, TaskStatus, TaskStatusUpdateEvent,
};
pub use message::{Artifact, Message, Metadata, Part, Role};
pub use queue::{EventHandler, EventQueue, DEFAULT_POLL_INTERVAL, DEFAULT_QUEUE_CAPACITY};
pub use task::{Task, TaskState, TaskStateMachine};
pub use updater::{TaskRecord, TaskUpdater};
