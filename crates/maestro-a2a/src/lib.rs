//! Agent-to-agent transport for Maestro.
//!
//! Provides the JSON-RPC 2.0 wire types, an axum server that runs an
//! [`AgentExecutor`] per task (with SSE streaming), the in-memory task store
//! behind `tasks/get` and `tasks/cancel`, and the per-destination
//! [`ConnectionPool`]. With the `client` feature it also provides the reqwest
//! based [`RemoteAgentClient`] used to call worker agents.

/// Reqwest worker client.
#[cfg(feature = "client")]
pub mod client;
/// Per-destination connection pool.
pub mod pool;
/// JSON-RPC 2.0 wire types.
pub mod protocol;
/// Axum JSON-RPC/SSE server.
pub mod server;
/// In-memory task registry.
pub mod store;

#[cfg(feature = "client")]
pub use client::{ClientConfig, HttpSessionFactory, RemoteAgentClient, WorkerEndpoint};
pub use pool::{ConnectionInfo, ConnectionPool, PoolConfig, PoolStats, SessionFactory, Target};
pub use protocol::{
    error_codes, methods, JsonRpcError, JsonRpcRequest, JsonRpcResponse, MessageSendParams,
    SendConfiguration, TaskIdParams, TaskSnapshot,
};
pub use server::{A2aServer, AgentExecutor, AppState, RequestContext, ServerConfig};
pub use store::{InMemoryTaskStore, TaskEntry, DEFAULT_MAX_FINISHED_TASKS};
