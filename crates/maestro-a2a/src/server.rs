use crate::protocol::*;
use crate::store::InMemoryTaskStore;
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use maestro_core::{
    Event, EventQueue, MaestroError, MaestroResult, Message, Metadata, Task, TaskState,
    TaskUpdater, DEFAULT_POLL_INTERVAL, DEFAULT_QUEUE_CAPACITY,
};
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything an executor needs to know about the request it serves.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Incoming message.
    pub message: Message,
    /// Task being served.
    pub task_id: String,
    /// Conversation of the task.
    pub context_id: String,
    /// True when the message answers an `input_required` task.
    pub resumed: bool,
    /// Caller-supplied deadline for the whole task.
    pub timeout: Option<Duration>,
    /// Caller metadata from the request.
    pub metadata: Option<Metadata>,
}

/// Drives one task from `working` to a final state.
///
/// The server moves the task to `working` before calling [`execute`] and
/// finalizes it afterwards if the executor did not: `Ok` completes the task,
/// `Err` fails it with the error's client message.
///
/// [`execute`]: AgentExecutor::execute
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run the task. The updater is already in `working`.
    async fn execute(
        &self,
        ctx: RequestContext,
        updater: Arc<TaskUpdater>,
        cancel: CancellationToken,
    ) -> MaestroResult<()>;
}

/// Per-task queue settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bound of each task's event queue.
    pub queue_capacity: usize,
    /// How often an idle queue consumer checks for shutdown.
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Shared application state.
pub struct AppState {
    /// Runs every task.
    pub executor: Arc<dyn AgentExecutor>,
    /// Live and recently finished tasks.
    pub store: Arc<InMemoryTaskStore>,
    /// Queue settings.
    pub config: ServerConfig,
}

/// JSON-RPC agent server.
pub struct A2aServer;

impl A2aServer {
    /// Build the router: `POST /` for JSON-RPC, `GET /health`.
    pub fn build(
        executor: Arc<dyn AgentExecutor>,
        store: Arc<InMemoryTaskStore>,
        config: ServerConfig,
    ) -> Router {
        let state = Arc::new(AppState {
            executor,
            store,
            config,
        });

        Router::new()
            .route("/", post(rpc_handler))
            .route("/health", get(health_handler))
            .with_state(state)
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "maestro",
        "tasks": state.store.len(),
    }))
}

fn rpc_ok(id: Value, result: impl serde::Serialize) -> Response {
    match serde_json::to_value(result) {
        Ok(value) => Json(JsonRpcResponse::success(id, value)).into_response(),
        Err(e) => rpc_err(id, JsonRpcError::from(&MaestroError::from(e))),
    }
}

fn rpc_err(id: Value, error: JsonRpcError) -> Response {
    Json(JsonRpcResponse::failure(id, error)).into_response()
}

async fn rpc_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let raw: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return rpc_err(Value::Null, JsonRpcError::parse_error()),
    };
    let id = raw.get("id").cloned().unwrap_or(Value::Null);
    let request: JsonRpcRequest = match serde_json::from_value(raw) {
        Ok(r) => r,
        Err(e) => return rpc_err(id, JsonRpcError::invalid_request(e)),
    };
    if request.jsonrpc != "2.0" {
        return rpc_err(id, JsonRpcError::invalid_request("jsonrpc must be \"2.0\""));
    }

    debug!(method = %request.method, "JSON-RPC request");
    let params = request.params.unwrap_or(Value::Null);
    match request.method.as_str() {
        methods::MESSAGE_SEND => match serde_json::from_value(params) {
            Ok(p) => handle_send(state, id, p).await,
            Err(e) => rpc_err(id, JsonRpcError::invalid_params(e)),
        },
        methods::MESSAGE_STREAM => match serde_json::from_value(params) {
            Ok(p) => handle_stream(state, id, p),
            Err(e) => rpc_err(id, JsonRpcError::invalid_params(e)),
        },
        methods::TASKS_GET => match serde_json::from_value::<TaskIdParams>(params) {
            Ok(p) => match state.store.snapshot(&p.id) {
                Some(record) => rpc_ok(id, TaskSnapshot::from(&record)),
                None => rpc_err(id, JsonRpcError::from(&MaestroError::TaskNotFound(p.id))),
            },
            Err(e) => rpc_err(id, JsonRpcError::invalid_params(e)),
        },
        methods::TASKS_CANCEL => match serde_json::from_value::<TaskIdParams>(params) {
            Ok(p) => handle_cancel(&state, id, &p.id).await,
            Err(e) => rpc_err(id, JsonRpcError::invalid_params(e)),
        },
        other => rpc_err(id, JsonRpcError::method_not_found(other)),
    }
}

/// A task ready to run: registered in the store, queue not yet started.
struct PreparedRun {
    updater: Arc<TaskUpdater>,
    queue: Arc<EventQueue>,
    cancel: CancellationToken,
    ctx: RequestContext,
}

fn prepare(state: &AppState, params: MessageSendParams) -> MaestroResult<PreparedRun> {
    let queue = Arc::new(EventQueue::with_poll_interval(
        state.config.queue_capacity,
        state.config.poll_interval,
    ));

    let (updater, cancel, resumed) = match params.message.task_id.as_deref() {
        Some(task_id) => {
            let entry = state.store.claim_for_resume(task_id, queue.clone())?;
            (entry.updater, entry.cancel, true)
        }
        None => {
            let task = match params.message.context_id.as_deref() {
                Some(context_id) => Task::with_context(context_id),
                None => Task::new(),
            };
            let updater = Arc::new(TaskUpdater::new(task, queue.clone()));
            let cancel = CancellationToken::new();
            state.store.insert(updater.clone(), cancel.clone());
            (updater, cancel, false)
        }
    };

    let ctx = RequestContext {
        task_id: updater.task_id().to_string(),
        context_id: updater.context_id().to_string(),
        message: params.message,
        resumed,
        timeout: params
            .configuration
            .and_then(|c| c.timeout_ms)
            .map(Duration::from_millis),
        metadata: params.metadata,
    };
    info!(task_id = %ctx.task_id, resumed, "Task accepted");

    Ok(PreparedRun {
        updater,
        queue,
        cancel,
        ctx,
    })
}

async fn handle_send(state: Arc<AppState>, id: Value, params: MessageSendParams) -> Response {
    let run = match prepare(&state, params) {
        Ok(run) => run,
        Err(e) => return rpc_err(id, JsonRpcError::from(&e)),
    };
    if let Err(e) = run.queue.start() {
        return rpc_err(id, JsonRpcError::from(&e));
    }
    let updater = run.updater.clone();

    // Spawned so a disconnecting client does not abort the task midway.
    let handle = tokio::spawn(drive(state.executor.clone(), run));
    if let Err(e) = handle.await {
        error!(task_id = %updater.task_id(), error = %e, "Task runner panicked");
        return rpc_err(
            id,
            JsonRpcError::from(&MaestroError::Analysis("task runner panicked".into())),
        );
    }
    rpc_ok(id, TaskSnapshot::from(&updater.snapshot()))
}

fn handle_stream(state: Arc<AppState>, id: Value, params: MessageSendParams) -> Response {
    let run = match prepare(&state, params) {
        Ok(run) => run,
        Err(e) => return rpc_err(id, JsonRpcError::from(&e)),
    };
    let events = run.queue.subscribe();
    if let Err(e) = run.queue.start() {
        return rpc_err(id, JsonRpcError::from(&e));
    }
    tokio::spawn(drive(state.executor.clone(), run));

    Sse::new(event_stream(events, id))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// SSE frames for one task, ending after the first final status update.
fn event_stream(
    events: mpsc::UnboundedReceiver<Event>,
    id: Value,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    stream::unfold((events, false), move |(mut events, done)| {
        let id = id.clone();
        async move {
            if done {
                return None;
            }
            let event = events.recv().await?;
            let is_final = event.is_final();
            let frame = match serde_json::to_value(&event.data) {
                Ok(result) => SseEvent::default()
                    .json_data(JsonRpcResponse::success(id, result))
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "Failed to encode SSE frame");
                        SseEvent::default().comment("encoding error")
                    }),
                Err(e) => {
                    warn!(error = %e, "Failed to serialize event");
                    SseEvent::default().comment("encoding error")
                }
            };
            Some((Ok(frame), (events, is_final)))
        }
    })
}

async fn handle_cancel(state: &AppState, id: Value, task_id: &str) -> Response {
    let Some(entry) = state.store.get(task_id) else {
        return rpc_err(
            id,
            JsonRpcError::from(&MaestroError::TaskNotFound(task_id.to_string())),
        );
    };
    if entry.updater.state().is_terminal() {
        return rpc_err(id, JsonRpcError::task_not_cancelable(task_id));
    }

    match entry.updater.cancel().await {
        // A paused task has no running queue; the state change still stands.
        Ok(()) | Err(MaestroError::QueueClosed) => {}
        Err(MaestroError::InvalidStateTransition { .. }) => {
            return rpc_err(id, JsonRpcError::task_not_cancelable(task_id));
        }
        Err(e) => return rpc_err(id, JsonRpcError::from(&e)),
    }
    entry.cancel.cancel();
    info!(task_id = %task_id, "Task cancelled by client");
    rpc_ok(id, TaskSnapshot::from(&entry.updater.snapshot()))
}

/// Run the executor and make sure the task ends in a final state.
async fn drive(executor: Arc<dyn AgentExecutor>, run: PreparedRun) {
    let PreparedRun {
        updater,
        queue,
        cancel,
        ctx,
    } = run;
    let task_id = ctx.task_id.clone();
    let timeout = ctx.timeout;

    let accepted = if ctx.resumed {
        "Resuming with new input"
    } else {
        "Task accepted"
    };
    if let Err(e) = updater.start_work(accepted).await {
        warn!(task_id = %task_id, error = %e, "Task could not start");
        queue.stop().await;
        return;
    }

    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        result = executor.execute(ctx, updater.clone(), cancel.clone()) => result,
        _ = cancel.cancelled() => Err(MaestroError::Cancelled),
        _ = deadline => Err(MaestroError::AnalysisTimeout {
            analysis: "request".to_string(),
            timeout_ms: timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
        }),
    };

    if !updater.is_finalized() {
        let finalized = match &outcome {
            Ok(()) => updater.complete().await,
            Err(MaestroError::Cancelled) => updater.cancel().await,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Executor failed");
                updater.fail(e.client_message()).await
            }
        };
        if let Err(e) = finalized {
            debug!(task_id = %task_id, error = %e, "Task already finalized elsewhere");
        }
    }

    queue.stop().await;
    debug!(task_id = %task_id, state = %updater.state(), "Task run finished");
    if updater.state() == TaskState::InputRequired {
        info!(task_id = %task_id, "Task waiting for input");
    }
}
