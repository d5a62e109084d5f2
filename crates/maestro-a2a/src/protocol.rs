//! Agent-to-agent JSON-RPC 2.0 message types.

use maestro_core::{Artifact, MaestroError, Message, Metadata, TaskRecord, TaskStatus};
use serde::{Deserialize, Serialize};

/// JSON-RPC method names served and called by Maestro agents.
pub mod methods {
    /// Send a message and wait for the final task.
    pub const MESSAGE_SEND: &str = "message/send";
    /// Send a message and receive status/artifact events over SSE.
    pub const MESSAGE_STREAM: &str = "message/stream";
    /// Fetch a task snapshot.
    pub const TASKS_GET: &str = "tasks/get";
    /// Cancel a running task.
    pub const TASKS_CANCEL: &str = "tasks/cancel";
}

/// JSON-RPC and agent-protocol error codes.
pub mod error_codes {
    /// Invalid JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// Not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// Unknown method.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Params do not match the method.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Server-side failure.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// No task with that id.
    pub const TASK_NOT_FOUND: i64 = -32001;
    /// The task already reached a terminal state.
    pub const TASK_NOT_CANCELABLE: i64 = -32002;
    /// The agent does not implement the operation.
    pub const UNSUPPORTED_OPERATION: i64 = -32004;
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Echoed back in the response.
    #[serde(default)]
    pub id: serde_json::Value,
    /// Method name, see [`methods`].
    pub method: String,
    /// Method params.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Request with a numeric id.
    pub fn new(id: u64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: serde_json::Value::from(id),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Id of the request answered.
    #[serde(default)]
    pub id: serde_json::Value,
    /// Set on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Set on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Successful response.
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response.
    pub fn failure(id: serde_json::Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// One of [`error_codes`] or an implementation-defined code.
    pub code: i64,
    /// Human readable description.
    pub message: String,
    /// Extra detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    /// Error with no data.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Body could not be parsed as JSON.
    pub fn parse_error() -> Self {
        Self::new(error_codes::PARSE_ERROR, "Parse error")
    }

    /// Body is JSON but not a request.
    pub fn invalid_request(detail: impl std::fmt::Display) -> Self {
        Self::new(
            error_codes::INVALID_REQUEST,
            format!("Invalid request: {detail}"),
        )
    }

    /// No handler for `method`.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    /// Params failed to deserialize.
    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(
            error_codes::INVALID_PARAMS,
            format!("Invalid params: {detail}"),
        )
    }

    /// Cancel on a finished task.
    pub fn task_not_cancelable(id: &str) -> Self {
        Self::new(
            error_codes::TASK_NOT_CANCELABLE,
            format!("Task {id} cannot be cancelled"),
        )
    }
}

impl From<&MaestroError> for JsonRpcError {
    fn from(err: &MaestroError) -> Self {
        let code = match err {
            MaestroError::TaskNotFound(_) => error_codes::TASK_NOT_FOUND,
            MaestroError::UnsupportedOperation(_) => error_codes::UNSUPPORTED_OPERATION,
            MaestroError::InvalidStateTransition { .. } | MaestroError::TaskFinalized(_) => {
                error_codes::INVALID_PARAMS
            }
            _ => error_codes::INTERNAL_ERROR,
        };
        Self::new(code, err.client_message())
    }
}

/// Per-request options supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendConfiguration {
    /// Upper bound the caller will wait for the task, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Params of `message/send` and `message/stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSendParams {
    /// Message to act on. Carries `taskId` when resuming a task.
    pub message: Message,
    /// Per-request options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<SendConfiguration>,
    /// Opaque caller metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl MessageSendParams {
    /// Params with no configuration.
    pub fn new(message: Message) -> Self {
        Self {
            message,
            configuration: None,
            metadata: None,
        }
    }

    /// Bound the whole task to `timeout_ms`.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.configuration = Some(SendConfiguration {
            timeout_ms: Some(timeout_ms),
        });
        self
    }
}

/// Params of `tasks/get` and `tasks/cancel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskIdParams {
    /// Task id.
    pub id: String,
}

fn task_kind() -> String {
    "task".to_string()
}

/// Wire representation of a task and its artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    /// Task id.
    pub id: String,
    /// Conversation the task belongs to.
    pub context_id: String,
    /// Current status.
    pub status: TaskStatus,
    /// Artifacts in insertion order.
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Always `"task"`.
    #[serde(default = "task_kind")]
    pub kind: String,
}

impl From<&TaskRecord> for TaskSnapshot {
    fn from(record: &TaskRecord) -> Self {
        Self {
            id: record.task.id().to_string(),
            context_id: record.task.context_id().to_string(),
            status: TaskStatus::of(&record.task),
            artifacts: record.artifacts.clone(),
            kind: task_kind(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_core::{Task, TaskState};
    use serde_json::json;

    #[test]
    fn test_request_roundtrip_with_string_id() {
        let raw = json!({
            "jsonrpc": "2.0",
            "id": "req-7",
            "method": "message/send",
            "params": {"message": {"messageId": "m1", "role": "user", "parts": [{"kind": "text", "text": "hi"}]}}
        });
        let req: JsonRpcRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(req.id, json!("req-7"));
        let params: MessageSendParams = serde_json::from_value(req.params.unwrap()).unwrap();
        assert_eq!(params.message.text(), "hi");
        assert!(params.configuration.is_none());
    }

    #[test]
    fn test_response_omits_absent_fields() {
        let ok = serde_json::to_value(JsonRpcResponse::success(json!(1), json!({"a": 1}))).unwrap();
        assert!(ok.get("error").is_none());
        let err = serde_json::to_value(JsonRpcResponse::failure(
            json!(1),
            JsonRpcError::method_not_found("x/y"),
        ))
        .unwrap();
        assert!(err.get("result").is_none());
        assert_eq!(err["error"]["code"], -32601);
    }

    #[test]
    fn test_error_mapping() {
        let err = JsonRpcError::from(&MaestroError::TaskNotFound("t1".into()));
        assert_eq!(err.code, error_codes::TASK_NOT_FOUND);

        let err = JsonRpcError::from(&MaestroError::UnsupportedOperation("tasks/cancel".into()));
        assert_eq!(err.code, error_codes::UNSUPPORTED_OPERATION);
        assert!(err.message.contains("tasks/cancel"));

        let err = JsonRpcError::from(&MaestroError::Io(std::io::Error::other("disk /var/x")));
        assert_eq!(err.code, error_codes::INTERNAL_ERROR);
        assert!(!err.message.contains("/var/x"));
    }

    #[test]
    fn test_snapshot_shape() {
        let record = TaskRecord {
            task: Task::with_context("ctx"),
            artifacts: vec![],
        };
        let value = serde_json::to_value(TaskSnapshot::from(&record)).unwrap();
        assert_eq!(value["kind"], "task");
        assert_eq!(value["contextId"], "ctx");
        assert_eq!(value["status"]["state"], "pending");

        let parsed: TaskSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.status.state, TaskState::Pending);
    }

    #[test]
    fn test_timeout_configuration() {
        let params = MessageSendParams::new(Message::user("x")).with_timeout_ms(1500);
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["configuration"]["timeoutMs"], 1500);
    }
}
