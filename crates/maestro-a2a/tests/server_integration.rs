#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use maestro_a2a::{
    error_codes, A2aServer, AgentExecutor, InMemoryTaskStore, RequestContext, ServerConfig,
};
use maestro_core::{MaestroError, MaestroResult, Message, Metadata, Part, TaskUpdater};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Echoes the request text back as one artifact.
struct Echo;

#[async_trait]
impl AgentExecutor for Echo {
    async fn execute(
        &self,
        ctx: RequestContext,
        updater: Arc<TaskUpdater>,
        _cancel: CancellationToken,
    ) -> MaestroResult<()> {
        updater.start_work("echoing").await?;
        updater
            .add_artifact(
                vec![Part::text(ctx.message.text())],
                "echo",
                Metadata::new(),
            )
            .await?;
        updater.complete_with_message("done").await
    }
}

/// Reports its task id, then never finishes on its own.
struct Slow {
    started: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl AgentExecutor for Slow {
    async fn execute(
        &self,
        ctx: RequestContext,
        _updater: Arc<TaskUpdater>,
        _cancel: CancellationToken,
    ) -> MaestroResult<()> {
        let _ = self.started.send(ctx.task_id);
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

/// Asks a question first, answers once resumed.
struct AskFirst;

#[async_trait]
impl AgentExecutor for AskFirst {
    async fn execute(
        &self,
        ctx: RequestContext,
        updater: Arc<TaskUpdater>,
        _cancel: CancellationToken,
    ) -> MaestroResult<()> {
        if !ctx.resumed {
            return updater.request_input("Which region?").await;
        }
        updater
            .add_artifact(
                vec![Part::text(format!("region: {}", ctx.message.text()))],
                "answer",
                Metadata::new(),
            )
            .await?;
        Ok(())
    }
}

/// Asks once, then counts how many resumed runs it served.
#[derive(Default)]
struct CountingResumes {
    resumed_runs: AtomicUsize,
}

#[async_trait]
impl AgentExecutor for CountingResumes {
    async fn execute(
        &self,
        ctx: RequestContext,
        updater: Arc<TaskUpdater>,
        _cancel: CancellationToken,
    ) -> MaestroResult<()> {
        if !ctx.resumed {
            return updater.request_input("Which region?").await;
        }
        self.resumed_runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(())
    }
}

struct Broken;

#[async_trait]
impl AgentExecutor for Broken {
    async fn execute(
        &self,
        _ctx: RequestContext,
        _updater: Arc<TaskUpdater>,
        _cancel: CancellationToken,
    ) -> MaestroResult<()> {
        Err(MaestroError::Analysis("model unavailable".into()))
    }
}

fn app(executor: Arc<dyn AgentExecutor>) -> (Router, Arc<InMemoryTaskStore>) {
    let store = Arc::new(InMemoryTaskStore::new());
    let config = ServerConfig {
        queue_capacity: 16,
        poll_interval: Duration::from_millis(10),
    };
    (A2aServer::build(executor, store.clone(), config), store)
}

fn rpc(method: &str, params: Value) -> Request<Body> {
    let body = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params});
    Request::builder()
        .method("POST")
        .uri("/")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn send_params(message: &Message) -> Value {
    json!({"message": message})
}

async fn call(app: &Router, request: Request<Body>) -> Value {
    let resp = app.clone().oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_send_returns_completed_snapshot() {
    let (app, store) = app(Arc::new(Echo));
    let resp = call(&app, rpc("message/send", send_params(&Message::user("hello")))).await;

    let result = &resp["result"];
    assert_eq!(result["kind"], "task");
    assert_eq!(result["status"]["state"], "completed");
    assert_eq!(result["status"]["message"]["parts"][0]["text"], "done");
    assert_eq!(result["artifacts"].as_array().unwrap().len(), 1);
    assert_eq!(result["artifacts"][0]["parts"][0]["text"], "hello");
    assert_eq!(store.len(), 1);

    let id = result["id"].as_str().unwrap();
    let fetched = call(&app, rpc("tasks/get", json!({"id": id}))).await;
    assert_eq!(fetched["result"]["status"]["state"], "completed");
}

#[tokio::test]
async fn test_context_id_is_kept() {
    let (app, _store) = app(Arc::new(Echo));
    let mut message = Message::user("hi");
    message.context_id = Some("conversation-9".into());
    let resp = call(&app, rpc("message/send", send_params(&message))).await;
    assert_eq!(resp["result"]["contextId"], "conversation-9");
}

#[tokio::test]
async fn test_protocol_errors() {
    let (app, _store) = app(Arc::new(Echo));

    let garbage = Request::builder()
        .method("POST")
        .uri("/")
        .body(Body::from("{not json"))
        .unwrap();
    let resp = call(&app, garbage).await;
    assert_eq!(resp["error"]["code"], error_codes::PARSE_ERROR);
    assert_eq!(resp["id"], Value::Null);

    let resp = call(&app, rpc("tasks/list", json!({}))).await;
    assert_eq!(resp["error"]["code"], error_codes::METHOD_NOT_FOUND);
    assert_eq!(resp["id"], 1);

    let resp = call(&app, rpc("message/send", json!({"nope": true}))).await;
    assert_eq!(resp["error"]["code"], error_codes::INVALID_PARAMS);

    let wrong_version = Request::builder()
        .method("POST")
        .uri("/")
        .body(Body::from(
            json!({"jsonrpc": "1.0", "id": 3, "method": "tasks/get"}).to_string(),
        ))
        .unwrap();
    let resp = call(&app, wrong_version).await;
    assert_eq!(resp["error"]["code"], error_codes::INVALID_REQUEST);

    let resp = call(&app, rpc("tasks/get", json!({"id": "missing"}))).await;
    assert_eq!(resp["error"]["code"], error_codes::TASK_NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_terminal_task_is_rejected() {
    let (app, _store) = app(Arc::new(Echo));
    let resp = call(&app, rpc("message/send", send_params(&Message::user("x")))).await;
    let id = resp["result"]["id"].as_str().unwrap().to_string();

    let resp = call(&app, rpc("tasks/cancel", json!({"id": id}))).await;
    assert_eq!(resp["error"]["code"], error_codes::TASK_NOT_CANCELABLE);
}

#[tokio::test]
async fn test_cancel_running_task() {
    let (tx, mut started) = mpsc::unbounded_channel();
    let (app, _store) = app(Arc::new(Slow { started: tx }));

    let pending = {
        let app = app.clone();
        tokio::spawn(async move {
            call(&app, rpc("message/send", send_params(&Message::user("slow")))).await
        })
    };
    let task_id = started.recv().await.unwrap();

    let resp = call(&app, rpc("tasks/cancel", json!({"id": task_id}))).await;
    assert_eq!(resp["result"]["status"]["state"], "cancelled");

    let sent = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sent["result"]["status"]["state"], "cancelled");
}

#[tokio::test]
async fn test_request_timeout_fails_task() {
    let (tx, _started) = mpsc::unbounded_channel();
    let (app, _store) = app(Arc::new(Slow { started: tx }));
    let params = json!({
        "message": Message::user("slow"),
        "configuration": {"timeoutMs": 50}
    });
    let resp = call(&app, rpc("message/send", params)).await;
    assert_eq!(resp["result"]["status"]["state"], "failed");
}

#[tokio::test]
async fn test_executor_error_fails_with_readable_cause() {
    let (app, _store) = app(Arc::new(Broken));
    let resp = call(&app, rpc("message/send", send_params(&Message::user("x")))).await;
    assert_eq!(resp["result"]["status"]["state"], "failed");
    assert_eq!(
        resp["result"]["status"]["message"]["parts"][0]["text"],
        "Task failed: Analysis failed: model unavailable"
    );
}

#[tokio::test]
async fn test_input_required_then_resume() {
    let (app, _store) = app(Arc::new(AskFirst));
    let resp = call(&app, rpc("message/send", send_params(&Message::user("forecast")))).await;
    let first = &resp["result"];
    assert_eq!(first["status"]["state"], "input_required");
    assert_eq!(first["status"]["message"]["parts"][0]["text"], "Which region?");

    let id = first["id"].as_str().unwrap();
    let ctx = first["contextId"].as_str().unwrap();
    let answer = Message::user("EU").for_task(id, ctx);
    let resp = call(&app, rpc("message/send", send_params(&answer))).await;
    let second = &resp["result"];
    assert_eq!(second["id"], id);
    assert_eq!(second["status"]["state"], "completed");
    assert_eq!(second["artifacts"][0]["parts"][0]["text"], "region: EU");

    // Completed now, so it cannot be resumed again.
    let again = Message::user("US").for_task(id, ctx);
    let resp = call(&app, rpc("message/send", send_params(&again))).await;
    assert_eq!(resp["error"]["code"], error_codes::INVALID_PARAMS);
}

#[tokio::test]
async fn test_concurrent_resumes_run_the_task_once() {
    let executor = Arc::new(CountingResumes::default());
    let (app, _store) = app(executor.clone());
    let resp = call(&app, rpc("message/send", send_params(&Message::user("forecast")))).await;
    let id = resp["result"]["id"].as_str().unwrap().to_string();
    let ctx = resp["result"]["contextId"].as_str().unwrap().to_string();

    let eu = Message::user("EU").for_task(&id, &ctx);
    let us = Message::user("US").for_task(&id, &ctx);
    let (a, b) = tokio::join!(
        call(&app, rpc("message/send", send_params(&eu))),
        call(&app, rpc("message/send", send_params(&us))),
    );

    assert_eq!(executor.resumed_runs.load(Ordering::SeqCst), 1);
    let completed = [&a, &b]
        .iter()
        .filter(|r| r["result"]["status"]["state"] == "completed")
        .count();
    let rejected = [&a, &b]
        .iter()
        .filter(|r| r["error"]["code"] == error_codes::INVALID_PARAMS)
        .count();
    assert_eq!((completed, rejected), (1, 1));

    let fetched = call(&app, rpc("tasks/get", json!({"id": id}))).await;
    assert_eq!(fetched["result"]["status"]["state"], "completed");
}

#[tokio::test]
async fn test_cancel_paused_task() {
    let (app, _store) = app(Arc::new(AskFirst));
    let resp = call(&app, rpc("message/send", send_params(&Message::user("forecast")))).await;
    let id = resp["result"]["id"].as_str().unwrap().to_string();

    let resp = call(&app, rpc("tasks/cancel", json!({"id": id}))).await;
    assert_eq!(resp["result"]["status"]["state"], "cancelled");
}

#[tokio::test]
async fn test_stream_ends_with_final_status() {
    let (app, _store) = app(Arc::new(Echo));
    let resp = app
        .clone()
        .oneshot(rpc("message/stream", send_params(&Message::user("streamed"))))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = tokio::time::timeout(
        Duration::from_secs(5),
        axum::body::to_bytes(resp.into_body(), usize::MAX),
    )
    .await
    .unwrap()
    .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    let frames: Vec<Value> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();

    let kinds: Vec<&str> = frames
        .iter()
        .map(|f| f["result"]["kind"].as_str().unwrap())
        .collect();
    assert_eq!(
        kinds,
        vec!["status-update", "status-update", "artifact-update", "status-update"]
    );
    assert!(frames.iter().all(|f| f["id"] == 1));

    let last = &frames[3]["result"];
    assert_eq!(last["final"], true);
    assert_eq!(last["status"]["state"], "completed");
    assert!(frames[..3].iter().all(|f| f["result"]["final"] != true));
    assert_eq!(frames[2]["result"]["artifact"]["parts"][0]["text"], "streamed");
}

#[tokio::test]
async fn test_health() {
    let (app, _store) = app(Arc::new(Echo));
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["status"], "ok");
    assert_eq!(parsed["tasks"], 0);
}
