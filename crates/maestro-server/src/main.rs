//! `maestro`: serves the orchestrator over JSON-RPC/SSE with a `/metrics` endpoint.

use anyhow::Context;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use maestro_a2a::{A2aServer, ConnectionPool, HttpSessionFactory, InMemoryTaskStore};
use maestro_orchestrator::{AnalysisMonitor, MaestroConfig, Orchestrator, QualityGate};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

type WorkerPool = ConnectionPool<HttpSessionFactory>;

#[derive(Clone)]
struct MetricsState {
    pool: Arc<WorkerPool>,
    monitor: Arc<AnalysisMonitor>,
}

async fn metrics(State(state): State<MetricsState>) -> Json<Value> {
    Json(json!({
        "pool": state.pool.stats(),
        "analyses": state.monitor.to_json().await,
    }))
}

fn metrics_router(pool: Arc<WorkerPool>, monitor: Arc<AnalysisMonitor>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(MetricsState { pool, monitor })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = MaestroConfig::load().context("Failed to load configuration")?;

    let pool = Arc::new(ConnectionPool::new(
        HttpSessionFactory::new(config.client_config()),
        config.pool_config(),
    ));
    let shutdown = CancellationToken::new();
    let eviction = pool.spawn_eviction(shutdown.clone());

    let providers = config.providers(&pool)?;
    if providers.is_empty() && config.orchestrator.default_worker_url.is_none() {
        warn!("No worker URLs configured, every analysis will fall back");
    }
    let orchestrator = Arc::new(Orchestrator::new(
        config.planner()?,
        providers,
        QualityGate::new(config.quality.clone()),
        config.orchestrator_config(),
    ));

    let app = A2aServer::build(
        orchestrator.clone(),
        Arc::new(InMemoryTaskStore::with_retention(
            config.server.max_finished_tasks,
        )),
        config.server_config(),
    )
    .merge(metrics_router(pool.clone(), orchestrator.monitor().clone()));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(
        addr = %addr,
        domains = config.domains.len(),
        composites = config.composites.len(),
        "Maestro orchestrator listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Err(e) = eviction.await {
        warn!(error = %e, "Pool eviction task did not exit cleanly");
    }
    info!(stats = ?pool.stats(), "Maestro orchestrator stopped");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use maestro_a2a::{ClientConfig, PoolConfig};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_metrics_endpoint_reports_pool_and_analyses() {
        let pool = Arc::new(ConnectionPool::new(
            HttpSessionFactory::new(ClientConfig::default()),
            PoolConfig::default(),
        ));
        let monitor = Arc::new(AnalysisMonitor::new());
        monitor.start("ethics", "task-1").await;

        let app = metrics_router(pool, monitor);
        let resp = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["pool"]["connectionsCreated"], 0);
        assert_eq!(json["analyses"]["analyses"][0]["status"], "running");
        assert_eq!(json["analyses"]["aggregate"]["runs"], 1);
    }
}
