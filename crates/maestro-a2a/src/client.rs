//! Remote agent client: JSON-RPC 2.0 over HTTP to a worker agent.

use crate::pool::{SessionFactory, Target};
use crate::protocol::*;
use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult, Message};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP tuning for worker sessions.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on establishing a TCP connection.
    pub connect_timeout: Duration,
    /// How long reqwest keeps an idle socket for reuse.
    pub keep_alive: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// A worker URL split into the pooled destination and the RPC path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    /// Pooled destination (`scheme://host:port`).
    pub target: Target,
    /// Path the JSON-RPC requests are posted to.
    pub path: String,
}

impl WorkerEndpoint {
    /// Parse `http(s)://host[:port][/path]`.
    pub fn parse(url: &str) -> MaestroResult<Self> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| MaestroError::Config(format!("Invalid worker URL '{url}': {e}")))?;
        let scheme = parsed.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(MaestroError::Config(format!(
                "Worker URL '{url}' must use http or https"
            )));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| MaestroError::Config(format!("Worker URL '{url}' has no host")))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| MaestroError::Config(format!("Worker URL '{url}' has no port")))?;
        Ok(Self {
            target: Target {
                scheme: scheme.to_string(),
                host: host.to_string(),
                port,
            },
            path: parsed.path().to_string(),
        })
    }
}

/// One reusable session to a worker agent (`host:port`).
pub struct RemoteAgentClient {
    http: reqwest::Client,
    target: Target,
    next_id: AtomicU64,
}

impl RemoteAgentClient {
    /// Client for one destination, with its own reqwest connection pool.
    pub fn new(target: Target, config: &ClientConfig) -> MaestroResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.keep_alive)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| {
                MaestroError::ConnectionUnavailable(format!("{target}: failed to build client: {e}"))
            })?;
        Ok(Self {
            http,
            target,
            next_id: AtomicU64::new(1),
        })
    }

    /// Destination this client talks to.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// `message/send`: deliver `message` and wait for the final task.
    pub async fn send_message(
        &self,
        path: &str,
        message: Message,
        timeout: Duration,
    ) -> MaestroResult<TaskSnapshot> {
        let params = MessageSendParams::new(message).with_timeout_ms(timeout.as_millis() as u64);
        self.call(path, methods::MESSAGE_SEND, serde_json::to_value(params)?, timeout)
            .await
    }

    /// `tasks/get`.
    pub async fn get_task(
        &self,
        path: &str,
        task_id: &str,
        timeout: Duration,
    ) -> MaestroResult<TaskSnapshot> {
        let params = TaskIdParams {
            id: task_id.to_string(),
        };
        self.call(path, methods::TASKS_GET, serde_json::to_value(params)?, timeout)
            .await
    }

    /// `tasks/cancel`. Peers that do not implement it yield
    /// [`MaestroError::UnsupportedOperation`].
    pub async fn cancel_task(
        &self,
        path: &str,
        task_id: &str,
        timeout: Duration,
    ) -> MaestroResult<TaskSnapshot> {
        let params = TaskIdParams {
            id: task_id.to_string(),
        };
        self.call(path, methods::TASKS_CANCEL, serde_json::to_value(params)?, timeout)
            .await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        path: &str,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> MaestroResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, Some(params));
        let url = format!("{}{}", self.target.base_url(), path);
        debug!(url = %url, method, id, "Sending JSON-RPC request");

        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e, method, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MaestroError::Http(format!(
                "{method} to {} returned HTTP {status}",
                self.target
            )));
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| self.map_transport_error(e, method, timeout))?;

        if let Some(err) = body.error {
            warn!(peer = %self.target, method, code = err.code, message = %err.message, "Remote agent returned an error");
            return Err(match err.code {
                error_codes::METHOD_NOT_FOUND | error_codes::UNSUPPORTED_OPERATION => {
                    MaestroError::UnsupportedOperation(format!("{method} on {}", self.target))
                }
                error_codes::TASK_NOT_FOUND => MaestroError::TaskNotFound(err.message),
                code => MaestroError::Protocol(format!("{method} failed ({code}): {}", err.message)),
            });
        }

        let result = body
            .result
            .ok_or_else(|| MaestroError::Protocol(format!("{method} response has no result")))?;
        Ok(serde_json::from_value(result)?)
    }

    fn map_transport_error(&self, e: reqwest::Error, method: &str, timeout: Duration) -> MaestroError {
        if e.is_timeout() {
            MaestroError::AnalysisTimeout {
                analysis: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else if e.is_connect() {
            MaestroError::ConnectionUnavailable(format!("{}: {e}", self.target))
        } else if e.is_decode() {
            MaestroError::Protocol(format!("{method}: malformed response: {e}"))
        } else {
            MaestroError::Http(format!("{method} to {}: {e}", self.target))
        }
    }
}

/// Creates [`RemoteAgentClient`] sessions for a [`ConnectionPool`](crate::ConnectionPool).
#[derive(Debug, Clone, Default)]
pub struct HttpSessionFactory {
    config: ClientConfig,
}

impl HttpSessionFactory {
    /// Factory building clients with `config`.
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    type Session = RemoteAgentClient;

    async fn connect(&self, target: &Target) -> MaestroResult<RemoteAgentClient> {
        RemoteAgentClient::new(target.clone(), &self.config)
    }
}
