//! `maestro.toml` loading.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! runnable configuration with a single `general` fallback domain.

use crate::classifier::KeywordClassifier;
use crate::engine::OrchestratorConfig;
use crate::planner::{CompositeRule, DependencyPlanner, PlannerConfig};
use crate::provider::{ProviderRegistry, RemoteAnalysisProvider};
use crate::quality::QualityConfig;
use maestro_a2a::{ClientConfig, ConnectionPool, HttpSessionFactory, PoolConfig, WorkerEndpoint};
use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "MAESTRO_CONFIG";
/// Config file read when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "maestro.toml";

/// Contents of `maestro.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaestroConfig {
    /// Listen address.
    #[serde(default)]
    pub server: ServerSection,
    /// Per-task event queues.
    #[serde(default)]
    pub queue: QueueSection,
    /// Worker connection pool.
    #[serde(default)]
    pub pool: PoolSection,
    /// Planning and execution.
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    /// Quality gate weights and thresholds.
    #[serde(default)]
    pub quality: QualityConfig,
    /// Base analysis domains, in classification order.
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
    /// Composite analyses.
    #[serde(default)]
    pub composites: Vec<CompositeConfig>,
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    /// Interface to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Finished tasks kept for `tasks/get` before the oldest are dropped.
    #[serde(default = "default_max_finished_tasks")]
    pub max_finished_tasks: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_finished_tasks: default_max_finished_tasks(),
        }
    }
}

/// `[queue]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSection {
    /// Events buffered per task before producers wait.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Idle poll interval of the consumer loop.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// `[pool]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSection {
    /// Idle time after which a session is evicted.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// How often idle sessions are evicted.
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
    /// TCP connect timeout for workers.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSection {
    /// Timeout of a single analysis.
    #[serde(default = "default_item_timeout_ms")]
    pub item_timeout_ms: u64,
    /// Re-planning rounds after a rejected result.
    #[serde(default = "default_max_replan_rounds")]
    pub max_replan_rounds: u32,
    /// Shorter requests get the low-confidence plan.
    #[serde(default = "default_min_request_chars")]
    pub min_request_chars: usize,
    /// Requests with fewer words get the low-confidence plan.
    #[serde(default = "default_min_request_words")]
    pub min_request_words: usize,
    /// Domain of the low-confidence plan.
    #[serde(default = "default_domain")]
    pub default_domain: String,
    /// Worker serving every analysis without its own `worker_url`.
    #[serde(default)]
    pub default_worker_url: Option<String>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            item_timeout_ms: default_item_timeout_ms(),
            max_replan_rounds: default_max_replan_rounds(),
            min_request_chars: default_min_request_chars(),
            min_request_words: default_min_request_words(),
            default_domain: default_domain(),
            default_worker_url: None,
        }
    }
}

/// A base analysis domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Domain name, also its analysis id.
    pub name: String,
    /// Empty means the domain matches on its own name.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Worker serving this domain.
    #[serde(default)]
    pub worker_url: Option<String>,
}

/// A composite analysis and, optionally, its dedicated worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeConfig {
    /// Dependency rule.
    #[serde(flatten)]
    pub rule: CompositeRule,
    /// Worker serving this composite.
    #[serde(default)]
    pub worker_url: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_max_finished_tasks() -> usize {
    maestro_a2a::DEFAULT_MAX_FINISHED_TASKS
}

fn default_queue_capacity() -> usize {
    maestro_core::DEFAULT_QUEUE_CAPACITY
}

fn default_poll_interval_ms() -> u64 {
    maestro_core::DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_eviction_interval_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_item_timeout_ms() -> u64 {
    30_000
}

fn default_max_replan_rounds() -> u32 {
    1
}

fn default_min_request_chars() -> usize {
    8
}

fn default_min_request_words() -> usize {
    2
}

fn default_domain() -> String {
    "general".to_string()
}

/// Read and parse a TOML config file. Does not validate.
pub fn parse_config(path: &Path) -> MaestroResult<MaestroConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        MaestroError::Config(format!(
            "Failed to read config '{}': {}",
            path.display(),
            e
        ))
    })?;
    toml::from_str(&content).map_err(|e| {
        MaestroError::Config(format!(
            "Failed to parse config '{}': {}",
            path.display(),
            e
        ))
    })
}

impl MaestroConfig {
    /// Load from `$MAESTRO_CONFIG`, else `maestro.toml` in the working
    /// directory, else defaults.
    pub fn load() -> MaestroResult<Self> {
        let explicit = std::env::var(CONFIG_ENV).ok();
        Self::load_from(explicit.as_deref().map(Path::new))
    }

    /// An explicit path must exist; the default path may be absent.
    pub fn load_from(explicit: Option<&Path>) -> MaestroResult<Self> {
        let config = match explicit {
            Some(path) => parse_config(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    parse_config(path)?
                } else {
                    info!(path = DEFAULT_CONFIG_PATH, "No config file, using defaults");
                    Self::default()
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> MaestroResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| MaestroError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> MaestroResult<()> {
        self.quality.validate()?;
        // Zero intervals would turn the queue and eviction loops into busy spins.
        let positive = [
            ("queue.capacity", self.queue.capacity as u64),
            ("queue.poll_interval_ms", self.queue.poll_interval_ms),
            ("pool.eviction_interval_secs", self.pool.eviction_interval_secs),
            ("pool.connect_timeout_secs", self.pool.connect_timeout_secs),
            ("orchestrator.item_timeout_ms", self.orchestrator.item_timeout_ms),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(MaestroError::Config(format!("{key} must be positive")));
        }
        let urls = self
            .domains
            .iter()
            .filter_map(|d| d.worker_url.as_deref())
            .chain(self.composites.iter().filter_map(|c| c.worker_url.as_deref()))
            .chain(self.orchestrator.default_worker_url.as_deref());
        for url in urls {
            WorkerEndpoint::parse(url)?;
        }
        self.planner().map(|_| ())
    }

    /// Keyword classifier over the configured domains.
    pub fn classifier(&self) -> MaestroResult<KeywordClassifier> {
        KeywordClassifier::new(
            self.domains
                .iter()
                .map(|d| (d.name.clone(), d.keywords.clone())),
        )
    }

    /// Low-confidence thresholds for the planner.
    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            min_request_chars: self.orchestrator.min_request_chars,
            min_request_words: self.orchestrator.min_request_words,
            default_domain: self.orchestrator.default_domain.clone(),
        }
    }

    /// Planner over the configured domains and composites.
    pub fn planner(&self) -> MaestroResult<DependencyPlanner> {
        DependencyPlanner::new(
            Arc::new(self.classifier()?),
            self.composites.iter().map(|c| c.rule.clone()).collect(),
            self.planner_config(),
        )
    }

    /// Engine timeouts and re-plan bound.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            item_timeout: Duration::from_millis(self.orchestrator.item_timeout_ms),
            max_replan_rounds: self.orchestrator.max_replan_rounds,
        }
    }

    /// Pool keep-alive and eviction settings.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            keep_alive: Duration::from_secs(self.pool.keep_alive_secs),
            eviction_interval: Duration::from_secs(self.pool.eviction_interval_secs),
        }
    }

    /// Worker HTTP settings.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_secs(self.pool.connect_timeout_secs),
            keep_alive: Duration::from_secs(self.pool.keep_alive_secs),
        }
    }

    /// Per-task queue settings.
    pub fn server_config(&self) -> maestro_a2a::ServerConfig {
        maestro_a2a::ServerConfig {
            queue_capacity: self.queue.capacity,
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms),
        }
    }

    /// Remote providers for every analysis with a worker URL, plus the
    /// default worker as fallback.
    pub fn providers(
        &self,
        pool: &Arc<ConnectionPool<HttpSessionFactory>>,
    ) -> MaestroResult<ProviderRegistry> {
        let mut registry = ProviderRegistry::new();
        let dedicated = self
            .domains
            .iter()
            .filter_map(|d| d.worker_url.as_deref().map(|u| (d.name.as_str(), u)))
            .chain(self.composites.iter().filter_map(|c| {
                c.worker_url
                    .as_deref()
                    .map(|u| (c.rule.analysis_id.as_str(), u))
            }));
        for (analysis_id, url) in dedicated {
            let endpoint = WorkerEndpoint::parse(url)?;
            info!(analysis = %analysis_id, peer = %endpoint.target, "Registered worker");
            registry.register(
                analysis_id,
                Arc::new(RemoteAnalysisProvider::new(pool.clone(), endpoint)),
            );
        }
        if let Some(url) = &self.orchestrator.default_worker_url {
            let endpoint = WorkerEndpoint::parse(url)?;
            info!(peer = %endpoint.target, "Registered default worker");
            registry.set_fallback(Arc::new(RemoteAnalysisProvider::new(pool.clone(), endpoint)));
        }
        Ok(registry)
    }
}
