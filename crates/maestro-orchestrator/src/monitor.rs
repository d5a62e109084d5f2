use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What an analysis is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    /// No run in flight.
    Idle,
    /// At least one run in flight.
    Running,
    /// Last run fell back to placeholder content.
    Degraded,
}

/// How a single run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    /// Produced an artifact.
    Succeeded,
    /// Hit the item timeout.
    TimedOut,
    /// Failed with an error.
    Failed,
    /// Paused on a question.
    InputRequired,
}

/// Counters for one analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisMetrics {
    /// Runs started.
    pub runs: u64,
    /// Runs that produced an artifact.
    pub successes: u64,
    /// Runs that timed out.
    pub timeouts: u64,
    /// Runs that failed.
    pub failures: u64,
    /// Runs that asked for input.
    pub input_requests: u64,
    /// Total wall time of finished runs.
    pub duration_ms: u64,
}

/// Live view of one analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisState {
    /// Analysis id.
    pub analysis_id: String,
    /// `running` while any task is still in flight.
    pub status: AnalysisStatus,
    /// Root tasks with a run of this analysis in flight, oldest first.
    pub active_tasks: Vec<String>,
    /// Counters since start.
    pub metrics: AnalysisMetrics,
}

impl AnalysisState {
    fn new(analysis_id: &str) -> Self {
        Self {
            analysis_id: analysis_id.to_string(),
            status: AnalysisStatus::Idle,
            active_tasks: Vec::new(),
            metrics: AnalysisMetrics::default(),
        }
    }
}

/// Tracks state and metrics for every analysis the orchestrator has run.
pub struct AnalysisMonitor {
    states: Arc<RwLock<BTreeMap<String, AnalysisState>>>,
}

impl AnalysisMonitor {
    /// Empty monitor.
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Mark an analysis as running for a task.
    pub async fn start(&self, analysis_id: &str, task_id: &str) {
        let mut states = self.states.write().await;
        let state = states
            .entry(analysis_id.to_string())
            .or_insert_with(|| AnalysisState::new(analysis_id));
        state.status = AnalysisStatus::Running;
        state.active_tasks.push(task_id.to_string());
        state.metrics.runs += 1;
    }

    /// Record how a task's run ended and how long it took.
    pub async fn finish(
        &self,
        analysis_id: &str,
        task_id: &str,
        result: RunResult,
        duration_ms: u64,
    ) {
        let mut states = self.states.write().await;
        let state = states
            .entry(analysis_id.to_string())
            .or_insert_with(|| AnalysisState::new(analysis_id));
        if let Some(pos) = state.active_tasks.iter().position(|t| t == task_id) {
            state.active_tasks.remove(pos);
        }
        state.metrics.duration_ms += duration_ms;
        let degraded = match result {
            RunResult::Succeeded => {
                state.metrics.successes += 1;
                false
            }
            RunResult::InputRequired => {
                state.metrics.input_requests += 1;
                false
            }
            RunResult::TimedOut => {
                state.metrics.timeouts += 1;
                true
            }
            RunResult::Failed => {
                state.metrics.failures += 1;
                true
            }
        };
        state.status = if !state.active_tasks.is_empty() {
            AnalysisStatus::Running
        } else if degraded {
            AnalysisStatus::Degraded
        } else {
            AnalysisStatus::Idle
        };
    }

    /// All analyses, ordered by id.
    pub async fn snapshot(&self) -> Vec<AnalysisState> {
        let states = self.states.read().await;
        states.values().cloned().collect()
    }

    /// State of one analysis.
    pub async fn get_state(&self, analysis_id: &str) -> Option<AnalysisState> {
        let states = self.states.read().await;
        states.get(analysis_id).cloned()
    }

    /// Sum of all per-analysis counters.
    pub async fn aggregate_metrics(&self) -> AnalysisMetrics {
        let states = self.states.read().await;
        let mut total = AnalysisMetrics::default();
        for state in states.values() {
            total.runs += state.metrics.runs;
            total.successes += state.metrics.successes;
            total.timeouts += state.metrics.timeouts;
            total.failures += state.metrics.failures;
            total.input_requests += state.metrics.input_requests;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    /// Current state as JSON, for the metrics endpoint.
    pub async fn to_json(&self) -> serde_json::Value {
        let analyses = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "analyses": analyses,
            "aggregate": aggregate,
        })
    }
}

impl Default for AnalysisMonitor {
    fn default() -> Self {
        Self::new()
    }
}
