use crate::quality::{DomainEvidence, Synthesis};
use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use maestro_a2a::{ConnectionPool, HttpSessionFactory, TaskSnapshot, WorkerEndpoint};
use maestro_core::{Artifact, MaestroError, MaestroResult, Message, Metadata, Part, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Artifact metadata key carrying a domain's evidence quality.
pub const EVIDENCE_QUALITY_KEY: &str = "evidence_quality";
/// Artifact metadata key carrying a domain's bias flag.
pub const BIAS_DETECTED_KEY: &str = "bias_detected";
/// Artifact metadata key carrying the producer's declared confidence.
pub const CONFIDENCE_KEY: &str = "confidence";
/// Evidence assumed for an artifact that does not report any.
pub const DEFAULT_EVIDENCE_QUALITY: f64 = 0.5;

/// One step reported by an analysis.
#[derive(Debug)]
pub enum AgentStep {
    /// Progress; more steps follow.
    Working(String),
    /// The analysis needs an answer from the requester.
    InputRequired(String),
    /// Final result.
    Completed(Artifact),
    /// Final failure.
    Failed(MaestroError),
}

impl AgentStep {
    /// Whether the step ends the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AgentStep::Working(_))
    }
}

/// Steps of one analysis run. Consumers stop at the first terminal step.
pub type StepStream = Pin<Box<dyn Stream<Item = AgentStep> + Send>>;

/// Input handed to a provider for one plan item.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    /// Analysis to run.
    pub analysis_id: String,
    /// Client request text.
    pub request: String,
    /// Conversation of the root task.
    pub context_id: String,
    /// Results of the analyses this one depends on.
    pub inputs: Vec<Artifact>,
    /// Time the orchestrator waits for a result.
    pub timeout: Duration,
}

impl AnalysisRequest {
    /// Message sent to a worker: the request, then each input artifact.
    pub fn to_message(&self) -> Message {
        let mut parts = vec![Part::text(self.request.clone())];
        for input in &self.inputs {
            parts.push(Part::text(format!("[{}]\n{}", input.name, input.text())));
        }
        let mut message = Message::new(maestro_core::Role::User, parts);
        message.context_id = Some(self.context_id.clone());
        message
    }
}

/// Runs one named analysis.
pub trait AnalysisProvider: Send + Sync {
    /// Start an analysis. The stream ends after its first terminal step.
    fn analyze(&self, request: AnalysisRequest) -> StepStream;
}

/// Analysis id to provider lookup with an optional catch-all.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn AnalysisProvider>>,
    fallback: Option<Arc<dyn AnalysisProvider>>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `analysis_id` with `provider`.
    pub fn register(&mut self, analysis_id: impl Into<String>, provider: Arc<dyn AnalysisProvider>) {
        self.providers.insert(analysis_id.into(), provider);
    }

    /// Provider used for analyses without a dedicated one.
    pub fn set_fallback(&mut self, provider: Arc<dyn AnalysisProvider>) {
        self.fallback = Some(provider);
    }

    /// Dedicated provider, else the fallback.
    pub fn get(&self, analysis_id: &str) -> Option<Arc<dyn AnalysisProvider>> {
        self.providers
            .get(analysis_id)
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// Number of dedicated providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether there is no dedicated provider.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Calls a worker agent over JSON-RPC through the shared pool.
pub struct RemoteAnalysisProvider {
    pool: Arc<ConnectionPool<HttpSessionFactory>>,
    endpoint: WorkerEndpoint,
}

impl RemoteAnalysisProvider {
    /// Provider calling `endpoint` through `pool`.
    pub fn new(pool: Arc<ConnectionPool<HttpSessionFactory>>, endpoint: WorkerEndpoint) -> Self {
        Self { pool, endpoint }
    }

    /// Worker this provider calls.
    pub fn endpoint(&self) -> &WorkerEndpoint {
        &self.endpoint
    }
}

impl AnalysisProvider for RemoteAnalysisProvider {
    fn analyze(&self, request: AnalysisRequest) -> StepStream {
        let pool = self.pool.clone();
        let endpoint = self.endpoint.clone();
        let dispatched = AgentStep::Working(format!(
            "{} dispatched to {}",
            request.analysis_id, endpoint.target
        ));
        let result = async move {
            match send_with_retry(&pool, &endpoint, &request).await {
                Ok(snapshot) => step_from_snapshot(&request.analysis_id, snapshot),
                Err(e) => AgentStep::Failed(e),
            }
        };
        stream::iter([dispatched]).chain(stream::once(result)).boxed()
    }
}

/// One retry on a fresh session when the pooled one cannot connect.
async fn send_with_retry(
    pool: &ConnectionPool<HttpSessionFactory>,
    endpoint: &WorkerEndpoint,
    request: &AnalysisRequest,
) -> MaestroResult<TaskSnapshot> {
    let message = request.to_message();
    let client = pool.get_or_create(&endpoint.target).await?;
    match client
        .send_message(&endpoint.path, message.clone(), request.timeout)
        .await
    {
        Err(MaestroError::ConnectionUnavailable(reason)) => {
            warn!(analysis = %request.analysis_id, peer = %endpoint.target, reason = %reason, "Worker unreachable, retrying on a fresh session");
            pool.invalidate(&endpoint.target).await;
            let client = pool.get_or_create(&endpoint.target).await?;
            client
                .send_message(&endpoint.path, message, request.timeout)
                .await
        }
        other => other,
    }
}

/// Map a worker's final task onto a step.
fn step_from_snapshot(analysis_id: &str, snapshot: TaskSnapshot) -> AgentStep {
    let status_text = snapshot
        .status
        .message
        .as_ref()
        .map(Message::text)
        .unwrap_or_default();
    match snapshot.status.state {
        TaskState::Completed => {
            let mut artifacts = snapshot.artifacts.into_iter();
            let Some(first) = artifacts.next() else {
                return AgentStep::Completed(Artifact::new(
                    analysis_id,
                    vec![Part::text(status_text)],
                    Metadata::new(),
                ));
            };
            // Several artifacts are folded into one, later metadata wins.
            let merged = artifacts.fold(first, |mut acc, next| {
                acc.parts.extend(next.parts);
                acc.metadata.extend(next.metadata);
                acc
            });
            AgentStep::Completed(Artifact::new(analysis_id, merged.parts, merged.metadata))
        }
        TaskState::InputRequired => AgentStep::InputRequired(status_text),
        TaskState::Failed | TaskState::Cancelled => AgentStep::Failed(MaestroError::Analysis(
            format!("worker ended in {}: {status_text}", snapshot.status.state),
        )),
        TaskState::Pending | TaskState::Working => AgentStep::Failed(MaestroError::Protocol(
            format!("worker returned non-final state {}", snapshot.status.state),
        )),
    }
}

/// How one plan item ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOutcome {
    /// Analysis that ran.
    pub analysis_id: String,
    /// Whether it is a composite analysis.
    pub composite: bool,
    /// Result or fallback content.
    pub artifact: Artifact,
    /// Set when `artifact` is fallback content.
    pub degraded: bool,
    /// Readable failure cause when degraded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalysisOutcome {
    /// Outcome of a successful run.
    pub fn success(analysis_id: impl Into<String>, composite: bool, artifact: Artifact) -> Self {
        Self {
            analysis_id: analysis_id.into(),
            composite,
            artifact,
            degraded: false,
            error: None,
        }
    }

    /// Fallback content standing in for a failed analysis.
    pub fn fallback(analysis_id: impl Into<String>, composite: bool, error: &MaestroError) -> Self {
        let analysis_id = analysis_id.into();
        let reason = error.client_message();
        let mut metadata = Metadata::new();
        metadata.insert("fallback".into(), serde_json::Value::Bool(true));
        metadata.insert(EVIDENCE_QUALITY_KEY.into(), serde_json::json!(0.0));
        let artifact = Artifact::new(
            analysis_id.clone(),
            vec![Part::text(format!(
                "The {analysis_id} analysis is unavailable: {reason}"
            ))],
            metadata,
        );
        Self {
            analysis_id,
            composite,
            artifact,
            degraded: true,
            error: Some(reason),
        }
    }

    /// Evidence for the quality gate; degraded and composite outcomes have none.
    pub fn evidence(&self) -> Option<DomainEvidence> {
        if self.degraded || self.composite {
            return None;
        }
        Some(DomainEvidence {
            domain: self.analysis_id.clone(),
            evidence_quality: self
                .artifact
                .metadata_f64(EVIDENCE_QUALITY_KEY)
                .unwrap_or(DEFAULT_EVIDENCE_QUALITY)
                .clamp(0.0, 1.0),
            bias_detected: self.artifact.metadata_bool(BIAS_DETECTED_KEY).unwrap_or(false),
        })
    }

    /// Confidence declared by the worker, if any.
    pub fn confidence(&self) -> Option<f64> {
        (!self.degraded)
            .then(|| self.artifact.metadata_f64(CONFIDENCE_KEY))
            .flatten()
    }
}

/// Combines analysis outcomes into one answer.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Merge outcomes into one result.
    async fn synthesize(&self, request: &str, outcomes: &[AnalysisOutcome])
        -> MaestroResult<Synthesis>;
}

/// Sections per analysis in plan order.
///
/// The declared confidence is that of the last successful composite
/// analysis, else the mean over successful base analyses, else zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct SectionSynthesizer;

#[async_trait]
impl Synthesizer for SectionSynthesizer {
    async fn synthesize(
        &self,
        request: &str,
        outcomes: &[AnalysisOutcome],
    ) -> MaestroResult<Synthesis> {
        let mut content = format!("# {}\n", request.trim());
        for outcome in outcomes {
            content.push_str(&format!(
                "\n## {}\n{}\n",
                outcome.analysis_id,
                outcome.artifact.text()
            ));
        }

        let composite = outcomes
            .iter()
            .filter(|o| o.composite)
            .filter_map(AnalysisOutcome::confidence)
            .last();
        let declared_confidence = composite.unwrap_or_else(|| {
            let base: Vec<f64> = outcomes
                .iter()
                .filter(|o| !o.composite)
                .filter_map(AnalysisOutcome::confidence)
                .collect();
            if base.is_empty() {
                0.0
            } else {
                base.iter().sum::<f64>() / base.len() as f64
            }
        });
        debug!(sections = outcomes.len(), declared_confidence, "Synthesis assembled");

        Ok(Synthesis {
            content,
            declared_confidence: declared_confidence.clamp(0.0, 1.0),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_core::{Task, TaskStatus};
    use serde_json::json;

    fn artifact(text: &str, meta: serde_json::Value) -> Artifact {
        Artifact::new(
            "worker",
            vec![Part::text(text)],
            meta.as_object().cloned().unwrap_or_default(),
        )
    }

    fn snapshot(state: TaskState, artifacts: Vec<Artifact>) -> TaskSnapshot {
        let task = Task::new();
        let mut status = TaskStatus::of(&task);
        status.state = state;
        status.message = Some(Message::agent("status text"));
        TaskSnapshot {
            id: task.id().to_string(),
            context_id: task.context_id().to_string(),
            status,
            artifacts,
            kind: "task".into(),
        }
    }

    #[test]
    fn test_completed_snapshot_merges_artifacts() {
        let step = step_from_snapshot(
            "ethics",
            snapshot(
                TaskState::Completed,
                vec![
                    artifact("one", json!({"evidence_quality": 0.4})),
                    artifact("two", json!({"evidence_quality": 0.9, "bias_detected": true})),
                ],
            ),
        );
        let AgentStep::Completed(artifact) = step else {
            panic!("expected completed step");
        };
        assert_eq!(artifact.name, "ethics");
        assert_eq!(artifact.text(), "one\ntwo");
        assert_eq!(artifact.metadata_f64(EVIDENCE_QUALITY_KEY), Some(0.9));
    }

    #[test]
    fn test_other_states_map_to_steps() {
        assert!(matches!(
            step_from_snapshot("a", snapshot(TaskState::InputRequired, vec![])),
            AgentStep::InputRequired(q) if q == "status text"
        ));
        assert!(matches!(
            step_from_snapshot("a", snapshot(TaskState::Failed, vec![])),
            AgentStep::Failed(MaestroError::Analysis(_))
        ));
        assert!(matches!(
            step_from_snapshot("a", snapshot(TaskState::Working, vec![])),
            AgentStep::Failed(MaestroError::Protocol(_))
        ));
        let AgentStep::Completed(empty) = step_from_snapshot("a", snapshot(TaskState::Completed, vec![]))
        else {
            panic!("expected completed step");
        };
        assert_eq!(empty.text(), "status text");
    }

    #[test]
    fn test_outcome_evidence() {
        let ok = AnalysisOutcome::success(
            "ethics",
            false,
            artifact("x", json!({"evidence_quality": 0.8, "bias_detected": true})),
        );
        let evidence = ok.evidence().unwrap();
        assert_eq!(evidence.evidence_quality, 0.8);
        assert!(evidence.bias_detected);

        let bare = AnalysisOutcome::success("ethics", false, artifact("x", json!({})));
        assert_eq!(bare.evidence().unwrap().evidence_quality, DEFAULT_EVIDENCE_QUALITY);

        let degraded = AnalysisOutcome::fallback(
            "ethics",
            false,
            &MaestroError::AnalysisTimeout {
                analysis: "ethics".into(),
                timeout_ms: 10,
            },
        );
        assert!(degraded.evidence().is_none());
        assert!(degraded.artifact.text().contains("took too long"));

        let composite = AnalysisOutcome::success("synthesis", true, artifact("x", json!({})));
        assert!(composite.evidence().is_none());
    }

    #[tokio::test]
    async fn test_section_synthesizer_confidence() {
        let outcomes = vec![
            AnalysisOutcome::success("a", false, artifact("A", json!({"confidence": 0.6}))),
            AnalysisOutcome::success("b", false, artifact("B", json!({"confidence": 0.8}))),
        ];
        let s = SectionSynthesizer.synthesize("Question", &outcomes).await.unwrap();
        assert!((s.declared_confidence - 0.7).abs() < 1e-9);
        assert!(s.content.contains("## a\nA"));
        assert!(s.content.contains("## b\nB"));

        let mut with_composite = outcomes.clone();
        with_composite.push(AnalysisOutcome::success(
            "synthesis",
            true,
            artifact("S", json!({"confidence": 0.9})),
        ));
        let s = SectionSynthesizer
            .synthesize("Question", &with_composite)
            .await
            .unwrap();
        assert_eq!(s.declared_confidence, 0.9);

        let s = SectionSynthesizer.synthesize("Question", &[]).await.unwrap();
        assert_eq!(s.declared_confidence, 0.0);
    }

    #[test]
    fn test_registry_fallback() {
        struct Nothing;
        impl AnalysisProvider for Nothing {
            fn analyze(&self, _request: AnalysisRequest) -> StepStream {
                stream::empty().boxed()
            }
        }

        let mut registry = ProviderRegistry::new();
        assert!(registry.get("ethics").is_none());
        registry.set_fallback(Arc::new(Nothing));
        assert!(registry.get("ethics").is_some());
        registry.register("ethics", Arc::new(Nothing));
        assert_eq!(registry.len(), 1);
    }
}
