use crate::monitor::{AnalysisMonitor, RunResult};
use crate::planner::{DependencyPlanner, ExecutionPlan, PlanItem};
use crate::provider::{
    AgentStep, AnalysisOutcome, AnalysisRequest, ProviderRegistry, SectionSynthesizer,
    Synthesizer,
};
use crate::quality::{DomainEvidence, QualityGate, QualityResult, RequestComplexity, Synthesis};
use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::StreamExt;
use maestro_a2a::{AgentExecutor, RequestContext};
use maestro_core::{Artifact, MaestroError, MaestroResult, Metadata, Part, TaskUpdater};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the single artifact a completed orchestration attaches.
pub const RESULT_ARTIFACT: &str = "orchestration-result";

/// Engine limits.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Upper bound for one plan item, remote call included.
    pub item_timeout: Duration,
    /// Extra plan rounds allowed after the quality gate rejects a result.
    pub max_replan_rounds: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            item_timeout: Duration::from_secs(30),
            max_replan_rounds: 1,
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationReport {
    /// Plan as first computed.
    pub plan: ExecutionPlan,
    /// Latest outcome per analysis, in plan order.
    pub outcomes: Vec<AnalysisOutcome>,
    /// Final synthesis.
    pub synthesis: Synthesis,
    /// Gate verdict on the final synthesis.
    pub quality: QualityResult,
    /// Re-planning rounds that were run.
    pub rounds: u32,
    /// Wall time of the whole run.
    pub duration_ms: u64,
}

/// How [`Orchestrator::run`] left the task.
#[derive(Debug)]
pub enum RunOutcome {
    /// Completed with exactly one result artifact, approved or not.
    Completed(Box<OrchestrationReport>),
    /// Paused on a worker's question.
    InputRequired(String),
}

enum Resolution {
    Completed(Artifact),
    InputRequired(String),
    Failed(MaestroError),
}

enum ItemResult {
    Done(AnalysisOutcome),
    NeedsInput(String),
    /// Aborts the whole run.
    Fatal(MaestroError),
}

/// Plans a request, runs its stages through the analysis providers,
/// synthesizes, and gates the result on quality.
pub struct Orchestrator {
    planner: DependencyPlanner,
    providers: ProviderRegistry,
    synthesizer: Arc<dyn Synthesizer>,
    gate: QualityGate,
    monitor: Arc<AnalysisMonitor>,
    config: OrchestratorConfig,
    // Original request text of tasks waiting for input, by task id.
    paused: Mutex<HashMap<String, String>>,
}

impl Orchestrator {
    /// Orchestrator with the section synthesizer.
    pub fn new(
        planner: DependencyPlanner,
        providers: ProviderRegistry,
        gate: QualityGate,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            planner,
            providers,
            synthesizer: Arc::new(SectionSynthesizer),
            gate,
            monitor: Arc::new(AnalysisMonitor::new()),
            config,
            paused: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the synthesizer.
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    /// Per-analysis status and metrics.
    pub fn monitor(&self) -> &Arc<AnalysisMonitor> {
        &self.monitor
    }

    /// Planner in use.
    pub fn planner(&self) -> &DependencyPlanner {
        &self.planner
    }

    /// Drive one request to a final task state through `updater`.
    ///
    /// Item failures degrade to fallback content, except
    /// [`MaestroError::UnsupportedOperation`] which aborts the run. Errors,
    /// cancellation included, are returned without touching the task; the
    /// caller finalizes it.
    pub async fn run(
        &self,
        request: &str,
        updater: &TaskUpdater,
        cancel: &CancellationToken,
    ) -> MaestroResult<RunOutcome> {
        let start = Instant::now();
        let task_id = updater.task_id().to_string();
        let plan = self.planner.plan(request);
        info!(
            task_id = %task_id,
            stages = plan.stages.len(),
            items = plan.item_count(),
            low_confidence = plan.low_confidence,
            "Orchestrator: plan ready"
        );
        updater
            .start_work(format!(
                "Planned {} analyses in {} stages",
                plan.item_count(),
                plan.stages.len()
            ))
            .await?;

        let complexity = if plan.low_confidence {
            RequestComplexity::Simple
        } else {
            RequestComplexity::from_domain_count(plan.domains.len())
        };
        let mut outcomes: HashMap<String, AnalysisOutcome> = HashMap::new();
        let mut current = plan.clone();
        let mut rounds = 0;

        let (synthesis, quality, evidence) = loop {
            if let Some(question) = self
                .execute_plan(&current, request, updater, cancel, &mut outcomes)
                .await?
            {
                info!(task_id = %task_id, "Orchestrator: analysis needs input");
                updater.request_input(question.clone()).await?;
                return Ok(RunOutcome::InputRequired(question));
            }

            let ordered = in_plan_order(&plan, &outcomes);
            let evidence: Vec<DomainEvidence> =
                ordered.iter().filter_map(AnalysisOutcome::evidence).collect();
            let synthesis = self.synthesizer.synthesize(request, &ordered).await?;
            let quality = self.gate.evaluate(&synthesis, &evidence, complexity);
            info!(
                task_id = %task_id,
                round = rounds,
                approved = quality.approved,
                confidence = quality.confidence_score,
                "Orchestrator: quality gate evaluated"
            );

            if quality.approved
                || !quality.requires_additional_analysis
                || rounds >= self.config.max_replan_rounds
            {
                break (synthesis, quality, evidence);
            }
            let rerun = self.select_rerun(&plan, &outcomes);
            if rerun.is_empty() {
                break (synthesis, quality, evidence);
            }
            rounds += 1;
            warn!(task_id = %task_id, round = rounds, rerun = ?rerun, "Quality gate rejected, re-planning");
            updater
                .start_work(format!(
                    "Re-running {} analyses (round {rounds})",
                    rerun.len()
                ))
                .await?;
            current = self.planner.replan(&plan, &rerun);
        };

        if evidence.is_empty() {
            warn!(
                task_id = %task_id,
                "Orchestrator: every analysis degraded, delivering fallback"
            );
        }

        let report = OrchestrationReport {
            outcomes: in_plan_order(&plan, &outcomes),
            plan,
            synthesis,
            quality,
            rounds,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        self.deliver(&report, updater).await?;
        info!(
            task_id = %task_id,
            duration_ms = report.duration_ms,
            approved = report.quality.approved,
            "Orchestrator: pipeline complete"
        );
        Ok(RunOutcome::Completed(Box::new(report)))
    }

    /// Run stages in order, items of a stage concurrently. Returns the first
    /// question raised by a worker, after the stage it came from resolved.
    async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        request: &str,
        updater: &TaskUpdater,
        cancel: &CancellationToken,
        outcomes: &mut HashMap<String, AnalysisOutcome>,
    ) -> MaestroResult<Option<String>> {
        let total = plan.stages.len();
        for stage in &plan.stages {
            if cancel.is_cancelled() {
                return Err(MaestroError::Cancelled);
            }
            let ids: Vec<&str> = stage.items.iter().map(|i| i.analysis_id.as_str()).collect();
            updater
                .start_work(format!(
                    "Stage {}/{total}: {}",
                    stage.index + 1,
                    ids.join(", ")
                ))
                .await?;

            let runs = stage.items.iter().map(|item| {
                let analysis = AnalysisRequest {
                    analysis_id: item.analysis_id.clone(),
                    request: request.to_string(),
                    context_id: updater.context_id().to_string(),
                    inputs: item
                        .depends_on
                        .iter()
                        .filter_map(|d| outcomes.get(d).map(|o| o.artifact.clone()))
                        .collect(),
                    timeout: self.config.item_timeout,
                };
                self.run_item(item, analysis, updater)
            });
            let results = tokio::select! {
                results = join_all(runs) => results,
                _ = cancel.cancelled() => return Err(MaestroError::Cancelled),
            };

            let mut question = None;
            for result in results {
                match result {
                    ItemResult::Done(outcome) => {
                        outcomes.insert(outcome.analysis_id.clone(), outcome);
                    }
                    ItemResult::NeedsInput(q) => {
                        question.get_or_insert(q);
                    }
                    ItemResult::Fatal(e) => return Err(e),
                }
            }
            if question.is_some() {
                return Ok(question);
            }
        }
        Ok(None)
    }

    async fn run_item(
        &self,
        item: &PlanItem,
        request: AnalysisRequest,
        updater: &TaskUpdater,
    ) -> ItemResult {
        let id = item.analysis_id.as_str();
        let Some(provider) = self.providers.get(id) else {
            let err = MaestroError::Config(format!("no provider for analysis '{id}'"));
            warn!(analysis = %id, "No analysis provider registered");
            return ItemResult::Done(AnalysisOutcome::fallback(id, item.composite, &err));
        };

        let task_id = updater.task_id();
        self.monitor.start(id, task_id).await;
        let started = Instant::now();
        let timeout = self.config.item_timeout;

        let consume = async {
            let mut steps = provider.analyze(request);
            while let Some(step) = steps.next().await {
                match step {
                    AgentStep::Working(progress) => {
                        debug!(analysis = %id, progress = %progress, "Analysis progress");
                        if let Err(e) = updater.start_work(format!("{id}: {progress}")).await {
                            debug!(analysis = %id, error = %e, "Progress update dropped");
                        }
                    }
                    AgentStep::InputRequired(question) => {
                        return Resolution::InputRequired(question)
                    }
                    AgentStep::Completed(artifact) => return Resolution::Completed(artifact),
                    AgentStep::Failed(e) => return Resolution::Failed(e),
                }
            }
            Resolution::Failed(MaestroError::Analysis(format!(
                "{id} ended without a result"
            )))
        };
        let resolution = tokio::time::timeout(timeout, consume)
            .await
            .unwrap_or_else(|_| {
                Resolution::Failed(MaestroError::AnalysisTimeout {
                    analysis: id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            });
        let elapsed = started.elapsed().as_millis() as u64;

        match resolution {
            Resolution::Completed(artifact) => {
                self.monitor.finish(id, task_id, RunResult::Succeeded, elapsed).await;
                info!(analysis = %id, duration_ms = elapsed, "Analysis completed");
                ItemResult::Done(AnalysisOutcome::success(id, item.composite, artifact))
            }
            Resolution::InputRequired(question) => {
                self.monitor
                    .finish(id, task_id, RunResult::InputRequired, elapsed)
                    .await;
                ItemResult::NeedsInput(question)
            }
            Resolution::Failed(e @ MaestroError::UnsupportedOperation(_)) => {
                self.monitor.finish(id, task_id, RunResult::Failed, elapsed).await;
                warn!(analysis = %id, error = %e, "Analysis hit an unsupported operation");
                ItemResult::Fatal(e)
            }
            Resolution::Failed(e) => {
                let result = match e {
                    MaestroError::AnalysisTimeout { .. } => RunResult::TimedOut,
                    _ => RunResult::Failed,
                };
                self.monitor.finish(id, task_id, result, elapsed).await;
                warn!(analysis = %id, error = %e, "Analysis degraded to fallback");
                ItemResult::Done(AnalysisOutcome::fallback(id, item.composite, &e))
            }
        }
    }

    /// Degraded or weakly supported analyses, plus everything depending on them.
    fn select_rerun(
        &self,
        plan: &ExecutionPlan,
        outcomes: &HashMap<String, AnalysisOutcome>,
    ) -> Vec<String> {
        let sufficient = self.gate.config().sufficient_evidence;
        let mut rerun: Vec<String> = plan
            .items()
            .filter(|item| match outcomes.get(&item.analysis_id) {
                None => true,
                Some(o) if o.degraded => true,
                Some(o) => o
                    .evidence()
                    .is_some_and(|e| e.evidence_quality < sufficient),
            })
            .map(|item| item.analysis_id.clone())
            .collect();

        loop {
            let dependents: Vec<String> = plan
                .items()
                .filter(|item| !rerun.contains(&item.analysis_id))
                .filter(|item| item.depends_on.iter().any(|d| rerun.contains(d)))
                .map(|item| item.analysis_id.clone())
                .collect();
            if dependents.is_empty() {
                break;
            }
            rerun.extend(dependents);
        }
        rerun
    }

    /// Attach the single result artifact and complete the task.
    async fn deliver(&self, report: &OrchestrationReport, updater: &TaskUpdater) -> MaestroResult<()> {
        let quality = &report.quality;
        let degraded: Vec<&str> = report
            .outcomes
            .iter()
            .filter(|o| o.degraded)
            .map(|o| o.analysis_id.as_str())
            .collect();

        let mut metadata = Metadata::new();
        metadata.insert("confidence".into(), serde_json::json!(quality.confidence_score));
        metadata.insert("approved".into(), serde_json::json!(quality.approved));
        metadata.insert("issues".into(), serde_json::json!(quality.issues));
        metadata.insert("lowConfidence".into(), serde_json::json!(report.plan.low_confidence));
        metadata.insert("rounds".into(), serde_json::json!(report.rounds));
        metadata.insert("degraded".into(), serde_json::json!(degraded));

        let analyses: Vec<serde_json::Value> = report
            .outcomes
            .iter()
            .map(|o| {
                serde_json::json!({
                    "analysisId": o.analysis_id,
                    "degraded": o.degraded,
                    "error": o.error,
                })
            })
            .collect();
        let parts = vec![
            Part::text(report.synthesis.content.clone()),
            Part::data(serde_json::json!({
                "quality": quality,
                "analyses": analyses,
            })),
        ];
        updater.add_artifact(parts, RESULT_ARTIFACT, metadata).await?;

        let message = if quality.approved {
            format!(
                "Analysis complete with confidence {:.2}",
                quality.confidence_score
            )
        } else {
            format!("Analysis complete with issues: {}", quality.issues.join("; "))
        };
        updater.complete_with_message(message).await
    }
}

fn in_plan_order(
    plan: &ExecutionPlan,
    outcomes: &HashMap<String, AnalysisOutcome>,
) -> Vec<AnalysisOutcome> {
    plan.items()
        .filter_map(|item| outcomes.get(&item.analysis_id).cloned())
        .collect()
}

#[async_trait]
impl AgentExecutor for Orchestrator {
    async fn execute(
        &self,
        ctx: RequestContext,
        updater: Arc<TaskUpdater>,
        cancel: CancellationToken,
    ) -> MaestroResult<()> {
        let answer = ctx.message.text();
        let original = self.paused.lock().remove(&ctx.task_id);
        let request = match original {
            Some(original) if ctx.resumed => format!("{original}\n{answer}"),
            _ => answer,
        };

        if let RunOutcome::InputRequired(_) = self.run(&request, &updater, &cancel).await? {
            self.paused.lock().insert(ctx.task_id, request);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::classifier::KeywordClassifier;
    use crate::planner::{CompositeRule, PlannerConfig};
    use crate::provider::{AnalysisProvider, StepStream};
    use crate::quality::INSUFFICIENT_EVIDENCE;
    use futures_util::stream;
    use maestro_core::{EventQueue, Task, TaskState};

    struct Fixed(f64);

    impl AnalysisProvider for Fixed {
        fn analyze(&self, request: AnalysisRequest) -> StepStream {
            let mut metadata = Metadata::new();
            metadata.insert("evidence_quality".into(), serde_json::json!(self.0));
            let artifact = Artifact::new(
                request.analysis_id.clone(),
                vec![Part::text(format!("{} findings", request.analysis_id))],
                metadata,
            );
            stream::iter([AgentStep::Completed(artifact)]).boxed()
        }
    }

    fn orchestrator(providers: ProviderRegistry, rounds: u32) -> Orchestrator {
        let classifier = Arc::new(
            KeywordClassifier::new([
                ("ethics".to_string(), vec!["ethics".into()]),
                ("healthcare".to_string(), vec!["healthcare".into()]),
            ])
            .unwrap(),
        );
        let planner = DependencyPlanner::new(
            classifier,
            vec![CompositeRule::new("synthesis", 2)],
            PlannerConfig::default(),
        )
        .unwrap();
        Orchestrator::new(
            planner,
            providers,
            QualityGate::default(),
            OrchestratorConfig {
                item_timeout: Duration::from_millis(200),
                max_replan_rounds: rounds,
            },
        )
    }

    fn updater() -> (TaskUpdater, Arc<EventQueue>) {
        let queue = Arc::new(EventQueue::new(256));
        queue.start().unwrap();
        (TaskUpdater::new(Task::new(), queue.clone()), queue)
    }

    #[tokio::test]
    async fn test_missing_provider_delivers_unapproved_fallback() {
        let orch = orchestrator(ProviderRegistry::new(), 1);
        let (updater, queue) = updater();
        let outcome = orch
            .run("ethics of healthcare triage", &updater, &CancellationToken::new())
            .await
            .unwrap();
        queue.stop().await;

        let RunOutcome::Completed(report) = outcome else {
            panic!("expected the fallback result to be delivered");
        };
        assert!(!report.quality.approved);
        assert!(report
            .quality
            .issues
            .iter()
            .any(|i| i == INSUFFICIENT_EVIDENCE));
        assert!(report.outcomes.iter().all(|o| o.degraded));

        assert_eq!(updater.state(), TaskState::Completed);
        let artifacts = updater.artifacts();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].metadata_bool("approved"), Some(false));
        assert!(updater
            .task()
            .message()
            .unwrap()
            .text()
            .contains(INSUFFICIENT_EVIDENCE));
    }

    #[tokio::test]
    async fn test_select_rerun_includes_dependents() {
        let mut providers = ProviderRegistry::new();
        providers.set_fallback(Arc::new(Fixed(0.9)));
        let orch = orchestrator(providers, 1);
        let plan = orch.planner().plan("ethics of healthcare triage");

        let mut outcomes = HashMap::new();
        let ok = |id: &str, q: f64| {
            let mut meta = Metadata::new();
            meta.insert("evidence_quality".into(), serde_json::json!(q));
            AnalysisOutcome::success(id, false, Artifact::new(id, vec![], meta))
        };
        outcomes.insert("ethics".to_string(), ok("ethics", 0.9));
        outcomes.insert("healthcare".to_string(), ok("healthcare", 0.2));
        outcomes.insert(
            "synthesis".to_string(),
            AnalysisOutcome::success("synthesis", true, Artifact::new("s", vec![], Metadata::new())),
        );

        let rerun = orch.select_rerun(&plan, &outcomes);
        assert_eq!(rerun, vec!["healthcare".to_string(), "synthesis".to_string()]);
    }

    struct Unsupported;

    impl AnalysisProvider for Unsupported {
        fn analyze(&self, _request: AnalysisRequest) -> StepStream {
            stream::iter([AgentStep::Failed(MaestroError::UnsupportedOperation(
                "tasks/resubscribe".into(),
            ))])
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_unsupported_operation_aborts_the_run() {
        let mut providers = ProviderRegistry::new();
        providers.set_fallback(Arc::new(Fixed(0.9)));
        providers.register("ethics", Arc::new(Unsupported));
        let orch = orchestrator(providers, 1);
        let (updater, queue) = updater();

        let err = orch
            .run("ethics of healthcare triage", &updater, &CancellationToken::new())
            .await
            .unwrap_err();
        queue.stop().await;
        assert!(matches!(err, MaestroError::UnsupportedOperation(_)));
        assert_eq!(updater.state(), TaskState::Working);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_stage() {
        let mut providers = ProviderRegistry::new();
        providers.set_fallback(Arc::new(Fixed(0.9)));
        let orch = orchestrator(providers, 1);
        let (updater, queue) = updater();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orch
            .run("ethics of healthcare triage", &updater, &cancel)
            .await
            .unwrap_err();
        queue.stop().await;
        assert!(matches!(err, MaestroError::Cancelled));
        assert_eq!(orch.monitor().aggregate_metrics().await.runs, 0);
    }
}
