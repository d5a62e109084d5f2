//! Multi-agent analysis orchestration with dependency staging and a quality gate.
//!
//! A request is classified into analysis domains, planned into stages that
//! respect composite dependencies, dispatched to worker agents concurrently
//! within each stage, synthesized, and gated on confidence. Failed analyses
//! degrade to fallback content instead of aborting the task.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Runs the plan, synthesis and gate; serves as an [`AgentExecutor`](maestro_a2a::AgentExecutor).
//! - [`DependencyPlanner`]: Turns a request into an [`ExecutionPlan`].
//! - [`KeywordClassifier`]: Whole-word keyword matching to domains.
//! - [`QualityGate`]: Confidence scoring and approval.
//! - [`AnalysisProvider`]: One analysis, local or remote ([`RemoteAnalysisProvider`]).
//! - [`AnalysisMonitor`]: Per-analysis state and metrics.
//! - [`MaestroConfig`]: `maestro.toml` loading.

/// Request to domain classification.
pub mod classifier;
/// TOML configuration.
pub mod config;
/// Orchestration engine.
pub mod engine;
/// Per-analysis state and metrics.
pub mod monitor;
/// Dependency-staged planning.
pub mod planner;
/// Analysis providers and synthesis.
pub mod provider;
/// Quality gate.
pub mod quality;

pub use classifier::{DomainClassifier, KeywordClassifier};
pub use config::{parse_config, CompositeConfig, DomainConfig, MaestroConfig};
pub use engine::{
    OrchestrationReport, Orchestrator, OrchestratorConfig, RunOutcome, RESULT_ARTIFACT,
};
pub use monitor::{AnalysisMetrics, AnalysisMonitor, AnalysisState, AnalysisStatus, RunResult};
pub use planner::{
    CompositeRule, DependencyPlanner, ExecutionPlan, PlanItem, PlannerConfig, Stage,
};
pub use provider::{
    AgentStep, AnalysisOutcome, AnalysisProvider, AnalysisRequest, ProviderRegistry,
    RemoteAnalysisProvider, SectionSynthesizer, StepStream, Synthesizer,
};
pub use quality::{
    DomainEvidence, QualityConfig, QualityGate, QualityResult, RequestComplexity, Synthesis,
    INSUFFICIENT_EVIDENCE,
};
