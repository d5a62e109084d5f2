use crate::classifier::DomainClassifier;
use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// A composite analysis that needs several base domains to have run first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeRule {
    /// Id of the composite analysis.
    pub analysis_id: String,
    /// Domains that count toward `min_domains`. Empty means any matched domain.
    #[serde(default)]
    pub domains: Vec<String>,
    /// Matched domains required for the rule to fire.
    #[serde(default = "default_min_domains")]
    pub min_domains: usize,
    /// Other composite analyses that must run before this one.
    #[serde(default)]
    pub after_analyses: Vec<String>,
}

fn default_min_domains() -> usize {
    2
}

impl CompositeRule {
    /// Rule over any matched domain.
    pub fn new(analysis_id: impl Into<String>, min_domains: usize) -> Self {
        Self {
            analysis_id: analysis_id.into(),
            domains: Vec::new(),
            min_domains,
            after_analyses: Vec::new(),
        }
    }

    /// Count only `domains` toward `min_domains`.
    pub fn over_domains(mut self, domains: &[&str]) -> Self {
        self.domains = domains.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Also wait for other composites.
    pub fn after(mut self, analyses: &[&str]) -> Self {
        self.after_analyses = analyses.iter().map(|a| a.to_string()).collect();
        self
    }
}

/// One analysis scheduled in a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanItem {
    /// Analysis to run.
    pub analysis_id: String,
    /// Analyses whose results this item consumes.
    pub depends_on: Vec<String>,
    /// Composite (cross-domain) analysis rather than a base domain.
    pub composite: bool,
}

impl PlanItem {
    fn domain(id: impl Into<String>) -> Self {
        Self {
            analysis_id: id.into(),
            depends_on: Vec::new(),
            composite: false,
        }
    }
}

/// Items that may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Position in the plan, from 0.
    pub index: usize,
    /// Items run concurrently.
    pub items: Vec<PlanItem>,
}

/// Dependency-ordered stages for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    /// Stages in execution order.
    pub stages: Vec<Stage>,
    /// Base domains the request was classified into.
    pub domains: Vec<String>,
    /// Set when the plan is the default-domain fallback.
    pub low_confidence: bool,
}

impl ExecutionPlan {
    /// Number of items across stages.
    pub fn item_count(&self) -> usize {
        self.stages.iter().map(|s| s.items.len()).sum()
    }

    /// Items in stage order.
    pub fn items(&self) -> impl Iterator<Item = &PlanItem> {
        self.stages.iter().flat_map(|s| s.items.iter())
    }

    /// Stage index of an analysis, if planned.
    pub fn stage_of(&self, analysis_id: &str) -> Option<usize> {
        self.stages
            .iter()
            .find(|s| s.items.iter().any(|i| i.analysis_id == analysis_id))
            .map(|s| s.index)
    }
}

/// Thresholds for the low-confidence fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Minimum request length in characters.
    pub min_request_chars: usize,
    /// Minimum request length in words.
    pub min_request_words: usize,
    /// Domain used when the request is too short or unmatched.
    pub default_domain: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_request_chars: 8,
            min_request_words: 2,
            default_domain: "general".to_string(),
        }
    }
}

/// Turns a request into an [`ExecutionPlan`].
pub struct DependencyPlanner {
    classifier: Arc<dyn DomainClassifier>,
    rules: Vec<CompositeRule>,
    config: PlannerConfig,
}

impl DependencyPlanner {
    /// Validates the rule set: unique ids, `min_domains >= 2`, known
    /// `after_analyses` references and no cycles.
    pub fn new(
        classifier: Arc<dyn DomainClassifier>,
        rules: Vec<CompositeRule>,
        config: PlannerConfig,
    ) -> MaestroResult<Self> {
        let mut ids = HashSet::new();
        for rule in &rules {
            if !ids.insert(rule.analysis_id.as_str()) {
                return Err(MaestroError::Config(format!(
                    "duplicate composite analysis '{}'",
                    rule.analysis_id
                )));
            }
            if rule.min_domains < 2 {
                return Err(MaestroError::Config(format!(
                    "composite '{}' needs min_domains >= 2, got {}",
                    rule.analysis_id, rule.min_domains
                )));
            }
        }
        for rule in &rules {
            if let Some(unknown) = rule
                .after_analyses
                .iter()
                .find(|a| !ids.contains(a.as_str()))
            {
                return Err(MaestroError::Config(format!(
                    "composite '{}' runs after unknown analysis '{unknown}'",
                    rule.analysis_id
                )));
            }
        }
        if has_cycle(&rules) {
            return Err(MaestroError::Config(
                "composite rules contain a dependency cycle".into(),
            ));
        }
        Ok(Self {
            classifier,
            rules,
            config,
        })
    }

    /// Composite rules in firing order.
    pub fn rules(&self) -> &[CompositeRule] {
        &self.rules
    }

    /// Plan a request. Never returns an empty plan.
    pub fn plan(&self, request: &str) -> ExecutionPlan {
        let text = request.trim();
        let words = text.split_whitespace().count();
        if text.chars().count() < self.config.min_request_chars
            || words < self.config.min_request_words
        {
            info!(chars = text.chars().count(), words, "Request too short, using fallback plan");
            return self.fallback();
        }

        let domains = self.classifier.classify(text);
        if domains.is_empty() {
            info!("No domain matched, using fallback plan");
            return self.fallback();
        }

        let mut items: Vec<PlanItem> = domains.iter().map(PlanItem::domain).collect();
        items.extend(self.fire_rules(&domains));
        let plan = ExecutionPlan {
            stages: assign_stages(items),
            domains,
            low_confidence: false,
        };
        debug!(stages = plan.stages.len(), items = plan.item_count(), "Execution plan built");
        plan
    }

    /// Follow-up plan containing only `rerun`, in the original stage order.
    pub fn replan(&self, plan: &ExecutionPlan, rerun: &[String]) -> ExecutionPlan {
        let stages = plan
            .stages
            .iter()
            .filter_map(|stage| {
                let items: Vec<PlanItem> = stage
                    .items
                    .iter()
                    .filter(|i| rerun.contains(&i.analysis_id))
                    .cloned()
                    .collect();
                (!items.is_empty()).then_some(items)
            })
            .enumerate()
            .map(|(index, items)| Stage { index, items })
            .collect();
        ExecutionPlan {
            stages,
            domains: plan.domains.clone(),
            low_confidence: plan.low_confidence,
        }
    }

    fn fallback(&self) -> ExecutionPlan {
        ExecutionPlan {
            stages: vec![Stage {
                index: 0,
                items: vec![PlanItem::domain(&self.config.default_domain)],
            }],
            domains: vec![self.config.default_domain.clone()],
            low_confidence: true,
        }
    }

    /// Composite items whose conditions hold, in declaration order.
    fn fire_rules(&self, domains: &[String]) -> Vec<PlanItem> {
        let mut fired: HashMap<&str, PlanItem> = HashMap::new();
        // Rules may reference rules declared later, so iterate to a fixpoint.
        loop {
            let before = fired.len();
            for rule in &self.rules {
                if fired.contains_key(rule.analysis_id.as_str()) {
                    continue;
                }
                let relevant: Vec<String> = domains
                    .iter()
                    .filter(|d| rule.domains.is_empty() || rule.domains.contains(*d))
                    .cloned()
                    .collect();
                let ready = relevant.len() >= rule.min_domains
                    && rule
                        .after_analyses
                        .iter()
                        .all(|a| fired.contains_key(a.as_str()));
                if ready {
                    let mut depends_on = relevant;
                    depends_on.extend(rule.after_analyses.iter().cloned());
                    fired.insert(
                        &rule.analysis_id,
                        PlanItem {
                            analysis_id: rule.analysis_id.clone(),
                            depends_on,
                            composite: true,
                        },
                    );
                }
            }
            if fired.len() == before {
                break;
            }
        }
        self.rules
            .iter()
            .filter_map(|r| fired.remove(r.analysis_id.as_str()))
            .collect()
    }
}

/// Stage 0 for items without dependencies, otherwise one past the latest
/// dependency. Input must be acyclic.
fn assign_stages(items: Vec<PlanItem>) -> Vec<Stage> {
    let mut level: HashMap<String, usize> = HashMap::new();
    // Resolved in rounds: a composite may depend on one listed after it.
    let mut remaining = items.clone();
    while !remaining.is_empty() {
        let before = remaining.len();
        remaining.retain(|item| {
            let deps: Option<Vec<usize>> = item
                .depends_on
                .iter()
                .map(|d| level.get(d).copied())
                .collect();
            match deps {
                Some(deps) => {
                    let stage = deps.iter().max().map_or(0, |m| m + 1);
                    level.insert(item.analysis_id.clone(), stage);
                    false
                }
                None => true,
            }
        });
        if remaining.len() == before {
            break;
        }
    }

    let depth = level.values().max().map_or(0, |m| m + 1);
    let mut stages: Vec<Stage> = (0..depth)
        .map(|index| Stage {
            index,
            items: Vec::new(),
        })
        .collect();
    for item in items {
        if let Some(&stage) = level.get(&item.analysis_id) {
            stages[stage].items.push(item);
        }
    }
    stages
}

/// DFS over `after_analyses` edges: 1 = on the current path, 2 = done.
fn has_cycle(rules: &[CompositeRule]) -> bool {
    let edges: HashMap<&str, &[String]> = rules
        .iter()
        .map(|r| (r.analysis_id.as_str(), r.after_analyses.as_slice()))
        .collect();
    let mut visited: HashMap<&str, u8> = HashMap::new();
    rules
        .iter()
        .any(|r| dfs_cycle(r.analysis_id.as_str(), &edges, &mut visited))
}

fn dfs_cycle<'a>(
    id: &'a str,
    edges: &HashMap<&'a str, &'a [String]>,
    visited: &mut HashMap<&'a str, u8>,
) -> bool {
    match visited.get(id) {
        Some(1) => return true,
        Some(2) => return false,
        _ => {}
    }
    visited.insert(id, 1);
    if let Some(deps) = edges.get(id) {
        for dep in deps.iter() {
            if dfs_cycle(dep.as_str(), edges, visited) {
                return true;
            }
        }
    }
    visited.insert(id, 2);
    false
}
