//! Quality gate for synthesized results.
//!
//! The confidence score combines the synthesizer's declared confidence with
//! an evidence score over the analyzed domains:
//!
//! ```text
//! evidence   = mean(min(quality / sufficient_evidence, 1))
//! confidence = clamp(w_s * declared + w_e * evidence - bias_penalty * biased, 0, 1)
//! ```
//!
//! Each domain's contribution saturates at `sufficient_evidence`, so adding
//! a domain whose evidence reaches that level never lowers the score.

use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};

/// Issue reported when no analyzed domain produced evidence.
pub const INSUFFICIENT_EVIDENCE: &str = "insufficient evidence";

/// Weights and thresholds of the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Weight of the declared synthesis confidence.
    pub synthesis_weight: f64,
    /// Weight of the evidence score.
    pub evidence_weight: f64,
    /// Subtracted once per domain with a bias flag.
    pub bias_penalty: f64,
    /// Confidence needed for approval.
    pub min_confidence: f64,
    /// Evidence quality at which a domain counts as fully supported.
    pub sufficient_evidence: f64,
    /// Domains required for a simple request.
    pub min_domains_simple: usize,
    /// Domains required for a moderate request.
    pub min_domains_moderate: usize,
    /// Domains required for a complex request.
    pub min_domains_complex: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            synthesis_weight: 0.4,
            evidence_weight: 0.6,
            bias_penalty: 0.1,
            min_confidence: 0.7,
            sufficient_evidence: 0.7,
            min_domains_simple: 1,
            min_domains_moderate: 2,
            min_domains_complex: 3,
        }
    }
}

impl QualityConfig {
    /// Weights in `[0, 1]` summing to 1, thresholds in `[0, 1]`.
    pub fn validate(&self) -> MaestroResult<()> {
        let unit = [
            ("synthesis_weight", self.synthesis_weight),
            ("evidence_weight", self.evidence_weight),
            ("bias_penalty", self.bias_penalty),
            ("min_confidence", self.min_confidence),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(MaestroError::Config(format!(
                    "quality.{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if !(self.sufficient_evidence > 0.0 && self.sufficient_evidence <= 1.0) {
            return Err(MaestroError::Config(format!(
                "quality.sufficient_evidence must be within (0, 1], got {}",
                self.sufficient_evidence
            )));
        }
        Ok(())
    }

    /// Domains required for `complexity`.
    pub fn min_domains(&self, complexity: RequestComplexity) -> usize {
        match complexity {
            RequestComplexity::Simple => self.min_domains_simple,
            RequestComplexity::Moderate => self.min_domains_moderate,
            RequestComplexity::Complex => self.min_domains_complex,
        }
    }
}

/// How broad a request is, judged by the number of base domains planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestComplexity {
    /// One domain.
    Simple,
    /// Two domains.
    Moderate,
    /// Three or more domains.
    Complex,
}

impl RequestComplexity {
    /// Complexity implied by the number of matched domains.
    pub fn from_domain_count(domains: usize) -> Self {
        match domains {
            0 | 1 => Self::Simple,
            2 => Self::Moderate,
            _ => Self::Complex,
        }
    }
}

/// Evidence reported by one domain analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvidence {
    /// Domain analyzed.
    pub domain: String,
    /// Evidence quality in `[0, 1]`.
    pub evidence_quality: f64,
    /// Whether the worker flagged bias.
    pub bias_detected: bool,
}

impl DomainEvidence {
    /// Unbiased evidence.
    pub fn new(domain: impl Into<String>, evidence_quality: f64) -> Self {
        Self {
            domain: domain.into(),
            evidence_quality,
            bias_detected: false,
        }
    }

    /// Flag bias.
    pub fn biased(mut self) -> Self {
        self.bias_detected = true;
        self
    }
}

/// The combined answer and the confidence its producer declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Synthesis {
    /// Merged text.
    pub content: String,
    /// Confidence the synthesizer declared.
    pub declared_confidence: f64,
}

/// Verdict for one synthesis attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityResult {
    /// Whether the result passes.
    pub approved: bool,
    /// Combined score in `[0, 1]`.
    pub confidence_score: f64,
    /// Readable reasons the result falls short.
    pub issues: Vec<String>,
    /// Whether a re-plan could help.
    pub requires_additional_analysis: bool,
}

/// Scores a synthesis and its evidence.
pub struct QualityGate {
    config: QualityConfig,
}

impl QualityGate {
    /// Gate with `config`.
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    /// Weights and thresholds.
    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Mean per-domain evidence, each capped at 1.
    pub fn evidence_score(&self, evidence: &[DomainEvidence]) -> f64 {
        if evidence.is_empty() {
            return 0.0;
        }
        let total: f64 = evidence
            .iter()
            .map(|e| (e.evidence_quality.max(0.0) / self.config.sufficient_evidence).min(1.0))
            .sum();
        total / evidence.len() as f64
    }

    /// Score `synthesis` against `evidence`.
    pub fn evaluate(
        &self,
        synthesis: &Synthesis,
        evidence: &[DomainEvidence],
        complexity: RequestComplexity,
    ) -> QualityResult {
        let cfg = &self.config;
        let has_evidence = evidence.iter().any(|e| e.evidence_quality > 0.0);
        let biased: Vec<&str> = evidence
            .iter()
            .filter(|e| e.bias_detected)
            .map(|e| e.domain.as_str())
            .collect();

        let raw = cfg.synthesis_weight * synthesis.declared_confidence.clamp(0.0, 1.0)
            + cfg.evidence_weight * self.evidence_score(evidence)
            - cfg.bias_penalty * biased.len() as f64;
        let confidence_score = raw.clamp(0.0, 1.0);

        let required = cfg.min_domains(complexity);
        let mut issues = Vec::new();
        if !has_evidence {
            issues.push(INSUFFICIENT_EVIDENCE.to_string());
        }
        if confidence_score < cfg.min_confidence {
            issues.push(format!(
                "confidence {confidence_score:.2} is below the {:.2} threshold",
                cfg.min_confidence
            ));
        }
        if evidence.len() < required {
            issues.push(format!(
                "{} of {required} required domains analyzed",
                evidence.len()
            ));
        }
        for domain in &biased {
            issues.push(format!("bias detected in {domain}"));
        }

        let approved =
            has_evidence && confidence_score >= cfg.min_confidence && evidence.len() >= required;

        QualityResult {
            approved,
            confidence_score,
            issues,
            requires_additional_analysis: !approved,
        }
    }
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::new(QualityConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn synthesis(declared: f64) -> Synthesis {
        Synthesis {
            content: "combined".into(),
            declared_confidence: declared,
        }
    }

    #[test]
    fn test_approves_well_supported_complex_request() {
        let gate = QualityGate::default();
        let evidence = vec![
            DomainEvidence::new("technology", 0.8),
            DomainEvidence::new("ethics", 0.75),
            DomainEvidence::new("healthcare", 0.9),
        ];
        let result = gate.evaluate(&synthesis(0.85), &evidence, RequestComplexity::Complex);
        assert!(result.approved);
        assert!(result.confidence_score >= 0.7);
        assert!(result.issues.is_empty());
        assert!(!result.requires_additional_analysis);
    }

    #[test]
    fn test_zero_evidence() {
        let gate = QualityGate::default();
        for evidence in [vec![], vec![DomainEvidence::new("ethics", 0.0)]] {
            let result = gate.evaluate(&synthesis(1.0), &evidence, RequestComplexity::Simple);
            assert!(!result.approved);
            assert!(result.requires_additional_analysis);
            assert!(result.issues.iter().any(|i| i == INSUFFICIENT_EVIDENCE));
        }
    }

    #[test]
    fn test_too_few_domains_for_complexity() {
        let gate = QualityGate::default();
        let evidence = vec![DomainEvidence::new("a", 0.9), DomainEvidence::new("b", 0.9)];
        let result = gate.evaluate(&synthesis(0.9), &evidence, RequestComplexity::Complex);
        assert!(result.confidence_score >= 0.7);
        assert!(!result.approved);
        assert!(result.requires_additional_analysis);
        assert_eq!(result.issues, vec!["2 of 3 required domains analyzed"]);
    }

    #[test]
    fn test_bias_penalty_per_domain() {
        let gate = QualityGate::default();
        let clean = vec![DomainEvidence::new("a", 0.7), DomainEvidence::new("b", 0.7)];
        let biased = vec![
            DomainEvidence::new("a", 0.7).biased(),
            DomainEvidence::new("b", 0.7).biased(),
        ];
        let base = gate.evaluate(&synthesis(0.5), &clean, RequestComplexity::Moderate);
        let penalized = gate.evaluate(&synthesis(0.5), &biased, RequestComplexity::Moderate);
        assert!((base.confidence_score - penalized.confidence_score - 0.2).abs() < 1e-9);
        assert!(penalized.issues.contains(&"bias detected in a".to_string()));
    }

    #[test]
    fn test_score_is_clamped() {
        let gate = QualityGate::new(QualityConfig {
            synthesis_weight: 1.0,
            evidence_weight: 1.0,
            bias_penalty: 1.0,
            ..QualityConfig::default()
        });
        let high = gate.evaluate(
            &synthesis(1.0),
            &[DomainEvidence::new("a", 1.0)],
            RequestComplexity::Simple,
        );
        assert_eq!(high.confidence_score, 1.0);
        let low = gate.evaluate(
            &synthesis(0.0),
            &[DomainEvidence::new("a", 0.1).biased()],
            RequestComplexity::Simple,
        );
        assert_eq!(low.confidence_score, 0.0);
    }

    #[test]
    fn test_confidence_non_decreasing_with_sufficient_domain() {
        let gate = QualityGate::default();
        let threshold = gate.config().sufficient_evidence;
        let qualities = [0.0, 0.1, 0.35, 0.5, 0.69, 0.7, 0.95, 1.0];

        for declared in [0.0, 0.3, 0.6, 1.0] {
            for &q1 in &qualities {
                for &q2 in &qualities {
                    let before = vec![DomainEvidence::new("a", q1), DomainEvidence::new("b", q2)];
                    for added in [threshold, 0.85, 1.0] {
                        let mut after = before.clone();
                        after.push(DomainEvidence::new("c", added));
                        let s1 = gate
                            .evaluate(&synthesis(declared), &before, RequestComplexity::Moderate)
                            .confidence_score;
                        let s2 = gate
                            .evaluate(&synthesis(declared), &after, RequestComplexity::Moderate)
                            .confidence_score;
                        assert!(s2 + 1e-12 >= s1, "{s2} < {s1} for q=({q1},{q2}) added={added}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_complexity_from_domain_count() {
        assert_eq!(RequestComplexity::from_domain_count(1), RequestComplexity::Simple);
        assert_eq!(RequestComplexity::from_domain_count(2), RequestComplexity::Moderate);
        assert_eq!(RequestComplexity::from_domain_count(5), RequestComplexity::Complex);
        assert_eq!(QualityConfig::default().min_domains(RequestComplexity::Complex), 3);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let cfg = QualityConfig {
            evidence_weight: 1.5,
            ..QualityConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(MaestroError::Config(_))));
        let cfg = QualityConfig {
            sufficient_evidence: 0.0,
            ..QualityConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(QualityConfig::default().validate().is_ok());
    }
}
