//! Quality Gate: declarative rules evaluated per raw record, routing each record to
//! accept / accept-with-warnings / quarantine / reject.

pub mod predicates;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::domain::RawRecord;
use crate::error::{PipelineError, Result};
pub use predicates::{FieldCheck, Predicate};

/// Severity of a rule, i.e. what a failure of that rule does to the record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QualitySeverity {
    Warn,
    Quarantine,
    Reject,
}

/// Outcome of evaluating one rule against one record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerdictOutcome {
    Pass,
    Warn,
    Quarantine,
    Reject,
}

impl VerdictOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictOutcome::Pass => "pass",
            VerdictOutcome::Warn => "warn",
            VerdictOutcome::Quarantine => "quarantine",
            VerdictOutcome::Reject => "reject",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, VerdictOutcome::Pass)
    }
}

impl From<QualitySeverity> for VerdictOutcome {
    fn from(severity: QualitySeverity) -> Self {
        match severity {
            QualitySeverity::Warn => VerdictOutcome::Warn,
            QualitySeverity::Quarantine => VerdictOutcome::Quarantine,
            QualitySeverity::Reject => VerdictOutcome::Reject,
        }
    }
}

impl fmt::Display for VerdictOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerdictOutcome {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pass" => Ok(VerdictOutcome::Pass),
            "warn" => Ok(VerdictOutcome::Warn),
            "quarantine" => Ok(VerdictOutcome::Quarantine),
            "reject" => Ok(VerdictOutcome::Reject),
            other => Err(PipelineError::Store(format!("unknown verdict outcome '{}'", other))),
        }
    }
}

/// Write-once audit entry, one per (record, rule, rule version)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub record_id: String,
    pub rule_name: String,
    pub rule_version: String,
    pub outcome: VerdictOutcome,
    pub reason: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

/// Routing decision for a record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QualityDecision {
    /// No rule failed
    Accept,
    /// Only warn-severity rules failed; the record proceeds
    AcceptWithWarnings,
    /// Held in the quarantine side channel until re-validated
    Quarantine,
    /// Excluded from every downstream tier
    Reject,
}

impl QualityDecision {
    pub fn proceeds(&self) -> bool {
        matches!(self, QualityDecision::Accept | QualityDecision::AcceptWithWarnings)
    }
}

/// Result of running the gate over one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateAssessment {
    pub record_id: String,
    pub decision: QualityDecision,
    pub verdicts: Vec<ValidationVerdict>,
}

impl GateAssessment {
    /// Verdicts whose rule did not pass
    pub fn failures(&self) -> impl Iterator<Item = &ValidationVerdict> {
        self.verdicts.iter().filter(|v| v.outcome.is_failure())
    }

    pub fn failure_summary(&self) -> String {
        self.failures()
            .map(|v| format!("{}: {}", v.rule_name, v.reason.as_deref().unwrap_or("failed")))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Reduce verdict outcomes into a disposition: reject > quarantine > warn > accept
pub fn decide(verdicts: &[ValidationVerdict]) -> QualityDecision {
    let mut decision = QualityDecision::Accept;
    for verdict in verdicts {
        decision = match (verdict.outcome, decision) {
            (VerdictOutcome::Reject, _) => return QualityDecision::Reject,
            (VerdictOutcome::Quarantine, _) => QualityDecision::Quarantine,
            (VerdictOutcome::Warn, QualityDecision::Accept) => QualityDecision::AcceptWithWarnings,
            (_, current) => current,
        };
    }
    decision
}

/// One configured rule as it appears in TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub field: String,
    pub severity: QualitySeverity,
    #[serde(flatten)]
    pub predicate: Predicate,
}

/// Versioned rule set section of the pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    pub version: String,
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleConfig>,
}

/// A compiled rule: a named field check with a severity
#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub name: String,
    pub field: String,
    pub severity: QualitySeverity,
    check: Arc<dyn FieldCheck>,
}

impl ValidationRule {
    pub fn from_config(config: &RuleConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            field: config.field.clone(),
            severity: config.severity,
            check: config.predicate.compile()?,
        })
    }

    /// Register a rule backed by a check implemented in code
    pub fn custom(
        name: impl Into<String>,
        field: impl Into<String>,
        severity: QualitySeverity,
        check: Arc<dyn FieldCheck>,
    ) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
            severity,
            check,
        }
    }

    pub fn describe(&self) -> String {
        format!("{} ({} {})", self.name, self.field, self.check.describe())
    }
}

/// Trait for implementing Quality Gate assessment logic
pub trait QualityGate: Send + Sync {
    /// Evaluate every rule against the record. Never fails: rule failures are verdicts.
    fn assess(&self, record: &RawRecord) -> GateAssessment;

    fn rule_version(&self) -> &str;
}

/// Gate that evaluates an ordered list of rules with one generic evaluator
#[derive(Debug, Clone)]
pub struct RuleQualityGate {
    rule_version: String,
    rules: Vec<ValidationRule>,
}

impl RuleQualityGate {
    pub fn new(rule_version: impl Into<String>, rules: Vec<ValidationRule>) -> Self {
        Self {
            rule_version: rule_version.into(),
            rules,
        }
    }

    pub fn from_config(config: &RulesConfig) -> Result<Self> {
        let rules = config
            .rules
            .iter()
            .map(ValidationRule::from_config)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(config.version.clone(), rules))
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[ValidationRule] {
        &self.rules
    }
}

impl QualityGate for RuleQualityGate {
    fn assess(&self, record: &RawRecord) -> GateAssessment {
        let evaluated_at = Utc::now();
        let verdicts: Vec<ValidationVerdict> = self
            .rules
            .iter()
            .map(|rule| {
                let (outcome, reason) = match rule.check.check(record.field(&rule.field)) {
                    Ok(()) => (VerdictOutcome::Pass, None),
                    Err(reason) => (VerdictOutcome::from(rule.severity), Some(reason)),
                };
                ValidationVerdict {
                    record_id: record.record_id.clone(),
                    rule_name: rule.name.clone(),
                    rule_version: self.rule_version.clone(),
                    outcome,
                    reason,
                    evaluated_at,
                }
            })
            .collect();

        let decision = decide(&verdicts);
        if !decision.proceeds() {
            tracing::debug!(
                record_id = %record.record_id,
                decision = ?decision,
                "record held back by quality gate"
            );
        }

        GateAssessment {
            record_id: record.record_id.clone(),
            decision,
            verdicts,
        }
    }

    fn rule_version(&self) -> &str {
        &self.rule_version
    }
}
