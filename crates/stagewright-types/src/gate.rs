//! Quality gate types.
//!
//! A gate guards one stage: after the stage succeeds, every check runs against
//! its result and the configured policy decides whether the run advances.

use serde::{Deserialize, Serialize};

/// Declared gate for a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateDefinition {
    /// Step id this gate guards.
    pub stage: String,
    /// Checks evaluated in order. All are evaluated; none short-circuit.
    pub checks: Vec<GateCheck>,
    #[serde(default)]
    pub policy: GatePolicy,
    /// Review deadline for `escalate_for_review` (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
}

/// A named boolean predicate over a stage's output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum GateCheck {
    /// The stage produced at least `min` items.
    MinItems {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        min: u64,
    },
    /// Every item (or the data object itself) carries each field.
    RequiredFields {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        fields: Vec<String>,
    },
    /// Every item's numeric `field` is at least `min`.
    ScoreThreshold {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        field: String,
        min: f64,
    },
    /// At most `max` batches were omitted from consolidation.
    MaxOmittedBatches {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        max: usize,
    },
}

impl GateCheck {
    /// Name reported in `failed_checks`: the declared name, else the check kind.
    pub fn name(&self) -> &str {
        let (declared, kind) = match self {
            GateCheck::MinItems { name, .. } => (name, "min_items"),
            GateCheck::RequiredFields { name, .. } => (name, "required_fields"),
            GateCheck::ScoreThreshold { name, .. } => (name, "score_threshold"),
            GateCheck::MaxOmittedBatches { name, .. } => (name, "max_omitted_batches"),
        };
        declared.as_deref().unwrap_or(kind)
    }
}

/// What the run does when a gate fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    /// Halt the run as failed.
    #[default]
    Abort,
    /// Record a warning and advance.
    WarnAndContinue,
    /// Suspend the run until an approve/reject decision is recorded.
    EscalateForReview,
}

/// Result of evaluating one gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateOutcome {
    pub stage: String,
    pub passed: bool,
    pub failed_checks: Vec<String>,
    pub policy: GatePolicy,
}
