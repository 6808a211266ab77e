//! Run execution tracking types: step results, escalations, and the final
//! run report.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::Artifact;
use crate::error::ErrorInfo;
use crate::gate::GateOutcome;

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Where a step's output data lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultData {
    /// Small results are carried inside the result itself.
    Inline { value: serde_json::Value },
    /// Large results are persisted to the artifact store.
    Artifact { artifact: Artifact },
}

/// One unit of work (the step, or one batch of it) that needed retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<usize>,
    /// Total executions of this unit, including the first.
    pub attempts: u32,
    /// Error message from the last failed attempt.
    pub last_error: String,
}

/// Final (or in-progress) outcome of one step.
///
/// A `succeeded` result is immutable: re-running the step without a force
/// reset replays it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub item_count: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResultData>,
    /// Connector executions across all units.
    #[serde(default)]
    pub attempts: u32,
    /// Retry records, one per unit that needed more than one attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retries: Vec<RetryRecord>,
    /// Batch indices consolidated into `data` (parallel steps only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_batches: Vec<usize>,
    /// Batch indices dropped after exhausting retries on an optional step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub omitted_batches: Vec<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl StepResult {
    /// A step that has not started.
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            item_count: 0,
            duration_ms: 0,
            data: None,
            attempts: 0,
            retries: Vec::new(),
            completed_batches: Vec::new(),
            omitted_batches: Vec::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    /// A step that ended in `status` with `error` attached.
    pub fn errored(step_id: impl Into<String>, status: StepStatus, error: ErrorInfo) -> Self {
        Self {
            status,
            error: Some(error),
            ..Self::pending(step_id)
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    /// Total retries (executions beyond the first) across all units.
    pub fn retry_count(&self) -> u32 {
        self.retries
            .iter()
            .map(|r| r.attempts.saturating_sub(1))
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Persisted status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Escalated,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Escalated => "escalated",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "escalated" => Ok(RunStatus::Escalated),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// External decision on an escalated gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

impl ReviewDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewDecision::Approve => "approve",
            ReviewDecision::Reject => "reject",
        }
    }
}

impl std::str::FromStr for ReviewDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(ReviewDecision::Approve),
            "reject" => Ok(ReviewDecision::Reject),
            other => Err(format!("unknown review decision '{other}'")),
        }
    }
}

/// A run suspended at a failed `escalate_for_review` gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub stage: String,
    pub failed_checks: Vec<String>,
    pub deadline: DateTime<Utc>,
    /// The stage's succeeded result, recorded as complete only on approval.
    pub pending_result: StepResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ReviewDecision>,
}

/// What `run_workflow` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub definition_id: String,
    pub status: RunStatus,
    /// Every declared step, in execution order.
    pub steps: Vec<StepResult>,
    /// Artifacts produced by this run, newest first.
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<GateOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<Escalation>,
    /// Run-level failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}
