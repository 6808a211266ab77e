//! Checkpoint Store port.
//!
//! Durable record of run progress. Writes are append-only and atomic at the
//! granularity of one fact (a stage, a batch, an identifier, a status), so a
//! crash can lose the latest write but never expose a half-completed stage.
//! Loading an unknown run id yields an empty record, which makes "resume" and
//! "start fresh" the same code path.

use std::collections::BTreeSet;
use std::future::Future;

use stagewright_types::artifact::Artifact;
use stagewright_types::checkpoint::CheckpointRecord;
use stagewright_types::error::ErrorClass;
use stagewright_types::run::{Escalation, ReviewDecision, RunReport, RunStatus, StepResult};
use uuid::Uuid;

/// Errors from checkpoint persistence.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint storage error: {0}")]
    Repository(String),

    #[error("corrupt checkpoint data: {0}")]
    Serialization(String),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {0} is not awaiting a review decision")]
    NotEscalated(Uuid),
}

impl CheckpointError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CheckpointError::Repository(_) | CheckpointError::Serialization(_) => {
                ErrorClass::Storage
            }
            CheckpointError::RunNotFound(_) | CheckpointError::NotEscalated(_) => {
                ErrorClass::Validation
            }
        }
    }
}

/// A run-level status write.
#[derive(Debug, Clone, Copy)]
pub struct RunStatusUpdate<'a> {
    pub run_id: Uuid,
    pub definition_id: &'a str,
    pub status: RunStatus,
    /// Replaces the stored escalation (`None` clears it).
    pub escalation: Option<&'a Escalation>,
    /// Replaces the stored report (`None` clears it).
    pub report: Option<&'a RunReport>,
}

impl<'a> RunStatusUpdate<'a> {
    pub fn new(run_id: Uuid, definition_id: &'a str, status: RunStatus) -> Self {
        Self {
            run_id,
            definition_id,
            status,
            escalation: None,
            report: None,
        }
    }

    pub fn with_escalation(mut self, escalation: &'a Escalation) -> Self {
        self.escalation = Some(escalation);
        self
    }

    pub fn with_report(mut self, report: &'a RunReport) -> Self {
        self.report = Some(report);
        self
    }
}

/// Durable storage of run progress.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
/// Implementations must tolerate concurrent calls from batch workers.
pub trait CheckpointStore: Send + Sync {
    /// Load the record for `run_id`. Unknown runs yield an empty record.
    fn load(
        &self,
        run_id: Uuid,
    ) -> impl Future<Output = Result<CheckpointRecord, CheckpointError>> + Send;

    /// Mark a stage complete together with its succeeded result.
    ///
    /// Recording an already-complete stage is a no-op: the first result wins.
    fn record_stage_complete(
        &self,
        run_id: Uuid,
        result: &StepResult,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;

    /// Mark one batch of a parallel stage complete, with its persisted artifact.
    fn record_batch_complete(
        &self,
        run_id: Uuid,
        stage_id: &str,
        batch_index: usize,
        artifact: &Artifact,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;

    /// Record a run-scoped identifier. Returns the stored value, which is the
    /// existing one if the key was already set.
    fn record_identifier(
        &self,
        run_id: Uuid,
        key: &str,
        value: &str,
    ) -> impl Future<Output = Result<String, CheckpointError>> + Send;

    /// Upsert the run-level status row.
    fn record_run_status(
        &self,
        update: RunStatusUpdate<'_>,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;

    /// Record the review decision for an escalated run. Only the first decision
    /// is accepted.
    fn record_decision(
        &self,
        run_id: Uuid,
        decision: ReviewDecision,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;

    /// Ids of the artifacts referenced by runs that have not completed.
    /// Retention must leave these in place so the runs can still resume.
    fn live_artifacts(
        &self,
    ) -> impl Future<Output = Result<BTreeSet<Uuid>, CheckpointError>> + Send;

    /// Forget a stage's completion and batches so it re-executes.
    fn reset_stage(
        &self,
        run_id: Uuid,
        stage_id: &str,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_error_classes() {
        assert_eq!(
            CheckpointError::Repository("disk full".into()).class(),
            ErrorClass::Storage
        );
        assert_eq!(
            CheckpointError::NotEscalated(Uuid::nil()).class(),
            ErrorClass::Validation
        );
    }

    #[test]
    fn status_update_builder() {
        let run_id = Uuid::now_v7();
        let update = RunStatusUpdate::new(run_id, "leads", RunStatus::Running);
        assert_eq!(update.status, RunStatus::Running);
        assert!(update.report.is_none());
        assert!(update.escalation.is_none());
    }
}
