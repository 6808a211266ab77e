//! Run controller: drives one run of a compiled workflow from its checkpoint.
//!
//! # Execution flow
//!
//! 1. Look up the compiled definition, resolve parameters, and check that a
//!    connector exists for every step.
//! 2. Load the checkpoint. A completed run replays its stored report; an
//!    escalated run applies its review decision; anything else resumes.
//! 3. Walk the execution order. Completed stages replay their recorded data;
//!    the rest resolve references, execute, pass their gate, and are recorded
//!    complete.
//! 4. Persist the final report and status.
//!
//! Errors that prevent a run from starting are returned as `Err`. Once a run
//! has started, failures are reported in the returned `RunReport`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use stagewright_types::artifact::ArtifactFilter;
use stagewright_types::checkpoint::CheckpointRecord;
use stagewright_types::config::EngineConfig;
use stagewright_types::gate::{GateOutcome, GatePolicy};
use stagewright_types::run::{
    Escalation, ReviewDecision, RunReport, RunStatus, StepResult, StepStatus,
};
use stagewright_types::workflow::StepDefinition;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connector::ConnectorRegistry;
use crate::store::{ArtifactStore, CheckpointError, CheckpointStore, RunStatusUpdate};

use super::catalog::{CompiledWorkflow, WorkflowCatalog};
use super::context::{RunContext, StepOutputs};
use super::dag::{get_dependents, pending_steps};
use super::definition::{WorkflowError, resolve_parameters};
use super::executor::{
    ExecutedStep, ExecutionSettings, ExecutorError, ResolvedStep, StepExecutor,
};
use super::gate::QualityGateEvaluator;
use super::phase::{RunPhase, RunPhaseTracker};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-call options for `run_workflow`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Resume this run if it exists; otherwise start it under this id.
    pub run_id: Option<Uuid>,
    /// Run-scoped identifiers. Values already recorded for the run win.
    pub identifiers: BTreeMap<String, String>,
    /// Steps to re-execute even if complete. Their dependents re-execute too.
    pub force: Vec<String>,
    /// Caller-owned cancellation token; one is created when absent.
    pub cancel_token: Option<CancellationToken>,
}

impl RunOptions {
    pub fn resume(run_id: Uuid) -> Self {
        Self {
            run_id: Some(run_id),
            ..Self::default()
        }
    }

    pub fn with_identifier(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.identifiers.insert(key.into(), value.into());
        self
    }

    pub fn force_step(mut self, step_id: impl Into<String>) -> Self {
        self.force.push(step_id.into());
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }
}

/// How the run loop ended.
enum Outcome {
    Completed,
    Halted(ExecutorError),
    Escalated(Escalation),
}

/// Mutable state of one pass over the execution order.
struct RunState {
    results: Vec<StepResult>,
    gates: Vec<GateOutcome>,
    warnings: Vec<String>,
    outputs: StepOutputs,
}

impl RunState {
    fn set(&mut self, result: StepResult) {
        if let Some(slot) = self.results.iter_mut().find(|r| r.step_id == result.step_id) {
            *slot = result;
        }
    }
}

// ---------------------------------------------------------------------------
// RunController
// ---------------------------------------------------------------------------

/// Runs workflows from the catalog against the configured stores.
///
/// Generic over `C: CheckpointStore` and `A: ArtifactStore`. Any number of
/// runs may execute concurrently; each gets its own `RunContext`.
pub struct RunController<C: CheckpointStore, A: ArtifactStore> {
    catalog: Arc<WorkflowCatalog>,
    registry: Arc<ConnectorRegistry>,
    checkpoints: Arc<C>,
    artifacts: Arc<A>,
    config: EngineConfig,
    /// Cancellation tokens of active runs keyed by run_id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<C: CheckpointStore + 'static, A: ArtifactStore + 'static> RunController<C, A> {
    pub fn new(
        catalog: Arc<WorkflowCatalog>,
        registry: Arc<ConnectorRegistry>,
        checkpoints: Arc<C>,
        artifacts: Arc<A>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog,
            registry,
            checkpoints,
            artifacts,
            config,
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    /// Start or resume a run of `definition_id`.
    ///
    /// If `options.run_id` names an incomplete run it resumes; a completed run
    /// returns its stored report without invoking any connector.
    pub async fn run_workflow(
        &self,
        definition_id: &str,
        parameters: Map<String, Value>,
        options: RunOptions,
    ) -> Result<RunReport, ExecutorError> {
        let compiled = self
            .catalog
            .get(definition_id)
            .ok_or_else(|| ExecutorError::DefinitionNotFound(definition_id.to_string()))?;
        let definition = &compiled.definition;
        let parameters = resolve_parameters(&definition.parameters, &parameters)?;

        let run_id = options.run_id.unwrap_or_else(Uuid::now_v7);
        let mut record = self.checkpoints.load(run_id).await?;
        if let Some(owner) = &record.definition_id {
            if owner != definition_id {
                return Err(WorkflowError::ValidationError(format!(
                    "run {run_id} belongs to workflow '{owner}', not '{definition_id}'"
                ))
                .into());
            }
        }

        if record.status == Some(RunStatus::Completed) && options.force.is_empty() {
            if let Some(report) = record.report.clone() {
                tracing::info!(%run_id, workflow = definition_id, "run already completed, returning stored report");
                return Ok(report);
            }
        }

        for step in &definition.steps {
            if !self.registry.contains(step.source, &step.operation) {
                return Err(ExecutorError::MissingConnector {
                    kind: step.source,
                    operation: step.operation.clone(),
                });
            }
        }

        // Escalated runs move only on a recorded decision or an expired deadline.
        let mut review_failure = None;
        let mut preface = Vec::new();
        if record.status == Some(RunStatus::Escalated) {
            if let Some(escalation) = record.escalation.clone() {
                match escalation.decision {
                    Some(ReviewDecision::Approve) => {
                        self.checkpoints
                            .record_stage_complete(run_id, &escalation.pending_result)
                            .await?;
                        preface.push(format!("stage '{}' approved after review", escalation.stage));
                        tracing::info!(%run_id, stage = escalation.stage.as_str(), "escalated stage approved");
                        record = self.checkpoints.load(run_id).await?;
                    }
                    Some(ReviewDecision::Reject) => {
                        review_failure = Some((escalation, "rejected"));
                    }
                    None if Utc::now() > escalation.deadline => {
                        review_failure = Some((escalation, "deadline expired"));
                    }
                    None => {
                        tracing::info!(%run_id, stage = escalation.stage.as_str(), "run awaiting review decision");
                        return record.report.clone().ok_or_else(|| {
                            CheckpointError::Serialization(format!(
                                "escalated run {run_id} has no stored report"
                            ))
                            .into()
                        });
                    }
                }
            }
        }

        if !options.force.is_empty() {
            self.reset_forced(run_id, &compiled, &options.force).await?;
            record = self.checkpoints.load(run_id).await?;
        }

        let mut identifiers = record.identifiers.clone();
        for (key, value) in &options.identifiers {
            let stored = self.checkpoints.record_identifier(run_id, key, value).await?;
            identifiers.insert(key.clone(), stored);
        }

        let resumed = !record.is_fresh();
        let mut tracker = RunPhaseTracker::new(run_id);
        if resumed {
            tracker.transition(RunPhase::Resumed)?;
        }

        self.checkpoints
            .record_run_status(RunStatusUpdate::new(run_id, definition_id, RunStatus::Running))
            .await?;

        let cancel = options.cancel_token.unwrap_or_default();
        self.cancellation_tokens.insert(run_id, cancel.clone());

        let ctx = RunContext {
            run_id,
            definition_id: definition_id.to_string(),
            parameters,
            identifiers,
            cancel,
        };

        tracing::info!(
            %run_id,
            workflow = definition_id,
            resumed,
            completed_stages = record.completed_stages.len(),
            "run started"
        );

        let started_at = Utc::now();
        let result = self
            .drive(&compiled, &ctx, &record, &mut tracker, review_failure, preface, started_at)
            .await;
        self.cancellation_tokens.remove(&run_id);
        result
    }

    /// Signal cancellation to an active run. Returns `false` if no run with
    /// this id is active in this controller.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.cancellation_tokens.get(&run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(%run_id, "run cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Record the review decision for an escalated run. The next
    /// `run_workflow` call for the run applies it.
    pub async fn record_decision(
        &self,
        run_id: Uuid,
        decision: ReviewDecision,
    ) -> Result<(), ExecutorError> {
        self.checkpoints.record_decision(run_id, decision).await?;
        tracing::info!(%run_id, decision = decision.as_str(), "review decision recorded");
        Ok(())
    }

    /// Apply the configured retention policy to the artifact store. Artifacts
    /// that an unfinished run's checkpoint points at are kept.
    pub async fn prune_artifacts(&self, now: DateTime<Utc>) -> Result<usize, ExecutorError> {
        let policy = &self.config.retention;
        if policy.is_noop() {
            return Ok(0);
        }
        let protected = self.checkpoints.live_artifacts().await?;
        let pruned = self.artifacts.prune(policy, now, &protected).await?;
        tracing::info!(pruned, protected = protected.len(), "artifact retention applied");
        Ok(pruned)
    }

    async fn reset_forced(
        &self,
        run_id: Uuid,
        compiled: &CompiledWorkflow,
        force: &[String],
    ) -> Result<(), ExecutorError> {
        let steps = &compiled.definition.steps;
        for step_id in force {
            if compiled.definition.step(step_id).is_none() {
                return Err(WorkflowError::ValidationError(format!(
                    "cannot force unknown step '{step_id}'"
                ))
                .into());
            }
            let mut targets = vec![step_id.as_str()];
            targets.extend(get_dependents(step_id, steps));
            for target in targets {
                self.checkpoints.reset_stage(run_id, target).await?;
                tracing::info!(%run_id, step_id = target, "stage reset for re-execution");
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        compiled: &CompiledWorkflow,
        ctx: &RunContext,
        record: &CheckpointRecord,
        tracker: &mut RunPhaseTracker,
        review_failure: Option<(Escalation, &'static str)>,
        preface: Vec<String>,
        started_at: DateTime<Utc>,
    ) -> Result<RunReport, ExecutorError> {
        let started = Instant::now();
        let definition = &compiled.definition;
        let settings = ExecutionSettings::from_config(&self.config).for_workflow(definition);
        let executor = StepExecutor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.artifacts),
            settings,
        );

        let mut state = RunState {
            results: compiled
                .ordered_steps()
                .map(|s| StepResult::pending(&s.id))
                .collect(),
            gates: Vec::new(),
            warnings: preface,
            outputs: StepOutputs::new(),
        };

        let outcome = match review_failure {
            Some((escalation, verdict)) => {
                let err = ExecutorError::Review {
                    stage: escalation.stage.clone(),
                    outcome: verdict.to_string(),
                };
                let mut failed = escalation.pending_result;
                failed.status = StepStatus::Failed;
                failed.error = Some(err.to_info());
                state.set(failed);
                Outcome::Halted(err)
            }
            None => {
                tracker.transition(RunPhase::Running)?;
                self.run_steps(compiled, ctx, record, tracker, &executor, &mut state, started)
                    .await?
            }
        };

        let (escalation, error) = match outcome {
            Outcome::Completed => {
                tracker.transition(RunPhase::Completed)?;
                (None, None)
            }
            Outcome::Escalated(escalation) => (Some(escalation), None),
            Outcome::Halted(err) => {
                let terminal = if matches!(err, ExecutorError::Cancelled) {
                    RunPhase::Cancelled
                } else {
                    RunPhase::Failed
                };
                tracker.transition(terminal)?;
                (None, Some(err.to_info()))
            }
        };

        let status = tracker.phase().run_status();
        let artifacts = self.artifacts.list(&ArtifactFilter::for_run(ctx.run_id)).await?;
        let report = RunReport {
            run_id: ctx.run_id,
            definition_id: ctx.definition_id.clone(),
            status,
            steps: state.results,
            artifacts,
            gates: state.gates,
            warnings: state.warnings,
            escalation: escalation.clone(),
            error,
            duration_ms: started.elapsed().as_millis() as u64,
            started_at,
            completed_at: (status != RunStatus::Escalated).then(Utc::now),
        };

        let mut update = RunStatusUpdate::new(ctx.run_id, &ctx.definition_id, status).with_report(&report);
        if let Some(escalation) = &escalation {
            update = update.with_escalation(escalation);
        }
        self.checkpoints.record_run_status(update).await?;

        match &report.error {
            Some(error) => tracing::warn!(
                run_id = %ctx.run_id,
                status = %status,
                class = %error.class,
                error = error.message.as_str(),
                duration_ms = report.duration_ms,
                "run ended"
            ),
            None => tracing::info!(
                run_id = %ctx.run_id,
                status = %status,
                duration_ms = report.duration_ms,
                "run ended"
            ),
        }
        Ok(report)
    }

    /// Walk the execution order. Returns `Err` only for failures that must not
    /// be folded into the report (checkpoint writes, phase violations).
    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        compiled: &CompiledWorkflow,
        ctx: &RunContext,
        record: &CheckpointRecord,
        tracker: &mut RunPhaseTracker,
        executor: &StepExecutor<C, A>,
        state: &mut RunState,
        started: Instant,
    ) -> Result<Outcome, ExecutorError> {
        let definition = &compiled.definition;
        let deadline = definition
            .timeout_secs
            .map(|secs| started + Duration::from_secs(secs));

        let order: Vec<&StepDefinition> = compiled.ordered_steps().collect();
        let pending: HashSet<&str> = pending_steps(&order, record)
            .into_iter()
            .map(|s| s.id.as_str())
            .collect();
        tracing::debug!(
            run_id = %ctx.run_id,
            steps = order.len(),
            pending = pending.len(),
            "execution order resolved"
        );

        for step in order {
            if !pending.contains(step.id.as_str()) {
                let Some(stored) = record.stage_results.get(&step.id).cloned() else {
                    return Err(CheckpointError::Serialization(format!(
                        "stage '{}' is complete but has no stored result",
                        step.id
                    ))
                    .into());
                };
                match executor.load_data(&stored).await {
                    Ok(data) => {
                        tracing::debug!(run_id = %ctx.run_id, step_id = step.id.as_str(), "replaying completed stage");
                        state.outputs.insert(step.id.clone(), data);
                        state.set(stored);
                    }
                    Err(err) => {
                        state.set(StepResult::errored(&step.id, StepStatus::Failed, err.to_info()));
                        return Ok(Outcome::Halted(err));
                    }
                }
                continue;
            }

            if ctx.is_cancelled() {
                return Ok(Outcome::Halted(ExecutorError::Cancelled));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(Outcome::Halted(ExecutorError::WorkflowTimeout));
            }

            tracker.transition(RunPhase::StepRunning)?;
            let executed = match resolve_step(compiled, step, ctx, &state.outputs) {
                Ok(resolved) => executor.execute(ctx, step, resolved, record).await,
                Err(err) => {
                    tracing::warn!(run_id = %ctx.run_id, step_id = step.id.as_str(), error = %err, "reference resolution failed");
                    ExecutedStep {
                        result: StepResult::errored(&step.id, StepStatus::Failed, err.to_info()),
                        data: None,
                        failure: Some(Arc::new(err)),
                    }
                }
            };

            let ExecutedStep { mut result, data, failure } = executed;
            if let Some(failure) = failure {
                if step.required || failure.is_fatal() {
                    state.set(result);
                    return Ok(Outcome::Halted(unwrap_failure(failure)));
                }
                result.status = StepStatus::Skipped;
                let warning = format!("optional step '{}' skipped: {failure}", step.id);
                tracing::warn!(run_id = %ctx.run_id, step_id = step.id.as_str(), "optional step skipped");
                state.warnings.push(warning);
                state.set(result);
                tracker.transition(RunPhase::Advancing)?;
                continue;
            }
            tracker.transition(RunPhase::StepCheckpointed)?;
            let data = data.unwrap_or(Value::Null);
            state.warnings.extend(result.warnings.iter().cloned());

            if let Some(gate) = definition.gate_for(&step.id) {
                tracker.transition(RunPhase::GateEvaluating)?;
                let outcome = QualityGateEvaluator::evaluate(gate, &result, &data);
                state.gates.push(outcome.clone());
                if !outcome.passed {
                    tracing::warn!(
                        run_id = %ctx.run_id,
                        stage = step.id.as_str(),
                        policy = ?gate.policy,
                        failed_checks = ?outcome.failed_checks,
                        "quality gate failed"
                    );
                    match gate.policy {
                        GatePolicy::Abort => {
                            tracker.transition(RunPhase::Blocked)?;
                            let err = ExecutorError::QualityGate {
                                stage: step.id.clone(),
                                failed_checks: outcome.failed_checks,
                            };
                            result.status = StepStatus::Failed;
                            result.error = Some(err.to_info());
                            state.set(result);
                            return Ok(Outcome::Halted(err));
                        }
                        GatePolicy::WarnAndContinue => {
                            let warning = format!(
                                "quality gate for stage '{}' failed: {}",
                                step.id,
                                outcome.failed_checks.join(", ")
                            );
                            result.warnings.push(warning.clone());
                            state.warnings.push(warning);
                        }
                        GatePolicy::EscalateForReview => {
                            tracker.transition(RunPhase::Escalated)?;
                            let deadline_secs = gate
                                .deadline_secs
                                .unwrap_or(self.config.escalation_deadline_secs);
                            let escalation = Escalation {
                                stage: step.id.clone(),
                                failed_checks: outcome.failed_checks,
                                deadline: Utc::now()
                                    + chrono::Duration::seconds(deadline_secs as i64),
                                pending_result: result.clone(),
                                decision: None,
                            };
                            state.set(result);
                            return Ok(Outcome::Escalated(escalation));
                        }
                    }
                }
            }

            tracker.transition(RunPhase::Advancing)?;
            self.checkpoints.record_stage_complete(ctx.run_id, &result).await?;
            tracing::debug!(run_id = %ctx.run_id, step_id = step.id.as_str(), "stage recorded complete");
            state.outputs.insert(step.id.clone(), data);
            state.set(result);
        }

        Ok(Outcome::Completed)
    }
}

/// Resolve a step's config and, for parallel steps, its items.
fn resolve_step(
    compiled: &CompiledWorkflow,
    step: &StepDefinition,
    ctx: &RunContext,
    outputs: &StepOutputs,
) -> Result<ResolvedStep, ExecutorError> {
    let scope = ctx.scope(outputs);
    let config = match compiled.config_expr(&step.id) {
        Some(expr) => expr.resolve(&scope)?,
        None => step.config.clone(),
    };
    let items = match compiled.items_expr(&step.id) {
        Some(expr) => Some(expr.resolve_items(&scope)?),
        None => None,
    };
    Ok(ResolvedStep { config, items })
}

/// Take the error back out of its `Arc`, or re-describe it when shared.
fn unwrap_failure(failure: Arc<ExecutorError>) -> ExecutorError {
    Arc::try_unwrap(failure).unwrap_or_else(|shared| match shared.as_ref() {
        ExecutorError::Cancelled => ExecutorError::Cancelled,
        other => ExecutorError::Join(other.to_string()),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
