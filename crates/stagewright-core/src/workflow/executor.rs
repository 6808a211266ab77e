//! Step executor: one step, fully resolved, to one `StepResult`.
//!
//! Non-parallel steps are a single connector call under a bounded timeout
//! with retries. Parallel steps are handed to the `BatchCoordinator`. Either
//! way the output is materialized inline or, above the inline-size threshold,
//! as an artifact.
//!
//! The executor never marks a stage complete; the run controller does that
//! once the stage has cleared its quality gate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use stagewright_types::artifact::ArtifactMetadata;
use stagewright_types::checkpoint::CheckpointRecord;
use stagewright_types::config::EngineConfig;
use stagewright_types::error::{ErrorClass, ErrorInfo};
use stagewright_types::run::{ResultData, RetryRecord, StepResult, StepStatus};
use stagewright_types::workflow::{RetryConfig, SourceKind, StepDefinition, WorkflowDefinition};
use uuid::Uuid;

use crate::connector::{BoxConnector, ConnectorError, ConnectorRegistry};
use crate::store::{ArtifactError, ArtifactStore, CheckpointError, CheckpointStore};

use super::batch::BatchCoordinator;
use super::context::RunContext;
use super::definition::WorkflowError;
use super::phase::PhaseError;
use super::reference::ResolutionError;
use super::retry::RetryHandler;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from workflow execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Definition, DAG, or parameter error.
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// A reference in a step's config could not be resolved.
    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// No connector is registered for the step's `(source, type)`.
    #[error("no connector registered for {kind}.{operation}")]
    MissingConnector { kind: SourceKind, operation: String },

    /// A connector call failed and retries are exhausted.
    #[error("{unit} failed after {attempts} attempt(s): {source}")]
    Connector {
        unit: String,
        attempts: u32,
        #[source]
        source: ConnectorError,
    },

    /// Every batch of an optional parallel step failed.
    #[error("step '{step_id}': all {batches} batches failed")]
    AllBatchesFailed { step_id: String, batches: usize },

    /// Checkpoint persistence error.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Artifact persistence or integrity error.
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Step output could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A stage's quality gate failed under a halting policy.
    #[error("quality gate for stage '{stage}' failed: {}", .failed_checks.join(", "))]
    QualityGate {
        stage: String,
        failed_checks: Vec<String>,
    },

    /// An escalated stage was rejected or its review deadline passed.
    #[error("review of stage '{stage}' {outcome}")]
    Review { stage: String, outcome: String },

    /// A batch worker panicked or was aborted.
    #[error("task join error: {0}")]
    Join(String),

    /// Workflow exceeded its overall timeout.
    #[error("workflow timed out")]
    WorkflowTimeout,

    /// Execution was cancelled.
    #[error("run cancelled")]
    Cancelled,

    /// No definition registered under this id.
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    /// The run controller attempted an illegal phase change.
    #[error(transparent)]
    Phase(#[from] PhaseError),
}

impl ExecutorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ExecutorError::Workflow(e) => e.class(),
            ExecutorError::Resolution(e) => e.class(),
            ExecutorError::MissingConnector { .. }
            | ExecutorError::DefinitionNotFound(_)
            | ExecutorError::Phase(_) => ErrorClass::Validation,
            ExecutorError::Connector { .. }
            | ExecutorError::AllBatchesFailed { .. }
            | ExecutorError::Join(_) => ErrorClass::Connector,
            ExecutorError::Checkpoint(e) => e.class(),
            ExecutorError::Artifact(e) => e.class(),
            ExecutorError::Serialization(_) => ErrorClass::Storage,
            ExecutorError::QualityGate { .. } | ExecutorError::Review { .. } => {
                ErrorClass::QualityGate
            }
            ExecutorError::WorkflowTimeout | ExecutorError::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Errors that end the run even when the failing step is optional:
    /// corrupted or unreachable persisted state, and cancellation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Integrity | ErrorClass::Storage | ErrorClass::Cancelled
        )
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.class(), self.to_string())
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Execution limits for one run.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub retry: RetryConfig,
    pub step_timeout: Duration,
    pub batch_timeout: Duration,
    pub inline_limit: usize,
    pub max_parallelism: usize,
}

impl ExecutionSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            step_timeout: Duration::from_secs(config.step_timeout_secs),
            batch_timeout: Duration::from_secs(config.batch_timeout_secs),
            inline_limit: config.inline_result_limit_bytes,
            max_parallelism: config.max_parallelism.max(1),
        }
    }

    /// Apply the workflow-level parallelism override.
    pub fn for_workflow(mut self, definition: &WorkflowDefinition) -> Self {
        if let Some(cap) = definition.max_parallelism {
            self.max_parallelism = cap.max(1);
        }
        self
    }

    pub fn retry_for<'a>(&'a self, step: &'a StepDefinition) -> &'a RetryConfig {
        step.retry.as_ref().unwrap_or(&self.retry)
    }

    pub fn step_timeout_for(&self, step: &StepDefinition) -> Duration {
        step.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.step_timeout)
    }

    pub fn batch_timeout_for(&self, step: &StepDefinition) -> Duration {
        step.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.batch_timeout)
    }

    pub fn parallelism_for(&self, step: &StepDefinition) -> usize {
        step.parallel
            .as_ref()
            .and_then(|p| p.max_parallelism)
            .unwrap_or(self.max_parallelism)
            .max(1)
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

/// A step's config after reference resolution.
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub config: Value,
    /// The item array for a parallel step.
    pub items: Option<Vec<Value>>,
}

/// What executing a step produced.
#[derive(Debug, Clone)]
pub struct ExecutedStep {
    /// `Succeeded` or `Failed`, never `Skipped`; the controller decides that.
    pub result: StepResult,
    /// Materialized data, present when the step succeeded.
    pub data: Option<Value>,
    /// Set when the step failed.
    pub failure: Option<Arc<ExecutorError>>,
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes single steps against the connector registry.
///
/// Generic over the two stores so the same executor serves in-memory tests
/// and the SQLite/filesystem adapters.
pub struct StepExecutor<C: CheckpointStore, A: ArtifactStore> {
    registry: Arc<ConnectorRegistry>,
    checkpoints: Arc<C>,
    artifacts: Arc<A>,
    settings: ExecutionSettings,
}

impl<C: CheckpointStore + 'static, A: ArtifactStore + 'static> StepExecutor<C, A> {
    pub fn new(
        registry: Arc<ConnectorRegistry>,
        checkpoints: Arc<C>,
        artifacts: Arc<A>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            registry,
            checkpoints,
            artifacts,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// Look up the connector for `step`.
    pub fn connector_for(&self, step: &StepDefinition) -> Result<Arc<BoxConnector>, ExecutorError> {
        self.registry
            .get(step.source, &step.operation)
            .ok_or_else(|| ExecutorError::MissingConnector {
                kind: step.source,
                operation: step.operation.clone(),
            })
    }

    /// Execute `step` with its resolved config.
    ///
    /// `record` supplies batches already persisted by an earlier attempt of
    /// this run, which are not re-executed.
    pub async fn execute(
        &self,
        ctx: &RunContext,
        step: &StepDefinition,
        resolved: ResolvedStep,
        record: &CheckpointRecord,
    ) -> ExecutedStep {
        let started = Instant::now();
        let mut result = StepResult::pending(&step.id);
        result.status = StepStatus::Running;

        tracing::info!(
            run_id = %ctx.run_id,
            step_id = step.id.as_str(),
            source = %step.source,
            operation = step.operation.as_str(),
            parallel = step.parallel.is_some(),
            "step started"
        );

        let outcome = self.run_step(ctx, step, resolved, record, &mut result).await;
        result.duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(data) => {
                result.status = StepStatus::Succeeded;
                tracing::info!(
                    run_id = %ctx.run_id,
                    step_id = step.id.as_str(),
                    items = result.item_count,
                    attempts = result.attempts,
                    duration_ms = result.duration_ms,
                    "step succeeded"
                );
                ExecutedStep {
                    result,
                    data: Some(data),
                    failure: None,
                }
            }
            Err(err) => {
                result.status = StepStatus::Failed;
                result.error = Some(err.to_info());
                tracing::warn!(
                    run_id = %ctx.run_id,
                    step_id = step.id.as_str(),
                    class = %err.class(),
                    error = %err,
                    "step failed"
                );
                ExecutedStep {
                    result,
                    data: None,
                    failure: Some(Arc::new(err)),
                }
            }
        }
    }

    async fn run_step(
        &self,
        ctx: &RunContext,
        step: &StepDefinition,
        resolved: ResolvedStep,
        record: &CheckpointRecord,
        result: &mut StepResult,
    ) -> Result<Value, ExecutorError> {
        let connector = self.connector_for(step)?;

        let (data, item_count) = match (&step.parallel, resolved.items) {
            (Some(_), Some(items)) => {
                let coordinator = BatchCoordinator::new(
                    Arc::clone(&self.checkpoints),
                    Arc::clone(&self.artifacts),
                    &self.settings,
                );
                let consolidated = coordinator
                    .run(ctx, step, connector, resolved.config, items, record, result)
                    .await?;
                (consolidated.data, consolidated.item_count)
            }
            _ => {
                let invocation = RetryHandler::invoke(
                    &connector,
                    &resolved.config,
                    self.settings.retry_for(step),
                    self.settings.step_timeout_for(step),
                    &ctx.cancel,
                )
                .await;
                result.attempts = invocation.attempts;
                if invocation.attempts > 1 {
                    result.retries.push(RetryRecord {
                        batch_index: None,
                        attempts: invocation.attempts,
                        last_error: invocation.last_error.unwrap_or_default(),
                    });
                }
                if invocation.cancelled {
                    return Err(ExecutorError::Cancelled);
                }
                let output = invocation.result.map_err(|source| ExecutorError::Connector {
                    unit: format!("step '{}'", step.id),
                    attempts: invocation.attempts,
                    source,
                })?;
                (output.data, output.item_count)
            }
        };

        result.item_count = item_count;
        result.data = Some(self.materialize(ctx.run_id, &step.id, &data).await?);
        Ok(data)
    }

    /// Keep `data` inline, or persist it when its encoding exceeds the
    /// inline-size threshold.
    async fn materialize(
        &self,
        run_id: Uuid,
        step_id: &str,
        data: &Value,
    ) -> Result<ResultData, ExecutorError> {
        let bytes = serde_json::to_vec(data).map_err(|e| ExecutorError::Serialization(e.to_string()))?;
        if bytes.len() <= self.settings.inline_limit {
            return Ok(ResultData::Inline { value: data.clone() });
        }
        let artifact = self
            .artifacts
            .put(&bytes, &ArtifactMetadata::step_result(run_id, step_id))
            .await?;
        tracing::debug!(
            %run_id,
            step_id,
            size_bytes = artifact.size_bytes,
            key = artifact.key.as_str(),
            "step result stored as artifact"
        );
        Ok(ResultData::Artifact { artifact })
    }

    /// Load a recorded result's data, re-verifying artifact checksums.
    pub async fn load_data(&self, result: &StepResult) -> Result<Value, ExecutorError> {
        load_result_data(self.artifacts.as_ref(), result).await
    }
}

/// Load a recorded result's data from wherever it lives.
pub async fn load_result_data<A: ArtifactStore + ?Sized>(
    artifacts: &A,
    result: &StepResult,
) -> Result<Value, ExecutorError> {
    match &result.data {
        Some(ResultData::Inline { value }) => Ok(value.clone()),
        Some(ResultData::Artifact { artifact }) => {
            let bytes = artifacts.get(artifact).await?;
            serde_json::from_slice(&bytes).map_err(|e| ExecutorError::Serialization(e.to_string()))
        }
        None => Ok(Value::Null),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Connector, ConnectorOutput};
    use crate::hash::Fnv1aHasher;
    use crate::store::{InMemoryArtifactStore, InMemoryCheckpointStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Rows {
        rows: usize,
        fail_first: u32,
        calls: AtomicU32,
    }

    impl Connector for Rows {
        fn name(&self) -> &str {
            "rows"
        }

        async fn invoke(&self, _config: &Value) -> Result<ConnectorOutput, ConnectorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(ConnectorError::retryable("connection reset"));
            }
            let rows: Vec<Value> = (0..self.rows).map(|i| json!({"id": i})).collect();
            Ok(ConnectorOutput::new(Value::Array(rows)))
        }
    }

    fn step(id: &str) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: String::new(),
            source: SourceKind::Query,
            operation: "rows".to_string(),
            depends_on: vec![],
            config: json!({}),
            parallel: None,
            required: true,
            timeout_secs: None,
            retry: Some(RetryConfig {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            }),
        }
    }

    type MemExecutor = StepExecutor<InMemoryCheckpointStore, InMemoryArtifactStore<Fnv1aHasher>>;

    fn executor(rows: usize, fail_first: u32, inline_limit: usize) -> (MemExecutor, Arc<InMemoryArtifactStore<Fnv1aHasher>>) {
        let mut registry = ConnectorRegistry::new();
        registry.register(
            SourceKind::Query,
            "rows",
            Rows {
                rows,
                fail_first,
                calls: AtomicU32::new(0),
            },
        );
        let artifacts = Arc::new(InMemoryArtifactStore::new(Fnv1aHasher));
        let settings = ExecutionSettings {
            inline_limit,
            ..ExecutionSettings::default()
        };
        let exec = StepExecutor::new(
            Arc::new(registry),
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::clone(&artifacts),
            settings,
        );
        (exec, artifacts)
    }

    fn resolved() -> ResolvedStep {
        ResolvedStep {
            config: json!({}),
            items: None,
        }
    }

    #[tokio::test]
    async fn small_result_stays_inline() {
        let (exec, _) = executor(2, 0, 1024);
        let ctx = RunContext::new(Uuid::now_v7(), "leads");
        let record = CheckpointRecord::empty(ctx.run_id);
        let out = exec.execute(&ctx, &step("fetch"), resolved(), &record).await;

        assert_eq!(out.result.status, StepStatus::Succeeded);
        assert_eq!(out.result.item_count, 2);
        assert_eq!(out.result.attempts, 1);
        assert!(matches!(out.result.data, Some(ResultData::Inline { .. })));
        assert_eq!(exec.load_data(&out.result).await.unwrap(), out.data.unwrap());
    }

    #[tokio::test]
    async fn large_result_becomes_artifact() {
        let (exec, artifacts) = executor(50, 0, 64);
        let ctx = RunContext::new(Uuid::now_v7(), "leads");
        let record = CheckpointRecord::empty(ctx.run_id);
        let out = exec.execute(&ctx, &step("fetch"), resolved(), &record).await;

        let Some(ResultData::Artifact { artifact }) = &out.result.data else {
            panic!("expected artifact data");
        };
        assert_eq!(artifact.key, format!("{}/fetch/result", ctx.run_id));
        assert_eq!(exec.load_data(&out.result).await.unwrap().as_array().unwrap().len(), 50);

        artifacts.corrupt(artifact);
        let err = exec.load_data(&out.result).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Integrity);
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn retries_are_recorded() {
        let (exec, _) = executor(1, 2, 1024);
        let ctx = RunContext::new(Uuid::now_v7(), "leads");
        let record = CheckpointRecord::empty(ctx.run_id);
        let out = exec.execute(&ctx, &step("fetch"), resolved(), &record).await;

        assert!(out.result.is_succeeded());
        assert_eq!(out.result.attempts, 3);
        assert_eq!(out.result.retries.len(), 1);
        assert_eq!(out.result.retries[0].batch_index, None);
        assert_eq!(out.result.retry_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_connector_class() {
        let (exec, _) = executor(1, 10, 1024);
        let ctx = RunContext::new(Uuid::now_v7(), "leads");
        let record = CheckpointRecord::empty(ctx.run_id);
        let out = exec.execute(&ctx, &step("fetch"), resolved(), &record).await;

        assert_eq!(out.result.status, StepStatus::Failed);
        assert!(out.data.is_none());
        let error = out.result.error.unwrap();
        assert_eq!(error.class, ErrorClass::Connector);
        assert!(error.message.contains("after 3 attempt(s)"));
        assert!(!out.failure.unwrap().is_fatal());
    }

    #[tokio::test]
    async fn missing_connector_is_validation_error() {
        let (exec, _) = executor(1, 0, 1024);
        let ctx = RunContext::new(Uuid::now_v7(), "leads");
        let record = CheckpointRecord::empty(ctx.run_id);
        let mut s = step("search");
        s.source = SourceKind::Search;
        let out = exec.execute(&ctx, &s, resolved(), &record).await;
        assert_eq!(out.result.error.unwrap().class, ErrorClass::Validation);
    }

    #[test]
    fn settings_overrides() {
        let mut def_step = step("a");
        def_step.timeout_secs = Some(7);
        let settings = ExecutionSettings::default();
        assert_eq!(settings.step_timeout_for(&def_step), Duration::from_secs(7));
        assert_eq!(settings.retry_for(&def_step).max_attempts, 3);
        assert_eq!(settings.parallelism_for(&def_step), 4);
    }
}
