//! Batch coordinator: fan a parallel step out into batches and back in.
//!
//! # Execution flow
//!
//! 1. Partition the resolved items into fixed-size batches.
//! 2. Skip batches the checkpoint already records as persisted.
//! 3. Spawn the rest on a `JoinSet`, bounded by a `Semaphore`.
//! 4. Each batch: invoke with retries -> put artifact -> record batch complete.
//! 5. Wait for every batch, then consolidate by reading each batch artifact
//!    back from the store in index order.
//!
//! Consolidation always reads persisted bytes, so a resumed step and an
//! uninterrupted one produce identical results.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use stagewright_types::artifact::{Artifact, ArtifactMetadata};
use stagewright_types::checkpoint::CheckpointRecord;
use stagewright_types::run::{RetryRecord, StepResult};
use stagewright_types::workflow::{RetryConfig, StepDefinition};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connector::BoxConnector;
use crate::store::{ArtifactStore, CheckpointStore};

use super::context::RunContext;
use super::executor::{ExecutionSettings, ExecutorError};
use super::retry::RetryHandler;

/// Bytes persisted for one batch.
#[derive(Debug, Serialize, Deserialize)]
struct BatchPayload {
    item_count: u64,
    data: Value,
}

/// The fanned-in result of a parallel step.
#[derive(Debug, Clone, PartialEq)]
pub struct Consolidated {
    pub data: Value,
    pub item_count: u64,
}

#[derive(Debug)]
enum BatchStatus {
    Persisted(Artifact),
    Failed(ExecutorError),
    /// Cancelled while waiting for a worker slot.
    NotStarted,
}

#[derive(Debug)]
struct BatchOutcome {
    index: usize,
    attempts: u32,
    last_error: Option<String>,
    status: BatchStatus,
}

/// Everything one batch task owns.
struct BatchUnit {
    run_id: Uuid,
    step_id: String,
    index: usize,
    config: Value,
    retry: RetryConfig,
    timeout: Duration,
}

/// Partition `items` into batches of `batch_size` (the last may be short).
pub fn partition(items: &[Value], batch_size: usize) -> Vec<Vec<Value>> {
    items
        .chunks(batch_size.max(1))
        .map(<[Value]>::to_vec)
        .collect()
}

/// Runs one parallel step's batches.
pub struct BatchCoordinator<C: CheckpointStore, A: ArtifactStore> {
    checkpoints: Arc<C>,
    artifacts: Arc<A>,
    settings: ExecutionSettings,
}

impl<C: CheckpointStore + 'static, A: ArtifactStore + 'static> BatchCoordinator<C, A> {
    pub fn new(checkpoints: Arc<C>, artifacts: Arc<A>, settings: &ExecutionSettings) -> Self {
        Self {
            checkpoints,
            artifacts,
            settings: settings.clone(),
        }
    }

    /// Execute the batches of `step` not yet in `record`, then consolidate.
    ///
    /// Fills `result`'s attempts, retries, completed and omitted batches, and
    /// warnings. A failed batch fails the step when it is required and is
    /// omitted (with a warning) when it is optional.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        ctx: &RunContext,
        step: &StepDefinition,
        connector: Arc<BoxConnector>,
        config: Value,
        items: Vec<Value>,
        record: &CheckpointRecord,
        result: &mut StepResult,
    ) -> Result<Consolidated, ExecutorError> {
        let batch_size = step
            .parallel
            .as_ref()
            .map(|p| p.batch_size)
            .unwrap_or(items.len());
        let batches = partition(&items, batch_size);
        let total = batches.len();

        let mut persisted: BTreeMap<usize, Artifact> = record
            .completed_batches
            .get(&step.id)
            .map(|done| {
                done.iter()
                    .filter(|(i, _)| **i < total)
                    .map(|(i, a)| (*i, a.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let parallelism = self.settings.parallelism_for(step);
        tracing::info!(
            run_id = %ctx.run_id,
            step_id = step.id.as_str(),
            items = items.len(),
            batches = total,
            already_persisted = persisted.len(),
            parallelism,
            "dispatching batches"
        );

        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut join_set = JoinSet::new();
        for (index, slice) in batches.into_iter().enumerate() {
            if persisted.contains_key(&index) {
                continue;
            }
            let unit = BatchUnit {
                run_id: ctx.run_id,
                step_id: step.id.clone(),
                index,
                config: batch_config(&config, slice, index),
                retry: self.settings.retry_for(step).clone(),
                timeout: self.settings.batch_timeout_for(step),
            };
            join_set.spawn(run_batch(
                unit,
                Arc::clone(&connector),
                Arc::clone(&self.checkpoints),
                Arc::clone(&self.artifacts),
                Arc::clone(&semaphore),
                ctx.cancel.clone(),
            ));
        }

        // Collect every batch before deciding anything: in-flight batches are
        // never abandoned half-persisted.
        let mut failures: BTreeMap<usize, ExecutorError> = BTreeMap::new();
        let mut not_started = Vec::new();
        let mut fatal: Option<ExecutorError> = None;
        while let Some(joined) = join_set.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    fatal.get_or_insert(ExecutorError::Join(e.to_string()));
                    continue;
                }
            };
            result.attempts += outcome.attempts;
            if outcome.attempts > 1 {
                result.retries.push(RetryRecord {
                    batch_index: Some(outcome.index),
                    attempts: outcome.attempts,
                    last_error: outcome.last_error.unwrap_or_default(),
                });
            }
            match outcome.status {
                BatchStatus::Persisted(artifact) => {
                    persisted.insert(outcome.index, artifact);
                }
                BatchStatus::Failed(err) if err.is_fatal() => {
                    fatal.get_or_insert(err);
                }
                BatchStatus::Failed(err) => {
                    failures.insert(outcome.index, err);
                }
                BatchStatus::NotStarted => not_started.push(outcome.index),
            }
        }
        result.retries.sort_by_key(|r| r.batch_index);
        result.completed_batches = persisted.keys().copied().collect();

        if let Some(err) = fatal {
            return Err(err);
        }
        if ctx.is_cancelled() && (!not_started.is_empty() || !failures.is_empty()) {
            tracing::info!(
                run_id = %ctx.run_id,
                step_id = step.id.as_str(),
                persisted = persisted.len(),
                total,
                "batches cancelled"
            );
            return Err(ExecutorError::Cancelled);
        }

        if !failures.is_empty() {
            if step.required {
                return Err(failures
                    .into_values()
                    .next()
                    .unwrap_or(ExecutorError::Cancelled));
            }
            if persisted.is_empty() {
                return Err(ExecutorError::AllBatchesFailed {
                    step_id: step.id.clone(),
                    batches: total,
                });
            }
            for (index, err) in failures {
                tracing::warn!(
                    run_id = %ctx.run_id,
                    step_id = step.id.as_str(),
                    batch = index,
                    error = %err,
                    "omitting failed batch from consolidation"
                );
                result.omitted_batches.push(index);
                result
                    .warnings
                    .push(format!("batch {index} of step '{}' omitted: {err}", step.id));
            }
        }

        self.consolidate(&persisted).await
    }

    async fn consolidate(
        &self,
        persisted: &BTreeMap<usize, Artifact>,
    ) -> Result<Consolidated, ExecutorError> {
        let mut data = Vec::new();
        let mut item_count = 0u64;
        for artifact in persisted.values() {
            let bytes = self.artifacts.get(artifact).await?;
            let payload: BatchPayload = serde_json::from_slice(&bytes)
                .map_err(|e| ExecutorError::Serialization(e.to_string()))?;
            item_count += payload.item_count;
            match payload.data {
                Value::Array(items) => data.extend(items),
                Value::Null => {}
                other => data.push(other),
            }
        }
        Ok(Consolidated {
            data: Value::Array(data),
            item_count,
        })
    }
}

/// The step's resolved config plus this batch's `items` and `batch_index`.
fn batch_config(base: &Value, items: Vec<Value>, index: usize) -> Value {
    let mut config = base.clone();
    if let Value::Object(map) = &mut config {
        map.insert("items".to_string(), Value::Array(items));
        map.insert("batch_index".to_string(), json!(index));
    }
    config
}

async fn run_batch<C: CheckpointStore, A: ArtifactStore>(
    unit: BatchUnit,
    connector: Arc<BoxConnector>,
    checkpoints: Arc<C>,
    artifacts: Arc<A>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
) -> BatchOutcome {
    let not_started = |index| BatchOutcome {
        index,
        attempts: 0,
        last_error: None,
        status: BatchStatus::NotStarted,
    };

    let Ok(_permit) = semaphore.acquire_owned().await else {
        return not_started(unit.index);
    };
    if cancel.is_cancelled() {
        return not_started(unit.index);
    }

    tracing::debug!(
        run_id = %unit.run_id,
        step_id = unit.step_id.as_str(),
        batch = unit.index,
        "batch started"
    );

    let invocation =
        RetryHandler::invoke(&connector, &unit.config, &unit.retry, unit.timeout, &cancel).await;
    let status = match invocation.result {
        Err(_) if invocation.cancelled => BatchStatus::Failed(ExecutorError::Cancelled),
        Ok(output) => {
            let payload = BatchPayload {
                item_count: output.item_count,
                data: output.data,
            };
            match persist_batch(&unit, &payload, checkpoints.as_ref(), artifacts.as_ref()).await {
                Ok(artifact) => BatchStatus::Persisted(artifact),
                Err(err) => BatchStatus::Failed(err),
            }
        }
        Err(source) => BatchStatus::Failed(ExecutorError::Connector {
            unit: format!("batch {} of step '{}'", unit.index, unit.step_id),
            attempts: invocation.attempts,
            source,
        }),
    };

    BatchOutcome {
        index: unit.index,
        attempts: invocation.attempts,
        last_error: invocation.last_error,
        status,
    }
}

/// Artifact first, then checkpoint: a crash in between leaves an unreferenced
/// artifact and the batch re-executes, never a checkpoint without bytes.
async fn persist_batch<C: CheckpointStore, A: ArtifactStore>(
    unit: &BatchUnit,
    payload: &BatchPayload,
    checkpoints: &C,
    artifacts: &A,
) -> Result<Artifact, ExecutorError> {
    let bytes =
        serde_json::to_vec(payload).map_err(|e| ExecutorError::Serialization(e.to_string()))?;
    let artifact = artifacts
        .put(&bytes, &ArtifactMetadata::batch(unit.run_id, unit.step_id.as_str(), unit.index))
        .await?;
    checkpoints
        .record_batch_complete(unit.run_id, &unit.step_id, unit.index, &artifact)
        .await?;
    tracing::debug!(
        run_id = %unit.run_id,
        step_id = unit.step_id.as_str(),
        batch = unit.index,
        key = artifact.key.as_str(),
        "batch persisted"
    );
    Ok(artifact)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
