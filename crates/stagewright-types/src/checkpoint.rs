//! Checkpoint record: everything a resumed run needs to skip finished work.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::Artifact;
use crate::run::{Escalation, ResultData, RunReport, RunStatus, StepResult};

/// Durable progress of one run.
///
/// `completed_stages` only ever grows for a given run id, except through an
/// explicit force reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub run_id: Uuid,
    /// Set once the run has started; `None` for an unknown run id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    /// Stage ids in completion order.
    #[serde(default)]
    pub completed_stages: Vec<String>,
    /// Succeeded results for each completed stage.
    #[serde(default)]
    pub stage_results: BTreeMap<String, StepResult>,
    /// stage id -> batch index -> the batch's persisted artifact.
    #[serde(default)]
    pub completed_batches: BTreeMap<String, BTreeMap<usize, Artifact>>,
    /// Run-scoped identifiers resolved at run start (first write wins).
    #[serde(default)]
    pub identifiers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<Escalation>,
    /// Final report, present once the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<RunReport>,
}

impl CheckpointRecord {
    /// The record for a run that has never been checkpointed.
    pub fn empty(run_id: Uuid) -> Self {
        Self {
            run_id,
            definition_id: None,
            status: None,
            completed_stages: Vec::new(),
            stage_results: BTreeMap::new(),
            completed_batches: BTreeMap::new(),
            identifiers: BTreeMap::new(),
            escalation: None,
            report: None,
        }
    }

    /// True when nothing has ever been recorded for this run.
    pub fn is_fresh(&self) -> bool {
        self.status.is_none() && self.completed_stages.is_empty() && self.completed_batches.is_empty()
    }

    pub fn is_stage_complete(&self, stage_id: &str) -> bool {
        self.completed_stages.iter().any(|s| s == stage_id)
    }

    /// Batch indices already persisted for `stage_id`.
    pub fn completed_batch_indices(&self, stage_id: &str) -> BTreeSet<usize> {
        self.completed_batches
            .get(stage_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// A later run call may still read this run's artifacts.
    pub fn is_resumable(&self) -> bool {
        self.status != Some(RunStatus::Completed)
    }

    /// Ids of every artifact the record points at: persisted batches, stored
    /// stage results, and the pending result of an escalation.
    pub fn referenced_artifacts(&self) -> BTreeSet<Uuid> {
        let batches = self
            .completed_batches
            .values()
            .flat_map(|batches| batches.values())
            .map(|artifact| artifact.id);
        let results = self
            .stage_results
            .values()
            .chain(self.escalation.as_ref().map(|e| &e.pending_result))
            .filter_map(|result| match &result.data {
                Some(ResultData::Artifact { artifact }) => Some(artifact.id),
                _ => None,
            });
        batches.chain(results).collect()
    }

    pub fn batch_artifact(&self, stage_id: &str, batch_index: usize) -> Option<&Artifact> {
        self.completed_batches
            .get(stage_id)
            .and_then(|m| m.get(&batch_index))
    }
}
