//! In-process store implementations.
//!
//! Useful for embedding the engine without persistence and for tests. State
//! lives only as long as the store value; share it across controllers with an
//! `Arc` to simulate a process restart.

use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use stagewright_types::artifact::{Artifact, ArtifactFilter, ArtifactMetadata, RetentionPolicy};
use stagewright_types::checkpoint::CheckpointRecord;
use stagewright_types::run::{ReviewDecision, RunStatus, StepResult};
use uuid::Uuid;

use super::artifact::{
    ArtifactError, ArtifactStore, apply_limit, select_for_pruning, sort_newest_first,
    verify_artifact_bytes,
};
use super::checkpoint::{CheckpointError, CheckpointStore, RunStatusUpdate};
use crate::hash::ContentHasher;

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// `CheckpointStore` backed by a concurrent map. Each write touches one entry
/// under its shard lock, so writes are atomic per run.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    runs: DashMap<Uuid, CheckpointRecord>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, run_id: Uuid) -> Result<CheckpointRecord, CheckpointError> {
        Ok(self
            .runs
            .get(&run_id)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| CheckpointRecord::empty(run_id)))
    }

    async fn record_stage_complete(
        &self,
        run_id: Uuid,
        result: &StepResult,
    ) -> Result<(), CheckpointError> {
        let mut record = self
            .runs
            .entry(run_id)
            .or_insert_with(|| CheckpointRecord::empty(run_id));
        if !record.is_stage_complete(&result.step_id) {
            record.completed_stages.push(result.step_id.clone());
            record
                .stage_results
                .insert(result.step_id.clone(), result.clone());
        }
        Ok(())
    }

    async fn record_batch_complete(
        &self,
        run_id: Uuid,
        stage_id: &str,
        batch_index: usize,
        artifact: &Artifact,
    ) -> Result<(), CheckpointError> {
        let mut record = self
            .runs
            .entry(run_id)
            .or_insert_with(|| CheckpointRecord::empty(run_id));
        record
            .completed_batches
            .entry(stage_id.to_string())
            .or_default()
            .entry(batch_index)
            .or_insert_with(|| artifact.clone());
        Ok(())
    }

    async fn record_identifier(
        &self,
        run_id: Uuid,
        key: &str,
        value: &str,
    ) -> Result<String, CheckpointError> {
        let mut record = self
            .runs
            .entry(run_id)
            .or_insert_with(|| CheckpointRecord::empty(run_id));
        Ok(record
            .identifiers
            .entry(key.to_string())
            .or_insert_with(|| value.to_string())
            .clone())
    }

    async fn record_run_status(&self, update: RunStatusUpdate<'_>) -> Result<(), CheckpointError> {
        let mut record = self
            .runs
            .entry(update.run_id)
            .or_insert_with(|| CheckpointRecord::empty(update.run_id));

        if record.definition_id.is_none() {
            record.definition_id = Some(update.definition_id.to_string());
        }
        let prior_decision = record.escalation.as_ref().and_then(|e| e.decision);
        record.status = Some(update.status);
        record.escalation = update.escalation.cloned().map(|mut e| {
            if update.status == RunStatus::Escalated {
                e.decision = e.decision.or(prior_decision);
            }
            e
        });
        record.report = update.report.cloned();
        Ok(())
    }

    async fn record_decision(
        &self,
        run_id: Uuid,
        decision: ReviewDecision,
    ) -> Result<(), CheckpointError> {
        let mut record = self
            .runs
            .get_mut(&run_id)
            .ok_or(CheckpointError::RunNotFound(run_id))?;
        if record.status != Some(RunStatus::Escalated) {
            return Err(CheckpointError::NotEscalated(run_id));
        }
        match record.escalation.as_mut() {
            Some(escalation) if escalation.decision.is_none() => {
                escalation.decision = Some(decision);
                Ok(())
            }
            _ => Err(CheckpointError::NotEscalated(run_id)),
        }
    }

    async fn live_artifacts(&self) -> Result<BTreeSet<Uuid>, CheckpointError> {
        Ok(self
            .runs
            .iter()
            .filter(|r| r.value().is_resumable())
            .flat_map(|r| r.value().referenced_artifacts())
            .collect())
    }

    async fn reset_stage(&self, run_id: Uuid, stage_id: &str) -> Result<(), CheckpointError> {
        if let Some(mut record) = self.runs.get_mut(&run_id) {
            record.completed_stages.retain(|s| s != stage_id);
            record.stage_results.remove(stage_id);
            record.completed_batches.remove(stage_id);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// `ArtifactStore` keeping blobs in memory, deduplicated by digest.
pub struct InMemoryArtifactStore<H: ContentHasher> {
    hasher: H,
    index: Mutex<Vec<Artifact>>,
    blobs: DashMap<String, Vec<u8>>,
}

impl<H: ContentHasher> InMemoryArtifactStore<H> {
    pub fn new(hasher: H) -> Self {
        Self {
            hasher,
            index: Mutex::new(Vec::new()),
            blobs: DashMap::new(),
        }
    }

    fn lock_index(&self) -> Result<std::sync::MutexGuard<'_, Vec<Artifact>>, ArtifactError> {
        self.index
            .lock()
            .map_err(|_| ArtifactError::Storage("artifact index lock poisoned".to_string()))
    }

    /// Flip one byte of the blob behind `artifact`.
    #[cfg(test)]
    pub(crate) fn corrupt(&self, artifact: &Artifact) {
        if let Some(mut blob) = self.blobs.get_mut(&artifact.location) {
            if let Some(byte) = blob.first_mut() {
                *byte ^= 0x01;
            }
        }
    }
}

impl<H: ContentHasher> ArtifactStore for InMemoryArtifactStore<H> {
    async fn put(
        &self,
        bytes: &[u8],
        metadata: &ArtifactMetadata,
    ) -> Result<Artifact, ArtifactError> {
        let checksum = self.hasher.checksum(bytes);
        let key = metadata.key();
        let location = format!("memory://{}/{}", checksum.algorithm, checksum.digest);

        let mut index = self.lock_index()?;
        if let Some(existing) = index
            .iter()
            .find(|a| a.key == key && a.checksum == checksum)
        {
            return Ok(existing.clone());
        }

        self.blobs
            .entry(location.clone())
            .or_insert_with(|| bytes.to_vec());
        let artifact = Artifact {
            id: Uuid::now_v7(),
            key,
            run_id: metadata.run_id,
            step_id: metadata.step_id.clone(),
            batch_index: metadata.batch_index,
            checksum,
            location,
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };
        index.push(artifact.clone());
        Ok(artifact)
    }

    async fn get(&self, artifact: &Artifact) -> Result<Vec<u8>, ArtifactError> {
        let bytes = self
            .blobs
            .get(&artifact.location)
            .map(|b| b.value().clone())
            .ok_or_else(|| ArtifactError::NotFound(artifact.location.clone()))?;
        verify_artifact_bytes(&self.hasher, artifact, &bytes)?;
        Ok(bytes)
    }

    async fn list(&self, filter: &ArtifactFilter) -> Result<Vec<Artifact>, ArtifactError> {
        let mut matched: Vec<Artifact> = self
            .lock_index()?
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        sort_newest_first(&mut matched);
        Ok(apply_limit(matched, filter))
    }

    async fn prune(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
        protected: &BTreeSet<Uuid>,
    ) -> Result<usize, ArtifactError> {
        let mut index = self.lock_index()?;
        let doomed = select_for_pruning(&index, policy, now, protected);
        if doomed.is_empty() {
            return Ok(0);
        }
        index.retain(|a| !doomed.contains(&a.id));

        let live: HashSet<&str> = index.iter().map(|a| a.location.as_str()).collect();
        self.blobs.retain(|location, _| live.contains(location.as_str()));
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Fnv1aHasher;
    use chrono::Duration;
    use stagewright_types::run::{Escalation, RunReport};

    fn succeeded(step: &str) -> StepResult {
        StepResult {
            status: stagewright_types::run::StepStatus::Succeeded,
            item_count: 1,
            ..StepResult::pending(step)
        }
    }

    #[tokio::test]
    async fn unknown_run_loads_empty_record() {
        let store = InMemoryCheckpointStore::new();
        let run_id = Uuid::now_v7();
        let record = store.load(run_id).await.unwrap();
        assert_eq!(record, CheckpointRecord::empty(run_id));
    }

    #[tokio::test]
    async fn completed_stages_are_monotonic() {
        let store = InMemoryCheckpointStore::new();
        let run_id = Uuid::now_v7();
        store
            .record_stage_complete(run_id, &succeeded("fetch"))
            .await
            .unwrap();
        let mut replay = succeeded("fetch");
        replay.item_count = 99;
        store.record_stage_complete(run_id, &replay).await.unwrap();
        store
            .record_stage_complete(run_id, &succeeded("transform"))
            .await
            .unwrap();

        let record = store.load(run_id).await.unwrap();
        assert_eq!(record.completed_stages, vec!["fetch", "transform"]);
        assert_eq!(record.stage_results["fetch"].item_count, 1);
    }

    #[tokio::test]
    async fn identifiers_first_write_wins() {
        let store = InMemoryCheckpointStore::new();
        let run_id = Uuid::now_v7();
        let first = store.record_identifier(run_id, "client", "acme").await.unwrap();
        let second = store
            .record_identifier(run_id, "client", "globex")
            .await
            .unwrap();
        assert_eq!(first, "acme");
        assert_eq!(second, "acme");
    }

    #[tokio::test]
    async fn decision_requires_escalated_run() {
        let store = InMemoryCheckpointStore::new();
        let run_id = Uuid::now_v7();
        let err = store
            .record_decision(run_id, ReviewDecision::Approve)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::RunNotFound(_)));

        store
            .record_run_status(RunStatusUpdate::new(run_id, "leads", RunStatus::Running))
            .await
            .unwrap();
        let err = store
            .record_decision(run_id, ReviewDecision::Approve)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::NotEscalated(_)));

        let escalation = Escalation {
            stage: "enrich".to_string(),
            failed_checks: vec!["min_items".to_string()],
            deadline: Utc::now() + Duration::hours(1),
            pending_result: succeeded("enrich"),
            decision: None,
        };
        store
            .record_run_status(
                RunStatusUpdate::new(run_id, "leads", RunStatus::Escalated)
                    .with_escalation(&escalation),
            )
            .await
            .unwrap();
        store
            .record_decision(run_id, ReviewDecision::Reject)
            .await
            .unwrap();
        // Only the first decision sticks.
        assert!(
            store
                .record_decision(run_id, ReviewDecision::Approve)
                .await
                .is_err()
        );

        let record = store.load(run_id).await.unwrap();
        assert_eq!(
            record.escalation.unwrap().decision,
            Some(ReviewDecision::Reject)
        );
    }

    #[tokio::test]
    async fn status_update_replaces_report() {
        let store = InMemoryCheckpointStore::new();
        let run_id = Uuid::now_v7();
        let report = RunReport {
            run_id,
            definition_id: "leads".to_string(),
            status: RunStatus::Failed,
            steps: vec![],
            artifacts: vec![],
            gates: vec![],
            warnings: vec![],
            escalation: None,
            error: None,
            duration_ms: 5,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
        };
        store
            .record_run_status(
                RunStatusUpdate::new(run_id, "leads", RunStatus::Failed).with_report(&report),
            )
            .await
            .unwrap();
        assert!(store.load(run_id).await.unwrap().report.is_some());

        store
            .record_run_status(RunStatusUpdate::new(run_id, "leads", RunStatus::Running))
            .await
            .unwrap();
        let record = store.load(run_id).await.unwrap();
        assert!(record.report.is_none());
        assert_eq!(record.status, Some(RunStatus::Running));
        assert_eq!(record.definition_id.as_deref(), Some("leads"));
    }

    #[tokio::test]
    async fn reset_stage_forgets_batches() {
        let store = InMemoryCheckpointStore::new();
        let artifacts = InMemoryArtifactStore::new(Fnv1aHasher);
        let run_id = Uuid::now_v7();
        let artifact = artifacts
            .put(b"[1]", &ArtifactMetadata::batch(run_id, "transform", 0))
            .await
            .unwrap();
        store
            .record_batch_complete(run_id, "transform", 0, &artifact)
            .await
            .unwrap();
        store
            .record_stage_complete(run_id, &succeeded("transform"))
            .await
            .unwrap();

        store.reset_stage(run_id, "transform").await.unwrap();
        let record = store.load(run_id).await.unwrap();
        assert!(!record.is_stage_complete("transform"));
        assert!(record.completed_batch_indices("transform").is_empty());
    }

    #[tokio::test]
    async fn live_artifacts_skip_completed_runs() {
        let store = InMemoryCheckpointStore::new();
        let artifacts = InMemoryArtifactStore::new(Fnv1aHasher);
        let running = Uuid::now_v7();
        let finished = Uuid::now_v7();
        let pending = artifacts
            .put(b"[1]", &ArtifactMetadata::batch(running, "score", 0))
            .await
            .unwrap();
        let done = artifacts
            .put(b"[2]", &ArtifactMetadata::batch(finished, "score", 0))
            .await
            .unwrap();
        store
            .record_batch_complete(running, "score", 0, &pending)
            .await
            .unwrap();
        store
            .record_batch_complete(finished, "score", 0, &done)
            .await
            .unwrap();
        store
            .record_run_status(RunStatusUpdate::new(running, "leads", RunStatus::Failed))
            .await
            .unwrap();
        store
            .record_run_status(RunStatusUpdate::new(finished, "leads", RunStatus::Completed))
            .await
            .unwrap();

        assert_eq!(
            store.live_artifacts().await.unwrap(),
            BTreeSet::from([pending.id])
        );
    }

    #[tokio::test]
    async fn put_same_bytes_is_idempotent() {
        let store = InMemoryArtifactStore::new(Fnv1aHasher);
        let meta = ArtifactMetadata::batch(Uuid::now_v7(), "score", 2);
        let first = store.put(b"[1,2,3]", &meta).await.unwrap();
        let second = store.put(b"[1,2,3]", &meta).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list(&ArtifactFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn put_different_bytes_under_same_key_keeps_both_versions() {
        let store = InMemoryArtifactStore::new(Fnv1aHasher);
        let meta = ArtifactMetadata::batch(Uuid::now_v7(), "score", 2);
        let first = store.put(b"[1]", &meta).await.unwrap();
        let second = store.put(b"[2]", &meta).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(store.get(&first).await.unwrap(), b"[1]");
        assert_eq!(store.get(&second).await.unwrap(), b"[2]");

        let listed = store.list(&ArtifactFilter::default()).await.unwrap();
        assert_eq!(listed[0].id, second.id, "newest first");
    }

    #[tokio::test]
    async fn flipped_byte_is_integrity_error() {
        let store = InMemoryArtifactStore::new(Fnv1aHasher);
        let artifact = store
            .put(b"{\"rows\":3}", &ArtifactMetadata::step_result(Uuid::now_v7(), "fetch"))
            .await
            .unwrap();
        store.corrupt(&artifact);
        let err = store.get(&artifact).await.unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn prune_drops_unreferenced_blobs() {
        let store = InMemoryArtifactStore::new(Fnv1aHasher);
        let run_id = Uuid::now_v7();
        let old = store
            .put(b"old", &ArtifactMetadata::batch(run_id, "score", 0))
            .await
            .unwrap();
        let new = store
            .put(b"new", &ArtifactMetadata::batch(run_id, "score", 1))
            .await
            .unwrap();

        let removed = store
            .prune(
                &RetentionPolicy {
                    max_age_days: None,
                    max_per_step: Some(1),
                },
                Utc::now(),
                &BTreeSet::new(),
            )
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(matches!(
            store.get(&old).await,
            Err(ArtifactError::NotFound(_))
        ));
        assert_eq!(store.get(&new).await.unwrap(), b"new");
    }
}
