//! Persistent store bootstrap.
//!
//! Opens the SQLite database and the artifact directory under one data
//! directory and wires them into a `RunController`.
//!
//! ```text
//! {data_dir}/
//!   stagewright.toml
//!   stagewright.db
//!   artifacts/objects/..
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use stagewright_core::connector::ConnectorRegistry;
use stagewright_core::workflow::{RunController, WorkflowCatalog};
use stagewright_types::config::EngineConfig;

use crate::artifact::FsArtifactStore;
use crate::config::{load_engine_config, resolve_data_dir};
use crate::sqlite::{DatabasePool, SqliteCheckpointStore};

/// Controller type over the persistent stores.
pub type PersistentController = RunController<SqliteCheckpointStore, FsArtifactStore>;

/// The persistent stores for one data directory.
pub struct EngineStores {
    pub data_dir: PathBuf,
    pub pool: DatabasePool,
    pub checkpoints: Arc<SqliteCheckpointStore>,
    pub artifacts: Arc<FsArtifactStore>,
}

impl EngineStores {
    /// Open (creating if needed) the stores under `data_dir`.
    pub async fn open(data_dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let pool = DatabasePool::open(data_dir)
            .await
            .with_context(|| format!("failed to open database in {}", data_dir.display()))?;

        let artifact_root = data_dir.join("artifacts");
        tokio::fs::create_dir_all(&artifact_root)
            .await
            .with_context(|| format!("failed to create {}", artifact_root.display()))?;

        tracing::info!(data_dir = %data_dir.display(), "stores opened");
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            checkpoints: Arc::new(SqliteCheckpointStore::new(pool.clone())),
            artifacts: Arc::new(FsArtifactStore::new(artifact_root, pool.clone())),
            pool,
        })
    }

    /// Open the stores under the resolved data directory.
    pub async fn open_default() -> anyhow::Result<Self> {
        Self::open(&resolve_data_dir()).await
    }

    /// `stagewright.toml` from this data directory.
    pub async fn load_config(&self) -> EngineConfig {
        load_engine_config(&self.data_dir).await
    }

    /// A controller running `catalog` against these stores.
    pub fn controller(
        &self,
        catalog: Arc<WorkflowCatalog>,
        registry: Arc<ConnectorRegistry>,
        config: EngineConfig,
    ) -> PersistentController {
        RunController::new(
            catalog,
            registry,
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.artifacts),
            config,
        )
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::{Map, Value, json};
    use stagewright_core::connector::{Connector, ConnectorError, ConnectorOutput};
    use stagewright_core::store::{ArtifactStore, CheckpointStore};
    use stagewright_core::workflow::RunOptions;
    use stagewright_core::workflow::definition::parse_workflow_yaml;
    use stagewright_types::error::ErrorClass;
    use stagewright_types::run::{ResultData, RunStatus, StepStatus};
    use stagewright_types::artifact::{ArtifactFilter, RetentionPolicy};
    use stagewright_types::workflow::SourceKind;
    use tokio_util::sync::CancellationToken;

    const PIPELINE: &str = r#"
id: leads
name: Lead pipeline
steps:
  - id: fetch
    source: query
    type: rows
    config:
      input: [{"id": 1}, {"id": 2}, {"id": 3}, {"id": 4}]
  - id: transform
    source: generate
    type: score
    depends_on: [fetch]
    parallel:
      items: "${steps.fetch}"
      batch_size: 1
    retry: {max_attempts: 3, initial_backoff_ms: 1, max_backoff_ms: 2}
  - id: publish
    source: transform
    type: sink
    depends_on: [transform]
    config:
      input: "${steps.transform}"
    retry: {max_attempts: 2, initial_backoff_ms: 1, max_backoff_ms: 2}
"#;

    /// Echoes `items` or `input`; fails per batch index as scripted.
    #[derive(Clone, Default)]
    struct Flaky {
        calls: Arc<AtomicU32>,
        fail_batch: Arc<Mutex<HashMap<Option<u64>, u32>>>,
        broken: bool,
    }

    impl Flaky {
        fn failing_batch(batch: u64, times: u32) -> Self {
            let flaky = Self::default();
            flaky.fail_batch.lock().unwrap().insert(Some(batch), times);
            flaky
        }

        fn broken() -> Self {
            Self {
                broken: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Connector for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn invoke(&self, config: &Value) -> Result<ConnectorOutput, ConnectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.broken {
                return Err(ConnectorError::retryable("sink unavailable"));
            }
            let batch = config.get("batch_index").and_then(Value::as_u64);
            if let Some(remaining) = self.fail_batch.lock().unwrap().get_mut(&batch) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ConnectorError::retryable("upstream 503"));
                }
            }
            let data = config
                .get("items")
                .or_else(|| config.get("input"))
                .cloned()
                .unwrap_or(Value::Null);
            Ok(ConnectorOutput::new(data))
        }
    }

    #[derive(Default)]
    struct Connectors {
        fetch: Flaky,
        score: Flaky,
        sink: Flaky,
    }

    fn controller(stores: &EngineStores, c: &Connectors, config: EngineConfig) -> PersistentController {
        controller_for(PIPELINE, stores, c, config)
    }

    fn controller_for(
        yaml: &str,
        stores: &EngineStores,
        c: &Connectors,
        config: EngineConfig,
    ) -> PersistentController {
        let catalog = WorkflowCatalog::new();
        catalog.register(parse_workflow_yaml(yaml).unwrap()).unwrap();
        let mut registry = ConnectorRegistry::new();
        registry.register(SourceKind::Query, "rows", c.fetch.clone());
        registry.register(SourceKind::Generate, "score", c.score.clone());
        registry.register(SourceKind::Transform, "sink", c.sink.clone());
        stores.controller(Arc::new(catalog), Arc::new(registry), config)
    }

    #[tokio::test]
    async fn flaky_batch_then_restart_resumes_only_failed_step() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::default();

        let first_connectors = Connectors {
            score: Flaky::failing_batch(2, 2),
            sink: Flaky::broken(),
            ..Connectors::default()
        };
        let stores = EngineStores::open(dir.path()).await.unwrap();
        let first = controller(&stores, &first_connectors, config.clone())
            .run_workflow("leads", Map::new(), RunOptions::default())
            .await
            .unwrap();

        assert_eq!(first.status, RunStatus::Failed);
        assert_eq!(first.error.as_ref().unwrap().class, ErrorClass::Connector);
        let transform = first.step("transform").unwrap();
        assert_eq!(transform.status, StepStatus::Succeeded);
        assert_eq!(transform.completed_batches, vec![0, 1, 2, 3]);
        assert_eq!(transform.retries.len(), 1);
        assert_eq!(transform.retries[0].batch_index, Some(2));
        assert_eq!(first_connectors.score.calls(), 6);

        let before = stores.checkpoints.load(first.run_id).await.unwrap();
        let batch_artifacts = before.completed_batches["transform"].clone();
        stores.close().await;
        drop(stores);

        // New process: fresh stores and connectors over the same directory.
        let stores = EngineStores::open(dir.path()).await.unwrap();
        let second_connectors = Connectors::default();
        let resumed = controller(&stores, &second_connectors, config)
            .run_workflow("leads", Map::new(), RunOptions::resume(first.run_id))
            .await
            .unwrap();

        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(second_connectors.fetch.calls(), 0);
        assert_eq!(second_connectors.score.calls(), 0);
        assert_eq!(second_connectors.sink.calls(), 1);

        let after = stores.checkpoints.load(first.run_id).await.unwrap();
        assert_eq!(after.completed_batches["transform"], batch_artifacts);
        for artifact in batch_artifacts.values() {
            stores.artifacts.get(artifact).await.unwrap();
        }
        assert_eq!(after.completed_stages, vec!["fetch", "transform", "publish"]);
        assert_eq!(
            resumed.step("publish").unwrap().item_count,
            4,
            "publish consumed all consolidated rows"
        );
    }

    #[tokio::test]
    async fn completed_run_replays_after_restart_without_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let stores = EngineStores::open(dir.path()).await.unwrap();
        let connectors = Connectors::default();
        let first = controller(&stores, &connectors, EngineConfig::default())
            .run_workflow("leads", Map::new(), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(first.status, RunStatus::Completed);
        stores.close().await;
        drop(stores);

        let stores = EngineStores::open(dir.path()).await.unwrap();
        let idle = Connectors::default();
        let again = controller(&stores, &idle, EngineConfig::default())
            .run_workflow("leads", Map::new(), RunOptions::resume(first.run_id))
            .await
            .unwrap();
        assert_eq!(again, first);
        assert_eq!(idle.fetch.calls() + idle.score.calls() + idle.sink.calls(), 0);
    }

    #[tokio::test]
    async fn tampered_stage_artifact_fails_resume_with_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            inline_result_limit_bytes: 8,
            ..EngineConfig::default()
        };
        let stores = EngineStores::open(dir.path()).await.unwrap();
        let connectors = Connectors {
            sink: Flaky::broken(),
            ..Connectors::default()
        };
        let first = controller(&stores, &connectors, config.clone())
            .run_workflow("leads", Map::new(), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(first.status, RunStatus::Failed);

        let record = stores.checkpoints.load(first.run_id).await.unwrap();
        let Some(ResultData::Artifact { artifact }) = &record.stage_results["fetch"].data else {
            panic!("fetch result should be stored as an artifact");
        };
        let path = artifact.location.strip_prefix("file://").unwrap().to_string();
        tokio::fs::write(&path, json!([{"id": 666}]).to_string()).await.unwrap();

        let resumed = controller(&stores, &Connectors::default(), config)
            .run_workflow("leads", Map::new(), RunOptions::resume(first.run_id))
            .await
            .unwrap();
        assert_eq!(resumed.status, RunStatus::Failed);
        assert_eq!(resumed.error.unwrap().class, ErrorClass::Integrity);
    }

    #[tokio::test]
    async fn cancelled_run_resumes_from_persisted_batches_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let stores = EngineStores::open(dir.path()).await.unwrap();
        let connectors = Connectors {
            score: Flaky::failing_batch(3, u32::MAX),
            ..Connectors::default()
        };
        let token = CancellationToken::new();

        // Batch 3 keeps failing; cancel once the first three are checkpointed.
        let run_id = uuid::Uuid::now_v7();
        let watcher = {
            let checkpoints = Arc::clone(&stores.checkpoints);
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    let record = checkpoints.load(run_id).await.unwrap();
                    if record.completed_batch_indices("transform").len() == 3 {
                        token.cancel();
                        return;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                }
            })
        };
        let slow_retry = PIPELINE.replace(
            "retry: {max_attempts: 3, initial_backoff_ms: 1, max_backoff_ms: 2}\n  - id: publish",
            "retry: {max_attempts: 50, initial_backoff_ms: 50, max_backoff_ms: 50}\n  - id: publish",
        );
        assert_ne!(slow_retry, PIPELINE);

        let report = controller_for(&slow_retry, &stores, &connectors, EngineConfig::default())
            .run_workflow(
                "leads",
                Map::new(),
                RunOptions::resume(run_id).with_cancel_token(token),
            )
            .await
            .unwrap();
        watcher.await.unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.error.unwrap().class, ErrorClass::Cancelled);
        assert_eq!(connectors.sink.calls(), 0);
        stores.close().await;
        drop(stores);

        let stores = EngineStores::open(dir.path()).await.unwrap();
        let healthy = Connectors::default();
        let resumed = controller(&stores, &healthy, EngineConfig::default())
            .run_workflow("leads", Map::new(), RunOptions::resume(run_id))
            .await
            .unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(healthy.fetch.calls(), 0);
        assert_eq!(healthy.score.calls(), 1, "only batch 3 re-executes");
        assert_eq!(resumed.step("publish").unwrap().item_count, 4);
    }

    #[tokio::test]
    async fn prune_leaves_unfinished_run_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let stores = EngineStores::open(dir.path()).await.unwrap();
        let config = EngineConfig {
            retention: RetentionPolicy {
                max_age_days: None,
                max_per_step: Some(1),
            },
            ..EngineConfig::default()
        };
        let broken = Connectors {
            score: Flaky::failing_batch(3, u32::MAX),
            ..Connectors::default()
        };
        let first = controller(&stores, &broken, config.clone())
            .run_workflow("leads", Map::new(), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(first.status, RunStatus::Failed);

        let healthy = Connectors::default();
        let ctl = controller(&stores, &healthy, config);
        assert_eq!(ctl.prune_artifacts(chrono::Utc::now()).await.unwrap(), 0);

        let resumed = ctl
            .run_workflow("leads", Map::new(), RunOptions::resume(first.run_id))
            .await
            .unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(healthy.score.calls(), 1);

        // Once complete, the run's older batches are eligible.
        assert_eq!(ctl.prune_artifacts(chrono::Utc::now()).await.unwrap(), 3);
        let remaining = stores
            .artifacts
            .list(&ArtifactFilter::for_step(first.run_id, "transform"))
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn open_creates_layout_and_reads_config() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("nested").join("data");
        let stores = EngineStores::open(&data_dir).await.unwrap();
        assert!(data_dir.join("stagewright.db").exists());
        assert!(data_dir.join("artifacts").is_dir());
        assert_eq!(stores.load_config().await, EngineConfig::default());
    }
}
