//! Local filesystem artifact store.
//!
//! Implements `ArtifactStore` from `stagewright-core`. Bytes are stored once
//! per digest under `{root}/objects/`; the `artifacts` table in SQLite indexes
//! them by run/step/batch key.
//!
//! ```text
//! {root}/objects/
//!   3a/
//!     3a7bd3e2360a3d29eea436fcfb7e44c735d117c42d1c1835420b6b9942dd4f1b
//!   e3/
//!     e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855
//! ```
//!
//! On each put:
//! 1. Hash the bytes
//! 2. Return the existing index entry if the key already holds this checksum
//! 3. Write the object to a temp file in its directory, then rename into place
//! 4. Insert the index entry
//!
//! Puts hold a shared object lock from the existence check through the index
//! insert; pruning holds it exclusively while it counts references and
//! unlinks, so an object is never removed under a put that just reused it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sqlx::Row;
use stagewright_core::hash::ContentHasher;
use stagewright_core::store::artifact::{
    apply_limit, select_for_pruning, sort_newest_first, verify_artifact_bytes,
};
use stagewright_core::store::{ArtifactError, ArtifactStore};
use stagewright_types::artifact::{Artifact, ArtifactFilter, ArtifactMetadata, RetentionPolicy};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::crypto::hash::Sha256ContentHasher;
use crate::sqlite::pool::DatabasePool;

const LOCATION_SCHEME: &str = "file://";

/// Content-addressed filesystem store with a SQLite index.
pub struct FsArtifactStore<H: ContentHasher = Sha256ContentHasher> {
    root: PathBuf,
    pool: DatabasePool,
    hasher: H,
    objects: RwLock<()>,
}

impl FsArtifactStore<Sha256ContentHasher> {
    /// Store rooted at `root`, hashing with SHA-256.
    pub fn new(root: PathBuf, pool: DatabasePool) -> Self {
        Self::with_hasher(root, pool, Sha256ContentHasher::new())
    }
}

impl<H: ContentHasher> FsArtifactStore<H> {
    pub fn with_hasher(root: PathBuf, pool: DatabasePool, hasher: H) -> Self {
        Self {
            root,
            pool,
            hasher,
            objects: RwLock::new(()),
        }
    }

    /// Directory holding the object files.
    fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    /// `{root}/objects/{first two hex chars}/{digest}`.
    fn object_path(&self, digest: &str) -> PathBuf {
        let fanout = digest.get(..2).unwrap_or("00");
        self.objects_dir().join(fanout).join(digest)
    }

    /// Write `bytes` to `path` via a sibling temp file and an atomic rename.
    async fn write_object(&self, path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
        let dir = path
            .parent()
            .ok_or_else(|| ArtifactError::Storage(format!("no parent for {}", path.display())))?;
        tokio::fs::create_dir_all(dir).await?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("object");
        let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::now_v7().simple()));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn find(&self, key: &str, checksum: &str) -> Result<Option<Artifact>, ArtifactError> {
        let row = sqlx::query("SELECT * FROM artifacts WHERE key = ? AND checksum = ?")
            .bind(key)
            .bind(checksum)
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(row_to_artifact).transpose()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn storage_err(e: sqlx::Error) -> ArtifactError {
    ArtifactError::Storage(e.to_string())
}

fn location_for(path: &Path) -> String {
    format!("{LOCATION_SCHEME}{}", path.display())
}

fn path_for(location: &str) -> Result<PathBuf, ArtifactError> {
    location
        .strip_prefix(LOCATION_SCHEME)
        .map(PathBuf::from)
        .ok_or_else(|| ArtifactError::Storage(format!("unsupported artifact location '{location}'")))
}

fn row_to_artifact(row: &sqlx::sqlite::SqliteRow) -> Result<Artifact, ArtifactError> {
    let id: String = row.try_get("id").map_err(storage_err)?;
    let run_id: String = row.try_get("run_id").map_err(storage_err)?;
    let batch_index: Option<i64> = row.try_get("batch_index").map_err(storage_err)?;
    let checksum: String = row.try_get("checksum").map_err(storage_err)?;
    let size_bytes: i64 = row.try_get("size_bytes").map_err(storage_err)?;
    let created_at: String = row.try_get("created_at").map_err(storage_err)?;

    Ok(Artifact {
        id: parse_uuid(&id)?,
        key: row.try_get("key").map_err(storage_err)?,
        run_id: parse_uuid(&run_id)?,
        step_id: row.try_get("step_id").map_err(storage_err)?,
        batch_index: batch_index.map(|i| i as usize),
        checksum: checksum.parse().map_err(ArtifactError::Storage)?,
        location: row.try_get("location").map_err(storage_err)?,
        size_bytes: size_bytes as u64,
        created_at: parse_datetime(&created_at)?,
    })
}

fn parse_uuid(s: &str) -> Result<Uuid, ArtifactError> {
    s.parse::<Uuid>()
        .map_err(|e| ArtifactError::Storage(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, ArtifactError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ArtifactError::Storage(format!("invalid datetime: {e}")))
}

// ---------------------------------------------------------------------------
// ArtifactStore impl
// ---------------------------------------------------------------------------

impl<H: ContentHasher> ArtifactStore for FsArtifactStore<H> {
    async fn put(
        &self,
        bytes: &[u8],
        metadata: &ArtifactMetadata,
    ) -> Result<Artifact, ArtifactError> {
        let checksum = self.hasher.checksum(bytes);
        let checksum_str = checksum.to_string();
        let key = metadata.key();
        let path = self.object_path(&checksum.digest);
        let _objects = self.objects.read().await;

        if let Some(existing) = self.find(&key, &checksum_str).await? {
            // Re-create the object if it went missing underneath the index.
            if !tokio::fs::try_exists(&path).await? {
                self.write_object(&path, bytes).await?;
            }
            return Ok(existing);
        }

        if !tokio::fs::try_exists(&path).await? {
            self.write_object(&path, bytes).await?;
        }

        let artifact = Artifact {
            id: Uuid::now_v7(),
            key,
            run_id: metadata.run_id,
            step_id: metadata.step_id.clone(),
            batch_index: metadata.batch_index,
            checksum,
            location: location_for(&path),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };

        let inserted = sqlx::query(
            r#"INSERT INTO artifacts
               (id, key, run_id, step_id, batch_index, checksum, location, size_bytes, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(key, checksum) DO NOTHING"#,
        )
        .bind(artifact.id.to_string())
        .bind(&artifact.key)
        .bind(artifact.run_id.to_string())
        .bind(&artifact.step_id)
        .bind(artifact.batch_index.map(|i| i as i64))
        .bind(&checksum_str)
        .bind(&artifact.location)
        .bind(artifact.size_bytes as i64)
        .bind(artifact.created_at.to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(storage_err)?;

        if inserted.rows_affected() == 0 {
            // A concurrent put of the same bytes won.
            return self
                .find(&artifact.key, &checksum_str)
                .await?
                .ok_or_else(|| ArtifactError::NotFound(artifact.key.clone()));
        }

        tracing::debug!(
            artifact_id = %artifact.id,
            key = artifact.key.as_str(),
            checksum = checksum_str.as_str(),
            size_bytes = artifact.size_bytes,
            "artifact stored"
        );
        Ok(artifact)
    }

    async fn get(&self, artifact: &Artifact) -> Result<Vec<u8>, ArtifactError> {
        let path = path_for(&artifact.location)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(artifact.location.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        verify_artifact_bytes(&self.hasher, artifact, &bytes)?;
        Ok(bytes)
    }

    async fn list(&self, filter: &ArtifactFilter) -> Result<Vec<Artifact>, ArtifactError> {
        let rows = sqlx::query(
            r#"SELECT * FROM artifacts
               WHERE (?1 IS NULL OR run_id = ?1)
                 AND (?2 IS NULL OR step_id = ?2)
                 AND (?3 IS NULL OR key = ?3)"#,
        )
        .bind(filter.run_id.map(|id| id.to_string()))
        .bind(filter.step_id.as_deref())
        .bind(filter.key.as_deref())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(storage_err)?;

        let mut artifacts = rows
            .iter()
            .map(row_to_artifact)
            .collect::<Result<Vec<_>, _>>()?;
        sort_newest_first(&mut artifacts);
        Ok(apply_limit(artifacts, filter))
    }

    async fn prune(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
        protected: &BTreeSet<Uuid>,
    ) -> Result<usize, ArtifactError> {
        let _objects = self.objects.write().await;
        let all = self.list(&ArtifactFilter::default()).await?;
        let doomed = select_for_pruning(&all, policy, now, protected);
        if doomed.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.writer.begin().await.map_err(storage_err)?;
        for id in &doomed {
            sqlx::query("DELETE FROM artifacts WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;

        // Objects are shared by digest; remove only those nothing references.
        let mut locations: Vec<&str> = all
            .iter()
            .filter(|a| doomed.contains(&a.id))
            .map(|a| a.location.as_str())
            .collect();
        locations.sort_unstable();
        locations.dedup();
        for location in locations {
            let (refs,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM artifacts WHERE location = ?")
                .bind(location)
                .fetch_one(&self.pool.writer)
                .await
                .map_err(storage_err)?;
            if refs > 0 {
                continue;
            }
            match tokio::fs::remove_file(path_for(location)?).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(location, error = %e, "failed to remove pruned artifact object");
                }
            }
        }

        tracing::info!(pruned = doomed.len(), "artifacts pruned");
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn test_store() -> (FsArtifactStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open(dir.path()).await.unwrap();
        (FsArtifactStore::new(dir.path().to_path_buf(), pool), dir)
    }

    #[tokio::test]
    async fn put_get_round_trip_with_sha256_location() {
        let (store, dir) = test_store().await;
        let run_id = Uuid::now_v7();
        let bytes = br#"[{"id":1},{"id":2}]"#;

        let artifact = store
            .put(bytes, &ArtifactMetadata::batch(run_id, "score", 3))
            .await
            .unwrap();
        assert_eq!(artifact.key, format!("{run_id}/score/batch-3"));
        assert_eq!(artifact.checksum.algorithm, "sha256");
        assert!(artifact.location.starts_with("file://"));
        assert!(artifact.location.contains(&dir.path().display().to_string()));
        assert_eq!(store.get(&artifact).await.unwrap(), bytes.to_vec());
    }

    #[tokio::test]
    async fn identical_put_returns_existing_entry() {
        let (store, _dir) = test_store().await;
        let meta = ArtifactMetadata::batch(Uuid::now_v7(), "score", 0);
        let first = store.put(b"rows", &meta).await.unwrap();
        let second = store.put(b"rows", &meta).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list(&ArtifactFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn different_bytes_under_same_key_are_versions() {
        let (store, _dir) = test_store().await;
        let meta = ArtifactMetadata::batch(Uuid::now_v7(), "score", 0);
        let v1 = store.put(b"first", &meta).await.unwrap();
        let v2 = store.put(b"second", &meta).await.unwrap();
        assert_ne!(v1.id, v2.id);
        assert_eq!(store.get(&v1).await.unwrap(), b"first");
        assert_eq!(store.get(&v2).await.unwrap(), b"second");

        let listed = store.list(&ArtifactFilter::default()).await.unwrap();
        assert_eq!(listed.iter().map(|a| a.id).collect::<Vec<_>>(), vec![v2.id, v1.id]);
    }

    #[tokio::test]
    async fn tampered_object_is_integrity_error() {
        let (store, _dir) = test_store().await;
        let artifact = store
            .put(b"payload", &ArtifactMetadata::step_result(Uuid::now_v7(), "fetch"))
            .await
            .unwrap();
        tokio::fs::write(path_for(&artifact.location).unwrap(), b"pAyload")
            .await
            .unwrap();

        let err = store.get(&artifact).await.unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let (store, _dir) = test_store().await;
        let artifact = store
            .put(b"payload", &ArtifactMetadata::step_result(Uuid::now_v7(), "fetch"))
            .await
            .unwrap();
        tokio::fs::remove_file(path_for(&artifact.location).unwrap())
            .await
            .unwrap();
        assert!(matches!(
            store.get(&artifact).await.unwrap_err(),
            ArtifactError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn list_filters_by_run_and_step() {
        let (store, _dir) = test_store().await;
        let run_a = Uuid::now_v7();
        let run_b = Uuid::now_v7();
        store.put(b"a0", &ArtifactMetadata::batch(run_a, "score", 0)).await.unwrap();
        store.put(b"a1", &ArtifactMetadata::batch(run_a, "score", 1)).await.unwrap();
        store.put(b"af", &ArtifactMetadata::step_result(run_a, "fetch")).await.unwrap();
        store.put(b"b0", &ArtifactMetadata::batch(run_b, "score", 0)).await.unwrap();

        assert_eq!(store.list(&ArtifactFilter::for_run(run_a)).await.unwrap().len(), 3);
        assert_eq!(
            store.list(&ArtifactFilter::for_step(run_a, "score")).await.unwrap().len(),
            2
        );
        let limited = ArtifactFilter {
            limit: Some(1),
            ..ArtifactFilter::for_run(run_a)
        };
        assert_eq!(store.list(&limited).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_puts_of_same_bytes_converge() {
        let (store, _dir) = test_store().await;
        let store = std::sync::Arc::new(store);
        let meta = ArtifactMetadata::batch(Uuid::now_v7(), "score", 0);
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let store = std::sync::Arc::clone(&store);
            let meta = meta.clone();
            tasks.spawn(async move { store.put(b"same", &meta).await });
        }
        let mut ids = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            ids.push(joined.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn prune_skips_protected_and_other_runs() {
        let (store, _dir) = test_store().await;
        let resumable = Uuid::now_v7();
        let other = Uuid::now_v7();
        let batch0 = store
            .put(b"b0", &ArtifactMetadata::batch(resumable, "score", 0))
            .await
            .unwrap();
        let batch1 = store
            .put(b"b1", &ArtifactMetadata::batch(resumable, "score", 1))
            .await
            .unwrap();
        let foreign = store
            .put(b"b0", &ArtifactMetadata::batch(other, "score", 0))
            .await
            .unwrap();

        let policy = RetentionPolicy {
            max_age_days: None,
            max_per_step: Some(1),
        };
        let pruned = store
            .prune(&policy, Utc::now(), &BTreeSet::from([batch0.id]))
            .await
            .unwrap();
        assert_eq!(pruned, 0);
        assert_eq!(store.get(&batch0).await.unwrap(), b"b0");
        assert_eq!(store.get(&batch1).await.unwrap(), b"b1");
        assert_eq!(store.get(&foreign).await.unwrap(), b"b0");
    }

    #[tokio::test]
    async fn put_racing_prune_never_loses_its_object() {
        let (store, _dir) = test_store().await;
        let store = std::sync::Arc::new(store);
        let run_id = Uuid::now_v7();
        store
            .put(b"shared", &ArtifactMetadata::step_result(run_id, "fetch"))
            .await
            .unwrap();
        store
            .put(b"newer", &ArtifactMetadata::step_result(run_id, "fetch"))
            .await
            .unwrap();
        let policy = RetentionPolicy {
            max_age_days: None,
            max_per_step: Some(1),
        };

        let pruner = {
            let store = std::sync::Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .prune(&policy, Utc::now(), &BTreeSet::new())
                    .await
                    .unwrap()
            })
        };
        let reused = store
            .put(b"shared", &ArtifactMetadata::batch(Uuid::now_v7(), "fetch", 0))
            .await
            .unwrap();
        assert_eq!(pruner.await.unwrap(), 1);
        assert_eq!(store.get(&reused).await.unwrap(), b"shared");
    }

    #[tokio::test]
    async fn prune_keeps_newest_and_removes_unreferenced_objects() {
        let (store, _dir) = test_store().await;
        let run_id = Uuid::now_v7();
        let old = store
            .put(b"old", &ArtifactMetadata::step_result(run_id, "fetch"))
            .await
            .unwrap();
        let newest = store
            .put(b"new", &ArtifactMetadata::step_result(run_id, "fetch"))
            .await
            .unwrap();

        let policy = RetentionPolicy {
            max_age_days: None,
            max_per_step: Some(1),
        };
        let pruned = store
            .prune(&policy, Utc::now() + Duration::days(1), &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(pruned, 1);

        let remaining = store.list(&ArtifactFilter::default()).await.unwrap();
        assert_eq!(remaining, vec![newest.clone()]);
        assert!(!path_for(&old.location).unwrap().exists());
        assert_eq!(store.get(&newest).await.unwrap(), b"new");
    }
}
