//! Artifact Store port.
//!
//! Content-addressed persistence of step and batch outputs. Every read
//! re-verifies the checksum recorded at write time; a mismatch is an
//! `ArtifactError::Integrity`, which is always fatal and never retried.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use stagewright_types::artifact::{Artifact, ArtifactFilter, ArtifactMetadata, RetentionPolicy};
use stagewright_types::error::ErrorClass;
use uuid::Uuid;

use crate::hash::ContentHasher;

/// Errors from artifact persistence.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// Stored bytes no longer match their recorded checksum.
    #[error("integrity error for artifact '{key}': expected {expected}, found {actual}")]
    Integrity {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("artifact storage error: {0}")]
    Storage(String),
}

impl ArtifactError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ArtifactError::Integrity { .. } => ErrorClass::Integrity,
            ArtifactError::NotFound(_) | ArtifactError::Storage(_) => ErrorClass::Storage,
        }
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, ArtifactError::Integrity { .. })
    }
}

impl From<std::io::Error> for ArtifactError {
    fn from(err: std::io::Error) -> Self {
        ArtifactError::Storage(err.to_string())
    }
}

/// Durable, checksum-verified byte storage with a queryable index.
///
/// Uses RPITIT for async methods; implementations must support concurrent
/// `put` calls from batch workers.
pub trait ArtifactStore: Send + Sync {
    /// Hash and persist `bytes`, then append an index entry.
    ///
    /// Putting bytes whose checksum matches an existing entry under the same
    /// key returns that entry unchanged.
    fn put(
        &self,
        bytes: &[u8],
        metadata: &ArtifactMetadata,
    ) -> impl Future<Output = Result<Artifact, ArtifactError>> + Send;

    /// Read the bytes behind `artifact`, re-verifying size and checksum.
    fn get(
        &self,
        artifact: &Artifact,
    ) -> impl Future<Output = Result<Vec<u8>, ArtifactError>> + Send;

    /// Index entries matching `filter`, newest first.
    fn list(
        &self,
        filter: &ArtifactFilter,
    ) -> impl Future<Output = Result<Vec<Artifact>, ArtifactError>> + Send;

    /// Remove entries according to `policy`, never touching an id in
    /// `protected`. Returns how many were removed.
    fn prune(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
        protected: &BTreeSet<Uuid>,
    ) -> impl Future<Output = Result<usize, ArtifactError>> + Send;
}

/// Check `bytes` against the size and checksum recorded in `artifact`.
pub fn verify_artifact_bytes<H: ContentHasher + ?Sized>(
    hasher: &H,
    artifact: &Artifact,
    bytes: &[u8],
) -> Result<(), ArtifactError> {
    if hasher.verify(&artifact.checksum, bytes) && bytes.len() as u64 == artifact.size_bytes {
        return Ok(());
    }
    let actual = hasher.checksum(bytes);
    tracing::error!(
        artifact_id = %artifact.id,
        key = artifact.key.as_str(),
        expected = %artifact.checksum,
        actual = %actual,
        "artifact checksum mismatch"
    );
    Err(ArtifactError::Integrity {
        key: artifact.key.clone(),
        expected: artifact.checksum.to_string(),
        actual: actual.to_string(),
    })
}

/// Newest-first ordering: creation time, then id (UUIDv7 ids are time-ordered).
pub fn sort_newest_first(artifacts: &mut [Artifact]) {
    artifacts.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Apply a filter's `limit` to an already-sorted list.
pub fn apply_limit(mut artifacts: Vec<Artifact>, filter: &ArtifactFilter) -> Vec<Artifact> {
    if let Some(limit) = filter.limit {
        artifacts.truncate(limit);
    }
    artifacts
}

/// Pick the entries `policy` removes.
///
/// Entries are grouped by (run id, step id). Within a group the newest entry
/// is always kept; the rest are removed when they are older than
/// `max_age_days` or rank beyond `max_per_step`. Ids in `protected` are never
/// selected.
pub fn select_for_pruning(
    artifacts: &[Artifact],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    protected: &BTreeSet<Uuid>,
) -> Vec<Uuid> {
    if policy.is_noop() {
        return Vec::new();
    }

    let mut groups: HashMap<(Uuid, &str), Vec<Artifact>> = HashMap::new();
    for artifact in artifacts {
        groups
            .entry((artifact.run_id, artifact.step_id.as_str()))
            .or_default()
            .push(artifact.clone());
    }

    let cutoff = policy
        .max_age_days
        .map(|days| now - Duration::days(i64::from(days)));
    let max_per_step = policy.max_per_step.map(|n| n.max(1));

    let mut doomed = Vec::new();
    for (_, mut group) in groups {
        sort_newest_first(&mut group);
        for (rank, artifact) in group.iter().enumerate().skip(1) {
            if protected.contains(&artifact.id) {
                continue;
            }
            let too_old = cutoff.is_some_and(|c| artifact.created_at < c);
            let over_cap = max_per_step.is_some_and(|cap| rank >= cap);
            if too_old || over_cap {
                doomed.push(artifact.id);
            }
        }
    }
    doomed
}
