//! Artifact metadata types.
//!
//! An artifact is a checksum-verified, persisted output of a step or of one
//! batch of a parallel step. The bytes live in a storage backend; these types
//! describe them in the index.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Algorithm-tagged content digest, rendered as `<algorithm>:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    pub algorithm: String,
    pub digest: String,
}

impl Checksum {
    pub fn new(algorithm: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            digest: digest.into(),
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}

impl FromStr for Checksum {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((algorithm, digest)) if !algorithm.is_empty() && !digest.is_empty() => {
                Ok(Self::new(algorithm, digest))
            }
            _ => Err(format!("checksum '{s}' is not of the form <algorithm>:<digest>")),
        }
    }
}

impl TryFrom<String> for Checksum {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.to_string()
    }
}

/// Index entry for one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    /// Run/step/batch-qualified key (see [`artifact_key`]).
    pub key: String,
    pub run_id: Uuid,
    pub step_id: String,
    /// Batch index for batch artifacts, `None` for a step's final result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<usize>,
    pub checksum: Checksum,
    /// Backend-qualified location, e.g. `file:///var/lib/stagewright/objects/ab/cd..`.
    pub location: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// What a caller supplies when putting bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMetadata {
    pub run_id: Uuid,
    pub step_id: String,
    pub batch_index: Option<usize>,
}

impl ArtifactMetadata {
    pub fn step_result(run_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
            batch_index: None,
        }
    }

    pub fn batch(run_id: Uuid, step_id: impl Into<String>, batch_index: usize) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
            batch_index: Some(batch_index),
        }
    }

    pub fn key(&self) -> String {
        artifact_key(self.run_id, &self.step_id, self.batch_index)
    }
}

/// `{run_id}/{step_id}/batch-{n}` for batches, `{run_id}/{step_id}/result` otherwise.
pub fn artifact_key(run_id: Uuid, step_id: &str, batch_index: Option<usize>) -> String {
    match batch_index {
        Some(n) => format!("{run_id}/{step_id}/batch-{n}"),
        None => format!("{run_id}/{step_id}/result"),
    }
}

/// Index query. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactFilter {
    pub run_id: Option<Uuid>,
    pub step_id: Option<String>,
    pub key: Option<String>,
    pub limit: Option<usize>,
}

impl ArtifactFilter {
    pub fn for_run(run_id: Uuid) -> Self {
        Self {
            run_id: Some(run_id),
            ..Self::default()
        }
    }

    pub fn for_step(run_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            run_id: Some(run_id),
            step_id: Some(step_id.into()),
            ..Self::default()
        }
    }

    /// Whether `artifact` satisfies every set field (ignores `limit`).
    pub fn matches(&self, artifact: &Artifact) -> bool {
        self.run_id.is_none_or(|id| artifact.run_id == id)
            && self
                .step_id
                .as_deref()
                .is_none_or(|s| artifact.step_id == s)
            && self.key.as_deref().is_none_or(|k| artifact.key == k)
    }
}

/// Retention rules applied by `prune`.
///
/// Artifacts still referenced by the checkpoint of a run that has not
/// completed are exempt, so pruning never breaks a resume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Prune artifacts older than this many days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u32>,
    /// Keep at most this many artifacts per (run, step).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_per_step: Option<usize>,
}

impl RetentionPolicy {
    pub fn is_noop(&self) -> bool {
        self.max_age_days.is_none() && self.max_per_step.is_none()
    }
}
