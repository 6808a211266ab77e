//! Engine configuration types.
//!
//! Deserialized from `stagewright.toml` in the data directory. Every field has
//! a default so a partial (or missing) file is valid.

use serde::{Deserialize, Serialize};

use crate::artifact::RetentionPolicy;
use crate::workflow::RetryConfig;

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent batches per parallel step.
    pub max_parallelism: usize,
    /// Serialized results larger than this go to the artifact store.
    pub inline_result_limit_bytes: usize,
    /// Timeout for one invocation of a non-parallel step.
    pub step_timeout_secs: u64,
    /// Timeout for one batch invocation.
    pub batch_timeout_secs: u64,
    pub retry: RetryConfig,
    pub retention: RetentionPolicy,
    /// Default review deadline for escalated gates.
    pub escalation_deadline_secs: u64,
    pub telemetry: TelemetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            inline_result_limit_bytes: 64 * 1024,
            step_timeout_secs: 300,
            batch_timeout_secs: 120,
            retry: RetryConfig::default(),
            retention: RetentionPolicy::default(),
            escalation_deadline_secs: 24 * 60 * 60,
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Logging and trace export settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Bridge spans to OpenTelemetry (stdout exporter).
    pub otel: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
            otel: false,
        }
    }
}
