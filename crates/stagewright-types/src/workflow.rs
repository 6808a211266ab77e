//! Workflow definition types.
//!
//! A `WorkflowDefinition` is the parsed form of a YAML/JSON workflow document:
//! an ordered list of steps linked by `depends_on` edges, the run parameters
//! they may reference, and the quality gates guarding stage advancement.
//! Immutable once loaded for a run.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::gate::QualityGateDefinition;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A DAG of steps plus the parameters and gates that surround it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Catalog key, e.g. "lead-enrichment".
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Declared run parameters.
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Steps in declaration order. Order breaks scheduling ties.
    pub steps: Vec<StepDefinition>,
    /// Quality gates keyed by the stage they guard.
    #[serde(default)]
    pub gates: Vec<QualityGateDefinition>,
    /// Overrides the engine-wide batch concurrency cap for this workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallelism: Option<usize>,
    /// Run-level deadline in seconds, checked between steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The gate guarding `stage`, if one is declared.
    pub fn gate_for(&self, stage: &str) -> Option<&QualityGateDefinition> {
        self.gates.iter().find(|g| g.stage == stage)
    }

    /// Look up a declared parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within a definition (e.g. "fetch-leads").
    pub id: String,
    /// Human-readable step name. Defaults to the id when omitted.
    #[serde(default)]
    pub name: String,
    /// Connector family.
    pub source: SourceKind,
    /// Operation within the connector family.
    #[serde(rename = "type")]
    pub operation: String,
    /// Step IDs this step depends on. Must be declared earlier.
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
    /// Opaque connector configuration. May contain `${...}` references.
    #[serde(default = "empty_config")]
    pub config: serde_json::Value,
    /// Fan-out descriptor; absent for single-invocation steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelConfig>,
    /// A failed required step halts the run; a failed optional step is skipped.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Per-invocation timeout (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retry override for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

fn empty_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_required() -> bool {
    true
}

impl StepDefinition {
    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

/// Connector families a step can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Parameterized read from an external store.
    Query,
    /// Filtered lookup against an external index.
    Search,
    /// Pure function over materialized prior results.
    Transform,
    /// Content generation from materialized context. Always batch-eligible.
    Generate,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Query => "query",
            SourceKind::Search => "search",
            SourceKind::Transform => "transform",
            SourceKind::Generate => "generate",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fan-out descriptor for a parallel step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParallelConfig {
    /// A single reference expression that resolves to the item array.
    pub items: String,
    /// Items per batch.
    #[serde(alias = "batchSize")]
    pub batch_size: usize,
    /// Concurrency cap for this step's batches.
    #[serde(
        default,
        alias = "maxParallelism",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_parallelism: Option<usize>,
}

/// Retry configuration for connector invocations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total executions including the first (1 = no retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// A declared run parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Required parameters without a default must be supplied by the caller.
    #[serde(default)]
    pub required: bool,
}

/// JSON shape a parameter value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl ParameterType {
    /// Whether `value` has this shape.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            ParameterType::String => matches!(value, Value::String(_)),
            ParameterType::Number => matches!(value, Value::Number(_)),
            ParameterType::Boolean => matches!(value, Value::Bool(_)),
            ParameterType::Array => matches!(value, Value::Array(_)),
            ParameterType::Object => matches!(value, Value::Object(_)),
            ParameterType::Any => true,
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParameterType::String => "string",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
            ParameterType::Object => "object",
            ParameterType::Any => "any",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_defaults_from_yaml() {
        let yaml = r#"
id: fetch
source: query
type: sql
"#;
        let step: StepDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(step.required);
        assert!(step.depends_on.is_empty());
        assert_eq!(step.config, json!({}));
        assert_eq!(step.display_name(), "fetch");
        assert_eq!(step.source, SourceKind::Query);
        assert_eq!(step.operation, "sql");
    }

    #[test]
    fn camel_case_aliases_accepted() {
        let value = json!({
            "id": "score",
            "source": "generate",
            "type": "llm",
            "dependsOn": ["fetch"],
            "parallel": { "items": "${steps.fetch.rows}", "batchSize": 25 }
        });
        let step: StepDefinition = serde_json::from_value(value).unwrap();
        assert_eq!(step.depends_on, vec!["fetch".to_string()]);
        let parallel = step.parallel.unwrap();
        assert_eq!(parallel.batch_size, 25);
        assert!(parallel.max_parallelism.is_none());
    }

    #[test]
    fn parameter_type_accepts() {
        assert!(ParameterType::String.accepts(&json!("acme")));
        assert!(!ParameterType::String.accepts(&json!(3)));
        assert!(ParameterType::Array.accepts(&json!([1, 2])));
        assert!(ParameterType::Any.accepts(&json!(null)));
    }

    #[test]
    fn retry_config_partial_defaults() {
        let retry: RetryConfig = serde_json::from_value(json!({ "max_attempts": 5 })).unwrap();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.initial_backoff_ms, 250);
        assert_eq!(retry.max_backoff_ms, 30_000);
    }
}
