//! Workflow definition parsing, validation, and filesystem discovery.
//!
//! Converts YAML/JSON documents into `WorkflowDefinition`, validates the
//! structural constraints that must hold before any step executes, and
//! resolves caller-supplied run parameters against the declared ones.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use stagewright_types::error::ErrorClass;
use stagewright_types::workflow::{ParameterSpec, WorkflowDefinition};
use thiserror::Error;

use super::dag::validate_dag;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating a workflow definition.
///
/// All of these surface before execution starts.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// A reference expression is malformed or not backed by `depends_on`.
    #[error("reference error: {0}")]
    ReferenceError(String),

    /// Caller-supplied run parameters do not match the declaration.
    #[error("parameter error: {0}")]
    ParameterError(String),
}

impl WorkflowError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WorkflowError::IoError(_) => ErrorClass::Storage,
            _ => ErrorClass::Validation,
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// is guaranteed to be structurally valid.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn is_valid_ident(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Id is non-empty and contains only alphanumerics, hyphens, underscores
/// - Version is a semantic version
/// - At least one step exists; step ids are unique and well-formed
/// - `depends_on` names existing steps, never the step itself, and the graph
///   is acyclic
/// - `depends_on` names only earlier-declared steps
/// - Step configs are mappings
/// - Parallel descriptors have `batch_size >= 1` and a non-empty `items`
/// - Timeouts are > 0, parallelism caps and retry attempts are >= 1
/// - Parameter names are unique and defaults match their declared type
/// - Gates guard existing steps, at most one gate per stage
///
/// Reference expressions inside `config` are checked when the definition is
/// compiled (see `CompiledWorkflow::compile`).
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if !is_valid_ident(&def.id) {
        return Err(WorkflowError::ValidationError(format!(
            "workflow id '{}' must be non-empty and contain only alphanumerics, '-' or '_'",
            def.id
        )));
    }

    if semver::Version::parse(&def.version).is_err() {
        return Err(WorkflowError::ValidationError(format!(
            "workflow version '{}' is not a semantic version",
            def.version
        )));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    // Unique, well-formed step IDs
    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if !is_valid_ident(&step.id) {
            return Err(WorkflowError::ValidationError(format!(
                "step id '{}' must be non-empty and contain only alphanumerics, '-' or '_'",
                step.id
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    for step in &def.steps {
        for dep in &step.depends_on {
            if dep == &step.id {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' depends on itself",
                    step.id
                )));
            }
            if !seen_ids.contains(dep.as_str()) {
                return Err(WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }
    }

    // Cycles are reported as cycles before the declaration-order rule fires.
    validate_dag(&def.steps)?;

    let mut declared = HashSet::new();
    for step in &def.steps {
        for dep in &step.depends_on {
            if !declared.contains(dep.as_str()) {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' depends on '{}', which is declared after it",
                    step.id, dep
                )));
            }
        }
        declared.insert(step.id.as_str());

        if !step.config.is_object() {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}': config must be a mapping",
                step.id
            )));
        }

        if let Some(parallel) = &step.parallel {
            if parallel.batch_size < 1 {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}': batch_size must be >= 1",
                    step.id
                )));
            }
            if parallel.items.trim().is_empty() {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}': parallel.items must be a reference expression",
                    step.id
                )));
            }
            if parallel.max_parallelism == Some(0) {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}': max_parallelism must be >= 1",
                    step.id
                )));
            }
        }

        if step.timeout_secs == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}': timeout must be > 0",
                step.id
            )));
        }

        if let Some(retry) = &step.retry {
            if retry.max_attempts < 1 {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}': retry.max_attempts must be >= 1",
                    step.id
                )));
            }
        }
    }

    if def.max_parallelism == Some(0) {
        return Err(WorkflowError::ValidationError(
            "max_parallelism must be >= 1".to_string(),
        ));
    }

    if def.timeout_secs == Some(0) {
        return Err(WorkflowError::ValidationError(
            "timeout must be > 0".to_string(),
        ));
    }

    let mut param_names = HashSet::new();
    for param in &def.parameters {
        if !param_names.insert(param.name.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate parameter: '{}'",
                param.name
            )));
        }
        if let Some(default) = &param.default {
            if !param.param_type.accepts(default) {
                return Err(WorkflowError::ValidationError(format!(
                    "parameter '{}': default does not match declared type {}",
                    param.name, param.param_type
                )));
            }
        }
    }

    let mut gated = HashSet::new();
    for gate in &def.gates {
        if !seen_ids.contains(gate.stage.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "gate references unknown stage '{}'",
                gate.stage
            )));
        }
        if !gated.insert(gate.stage.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "stage '{}' has more than one gate",
                gate.stage
            )));
        }
        if gate.checks.is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "gate for stage '{}' declares no checks",
                gate.stage
            )));
        }
        if gate.deadline_secs == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "gate for stage '{}': deadline must be > 0",
                gate.stage
            )));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Run parameters
// ---------------------------------------------------------------------------

/// Merge caller-supplied parameters with declared defaults and type-check them.
///
/// Unknown names, missing required values, and type mismatches are all errors.
/// Optional parameters without a value or default are left absent.
pub fn resolve_parameters(
    specs: &[ParameterSpec],
    supplied: &Map<String, Value>,
) -> Result<Map<String, Value>, WorkflowError> {
    for name in supplied.keys() {
        if !specs.iter().any(|p| &p.name == name) {
            return Err(WorkflowError::ParameterError(format!(
                "unknown parameter '{name}'"
            )));
        }
    }

    let mut resolved = Map::new();
    for spec in specs {
        let value = supplied.get(&spec.name).or(spec.default.as_ref());
        match value {
            Some(value) => {
                if !spec.param_type.accepts(value) {
                    return Err(WorkflowError::ParameterError(format!(
                        "parameter '{}' expects {}, got {}",
                        spec.name, spec.param_type, value
                    )));
                }
                resolved.insert(spec.name.clone(), value.clone());
            }
            None if spec.required => {
                return Err(WorkflowError::ParameterError(format!(
                    "missing required parameter '{}'",
                    spec.name
                )));
            }
            None => {}
        }
    }
    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a `.yaml`, `.yml`, or `.json` file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

/// Discover all workflow files directly or recursively under `base_dir`.
///
/// Returns `(path, definition)` pairs sorted by path. Files that fail to parse
/// are logged and skipped.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_workflow = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml" | "json")
        );
        if !is_workflow {
            continue;
        }
        match load_workflow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(err) => {
                tracing::warn!(?path, error = %err, "skipping invalid workflow file");
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
