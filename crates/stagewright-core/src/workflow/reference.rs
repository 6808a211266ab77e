//! Reference expressions: `${steps.<id>.<path>}`, `${parameters.<name>}`,
//! `${run.id}` and `${run.<identifier>}`.
//!
//! Config values are compiled once into a `ConfigExpr` tree when a definition
//! is registered. Resolution walks that tree against a `ResolutionScope`; no
//! string is ever re-scanned or evaluated at run time.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};
use stagewright_types::error::ErrorClass;
use thiserror::Error;
use uuid::Uuid;

use super::context::StepOutputs;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A reference that cannot be parsed or resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("malformed reference '{input}': {reason}")]
    Syntax { input: String, reason: String },

    #[error("{0} refers to a step that has not produced output")]
    StepNotRun(String),

    #[error("{0} refers to an unknown parameter")]
    UnknownParameter(String),

    #[error("{0} refers to an unknown run identifier")]
    UnknownIdentifier(String),

    #[error("{reference}: path segment '{segment}' not found")]
    PathNotFound { reference: String, segment: String },

    #[error("{0} must resolve to an array")]
    NotAnArray(String),
}

impl ResolutionError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Resolution
    }

    fn syntax(input: &str, reason: impl Into<String>) -> Self {
        ResolutionError::Syntax {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// One step of a dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    /// All-digit segments. Also matches the same string as an object key.
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => f.write_str(k),
            PathSegment::Index(i) => write!(f, "{i}"),
        }
    }
}

/// A single parsed `${...}` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Step { step_id: String, path: Vec<PathSegment> },
    Parameter { name: String, path: Vec<PathSegment> },
    /// `${run.id}` or a run-scoped identifier.
    Run { name: String },
}

impl Reference {
    /// The step this reference reads, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Reference::Step { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    /// Parse the body of a `${...}` expression (without the delimiters).
    pub fn parse(body: &str) -> Result<Self, ResolutionError> {
        let trimmed = body.trim();
        let mut parts = trimmed.split('.');
        let root = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();

        if rest.iter().any(|p| p.is_empty()) {
            return Err(ResolutionError::syntax(trimmed, "empty path segment"));
        }

        match root {
            "steps" => {
                let (step_id, path) = rest
                    .split_first()
                    .ok_or_else(|| ResolutionError::syntax(trimmed, "missing step id"))?;
                Ok(Reference::Step {
                    step_id: step_id.to_string(),
                    path: parse_path(path),
                })
            }
            "parameters" => {
                let (name, path) = rest
                    .split_first()
                    .ok_or_else(|| ResolutionError::syntax(trimmed, "missing parameter name"))?;
                Ok(Reference::Parameter {
                    name: name.to_string(),
                    path: parse_path(path),
                })
            }
            "run" => match rest.as_slice() {
                [name] => Ok(Reference::Run {
                    name: name.to_string(),
                }),
                _ => Err(ResolutionError::syntax(
                    trimmed,
                    "expected ${run.id} or ${run.<identifier>}",
                )),
            },
            "" => Err(ResolutionError::syntax(trimmed, "empty expression")),
            other => Err(ResolutionError::syntax(
                trimmed,
                format!("unknown root '{other}' (expected steps, parameters or run)"),
            )),
        }
    }

    /// Evaluate against `scope`.
    pub fn resolve(&self, scope: &ResolutionScope<'_>) -> Result<Value, ResolutionError> {
        match self {
            Reference::Step { step_id, path } => {
                let data = scope
                    .outputs
                    .get(step_id)
                    .ok_or_else(|| ResolutionError::StepNotRun(self.to_string()))?;
                self.walk(data, path)
            }
            Reference::Parameter { name, path } => {
                let value = scope
                    .parameters
                    .get(name)
                    .ok_or_else(|| ResolutionError::UnknownParameter(self.to_string()))?;
                self.walk(value, path)
            }
            Reference::Run { name } if name == "id" => Ok(Value::String(scope.run_id.to_string())),
            Reference::Run { name } => scope
                .identifiers
                .get(name)
                .map(|v| Value::String(v.clone()))
                .ok_or_else(|| ResolutionError::UnknownIdentifier(self.to_string())),
        }
    }

    fn walk(&self, root: &Value, path: &[PathSegment]) -> Result<Value, ResolutionError> {
        let mut current = root;
        for segment in path {
            let next = match (segment, current) {
                (PathSegment::Key(k), Value::Object(map)) => map.get(k),
                (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
                (PathSegment::Index(i), Value::Object(map)) => map.get(&i.to_string()),
                _ => None,
            };
            current = next.ok_or_else(|| ResolutionError::PathNotFound {
                reference: self.to_string(),
                segment: segment.to_string(),
            })?;
        }
        Ok(current.clone())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (root, head, path) = match self {
            Reference::Step { step_id, path } => ("steps", step_id, path.as_slice()),
            Reference::Parameter { name, path } => ("parameters", name, path.as_slice()),
            Reference::Run { name } => ("run", name, [].as_slice()),
        };
        write!(f, "${{{root}.{head}")?;
        for segment in path {
            write!(f, ".{segment}")?;
        }
        f.write_str("}")
    }
}

fn parse_path(parts: &[&str]) -> Vec<PathSegment> {
    parts
        .iter()
        .map(|p| match p.parse::<usize>() {
            Ok(i) if p.bytes().all(|b| b.is_ascii_digit()) => PathSegment::Index(i),
            _ => PathSegment::Key(p.to_string()),
        })
        .collect()
}

/// A piece of a string template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Ref(Reference),
}

/// Split a config string into literal and reference segments.
///
/// `$${` produces a literal `${`. An unterminated `${` is a syntax error.
pub fn parse_template(input: &str) -> Result<Vec<Segment>, ResolutionError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = input;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("$${") {
            literal.push_str("${");
            rest = after;
        } else if let Some(after) = rest.strip_prefix("${") {
            let end = after
                .find('}')
                .ok_or_else(|| ResolutionError::syntax(input, "unterminated '${'"))?;
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Ref(Reference::parse(&after[..end])?));
            rest = &after[end + 1..];
        } else {
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                literal.push(c);
            }
            rest = chars.as_str();
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

// ---------------------------------------------------------------------------
// Compiled config
// ---------------------------------------------------------------------------

/// A config value with every reference parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigExpr {
    Literal(Value),
    /// A string that is exactly one reference; resolves to the typed value.
    Ref(Reference),
    /// A string mixing literals and references; resolves to a string.
    Template(Vec<Segment>),
    Array(Vec<ConfigExpr>),
    Object(Vec<(String, ConfigExpr)>),
}

impl ConfigExpr {
    /// Compile a raw config value.
    pub fn compile(value: &Value) -> Result<Self, ResolutionError> {
        match value {
            Value::String(s) => {
                let mut segments = parse_template(s)?;
                let has_refs = segments.iter().any(|s| matches!(s, Segment::Ref(_)));
                if !has_refs {
                    // Escapes are already folded into the literal.
                    let text = match segments.pop() {
                        Some(Segment::Literal(text)) => text,
                        _ => String::new(),
                    };
                    return Ok(ConfigExpr::Literal(Value::String(text)));
                }
                if segments.len() == 1 {
                    if let Some(Segment::Ref(reference)) = segments.pop() {
                        return Ok(ConfigExpr::Ref(reference));
                    }
                }
                Ok(ConfigExpr::Template(segments))
            }
            Value::Array(items) => Ok(ConfigExpr::Array(
                items.iter().map(Self::compile).collect::<Result<_, _>>()?,
            )),
            Value::Object(map) => Ok(ConfigExpr::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Self::compile(v)?)))
                    .collect::<Result<_, ResolutionError>>()?,
            )),
            other => Ok(ConfigExpr::Literal(other.clone())),
        }
    }

    /// Every reference in the tree, in document order.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            ConfigExpr::Literal(_) => {}
            ConfigExpr::Ref(r) => out.push(r),
            ConfigExpr::Template(segments) => out.extend(segments.iter().filter_map(|s| match s {
                Segment::Ref(r) => Some(r),
                Segment::Literal(_) => None,
            })),
            ConfigExpr::Array(items) => items.iter().for_each(|i| i.collect_refs(out)),
            ConfigExpr::Object(entries) => entries.iter().for_each(|(_, v)| v.collect_refs(out)),
        }
    }

    /// Produce the fully materialized value.
    pub fn resolve(&self, scope: &ResolutionScope<'_>) -> Result<Value, ResolutionError> {
        match self {
            ConfigExpr::Literal(v) => Ok(v.clone()),
            ConfigExpr::Ref(r) => r.resolve(scope),
            ConfigExpr::Template(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Literal(text) => out.push_str(text),
                        Segment::Ref(r) => out.push_str(&value_to_string(&r.resolve(scope)?)),
                    }
                }
                Ok(Value::String(out))
            }
            ConfigExpr::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|i| i.resolve(scope))
                    .collect::<Result<_, _>>()?,
            )),
            ConfigExpr::Object(entries) => {
                let mut map = Map::new();
                for (k, v) in entries {
                    map.insert(k.clone(), v.resolve(scope)?);
                }
                Ok(Value::Object(map))
            }
        }
    }

    /// Resolve and require an array, as for a parallel step's `items`.
    pub fn resolve_items(&self, scope: &ResolutionScope<'_>) -> Result<Vec<Value>, ResolutionError> {
        match self.resolve(scope)? {
            Value::Array(items) => Ok(items),
            _ => Err(ResolutionError::NotAnArray(self.describe())),
        }
    }

    fn describe(&self) -> String {
        match self {
            ConfigExpr::Ref(r) => r.to_string(),
            ConfigExpr::Literal(v) => v.to_string(),
            _ => "expression".to_string(),
        }
    }
}

/// Everything a reference can read during one step's resolution.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionScope<'a> {
    pub outputs: &'a StepOutputs,
    pub parameters: &'a Map<String, Value>,
    pub run_id: Uuid,
    pub identifiers: &'a BTreeMap<String, String>,
}

/// Convert a JSON value to its interpolated string form.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects and arrays interpolate as compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
