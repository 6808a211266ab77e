//! Explicit per-run state.
//!
//! `RunContext` carries everything a component may need to know about the
//! run it serves. Nothing is read from ambient globals, so any number of runs
//! can share a process.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::reference::ResolutionScope;

/// Identity, inputs, and cancellation for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub definition_id: String,
    /// Resolved run parameters (defaults applied, types checked).
    pub parameters: Map<String, Value>,
    /// Run-scoped identifiers as stored in the checkpoint.
    pub identifiers: BTreeMap<String, String>,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(run_id: Uuid, definition_id: impl Into<String>) -> Self {
        Self {
            run_id,
            definition_id: definition_id.into(),
            parameters: Map::new(),
            identifiers: BTreeMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolution scope over this run and the outputs produced so far.
    pub fn scope<'a>(&'a self, outputs: &'a StepOutputs) -> ResolutionScope<'a> {
        ResolutionScope {
            outputs,
            parameters: &self.parameters,
            run_id: self.run_id,
            identifiers: &self.identifiers,
        }
    }
}

/// Materialized data of steps that have produced output in this run.
///
/// Each entry is written once by the step that produced it and is read-only
/// afterwards.
#[derive(Debug, Clone, Default)]
pub struct StepOutputs {
    data: HashMap<String, Value>,
}

impl StepOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `step_id`'s data. Returns `false` (and keeps the existing data)
    /// if the step already has an entry.
    pub fn insert(&mut self, step_id: impl Into<String>, data: Value) -> bool {
        let step_id = step_id.into();
        if self.data.contains_key(&step_id) {
            tracing::warn!(step_id = step_id.as_str(), "step output already recorded, keeping first");
            return false;
        }
        self.data.insert(step_id, data);
        true
    }

    pub fn get(&self, step_id: &str) -> Option<&Value> {
        self.data.get(step_id)
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.data.contains_key(step_id)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outputs_are_write_once() {
        let mut outputs = StepOutputs::new();
        assert!(outputs.insert("fetch", json!([1])));
        assert!(!outputs.insert("fetch", json!([2])));
        assert_eq!(outputs.get("fetch"), Some(&json!([1])));
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn contexts_are_independent() {
        let a = RunContext::new(Uuid::now_v7(), "leads");
        let b = RunContext::new(Uuid::now_v7(), "leads");
        a.cancel.cancel();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
    }

    #[test]
    fn scope_exposes_run_state() {
        let mut ctx = RunContext::new(Uuid::now_v7(), "leads");
        ctx.parameters.insert("client".to_string(), json!("acme"));
        let outputs = StepOutputs::new();
        let scope = ctx.scope(&outputs);
        assert_eq!(scope.run_id, ctx.run_id);
        assert_eq!(scope.parameters["client"], json!("acme"));
    }
}
