//! Compiled workflows and the in-memory catalog that serves them.
//!
//! Compilation is where load-time checks that need parsed references happen:
//! every `${steps.x}` must name a step in `depends_on`, every
//! `${parameters.p}` a declared parameter, and `parallel.items` must be a
//! single reference.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use stagewright_types::workflow::{StepDefinition, WorkflowDefinition};

use super::dag::execution_order;
use super::definition::{WorkflowError, discover_workflows, validate_definition};
use super::reference::{ConfigExpr, Reference};

/// A validated definition with its execution order and parsed configs.
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub definition: WorkflowDefinition,
    /// Step ids in execution order.
    pub order: Vec<String>,
    configs: HashMap<String, ConfigExpr>,
    items: HashMap<String, ConfigExpr>,
}

impl CompiledWorkflow {
    /// Validate `definition` and compile every reference it contains.
    pub fn compile(definition: WorkflowDefinition) -> Result<Self, WorkflowError> {
        validate_definition(&definition)?;

        let order: Vec<String> = execution_order(&definition.steps)?
            .into_iter()
            .map(|s| s.id.clone())
            .collect();

        let mut configs = HashMap::new();
        let mut items = HashMap::new();
        for step in &definition.steps {
            let config = ConfigExpr::compile(&step.config).map_err(|e| {
                WorkflowError::ReferenceError(format!("step '{}': {e}", step.id))
            })?;
            for reference in config.references() {
                check_reference(&definition, step, reference)?;
            }
            configs.insert(step.id.clone(), config);

            if let Some(parallel) = &step.parallel {
                let expr = ConfigExpr::compile(&serde_json::Value::String(parallel.items.clone()))
                    .map_err(|e| WorkflowError::ReferenceError(format!("step '{}': {e}", step.id)))?;
                let ConfigExpr::Ref(reference) = &expr else {
                    return Err(WorkflowError::ReferenceError(format!(
                        "step '{}': parallel.items must be a single reference, got '{}'",
                        step.id, parallel.items
                    )));
                };
                check_reference(&definition, step, reference)?;
                items.insert(step.id.clone(), expr);
            }
        }

        Ok(Self {
            definition,
            order,
            configs,
            items,
        })
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Steps in execution order.
    pub fn ordered_steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.order.iter().filter_map(|id| self.definition.step(id))
    }

    pub fn config_expr(&self, step_id: &str) -> Option<&ConfigExpr> {
        self.configs.get(step_id)
    }

    pub fn items_expr(&self, step_id: &str) -> Option<&ConfigExpr> {
        self.items.get(step_id)
    }
}

fn check_reference(
    def: &WorkflowDefinition,
    step: &StepDefinition,
    reference: &Reference,
) -> Result<(), WorkflowError> {
    match reference {
        Reference::Step { step_id, .. } => {
            if step_id == &step.id {
                return Err(WorkflowError::ReferenceError(format!(
                    "step '{}' references its own output in {reference}",
                    step.id
                )));
            }
            if def.step(step_id).is_none() {
                return Err(WorkflowError::ReferenceError(format!(
                    "step '{}' references unknown step in {reference}",
                    step.id
                )));
            }
            if !step.depends_on.iter().any(|d| d == step_id) {
                return Err(WorkflowError::ReferenceError(format!(
                    "step '{}' references {reference} but does not depend on '{}'",
                    step.id, step_id
                )));
            }
        }
        Reference::Parameter { name, .. } => {
            if def.parameter(name).is_none() {
                return Err(WorkflowError::ReferenceError(format!(
                    "step '{}' references undeclared parameter in {reference}",
                    step.id
                )));
            }
        }
        Reference::Run { .. } => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Registry of compiled workflows keyed by definition id.
#[derive(Default)]
pub struct WorkflowCatalog {
    workflows: DashMap<String, Arc<CompiledWorkflow>>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and register `definition`, replacing any with the same id.
    pub fn register(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<CompiledWorkflow>, WorkflowError> {
        let compiled = Arc::new(CompiledWorkflow::compile(definition)?);
        tracing::info!(
            workflow = compiled.id(),
            version = compiled.definition.version.as_str(),
            steps = compiled.order.len(),
            "registered workflow"
        );
        self.workflows
            .insert(compiled.id().to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }

    pub fn get(&self, definition_id: &str) -> Option<Arc<CompiledWorkflow>> {
        self.workflows
            .get(definition_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Registered definition ids, sorted.
    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Register every valid workflow file under `dir`. Returns how many were
    /// registered. Files that fail to parse or compile are logged and skipped.
    pub fn load_dir(&self, dir: &Path) -> Result<usize, WorkflowError> {
        let mut loaded = 0;
        for (path, definition) in discover_workflows(dir)? {
            match self.register(definition) {
                Ok(_) => loaded += 1,
                Err(err) => tracing::warn!(?path, error = %err, "skipping workflow that failed to compile"),
            }
        }
        Ok(loaded)
    }
}
