//! Workflow engine core: definitions, scheduling, execution, and run control.
//!
//! - `definition` -- YAML/JSON parsing, validation, parameter resolution
//! - `dag` -- cycle detection, deterministic execution order, dependents
//! - `catalog` -- compiled definitions keyed by id
//! - `reference` -- `${...}` reference parsing and resolution
//! - `context` -- per-run state and write-once step outputs
//! - `retry` -- bounded, timed connector invocation with backoff
//! - `executor` -- one step to one `StepResult`
//! - `batch` -- parallel fan-out and consolidation with batch checkpoints
//! - `gate` -- quality gate evaluation
//! - `phase` -- run phase state machine
//! - `controller` -- start, resume, cancel and review runs

pub mod batch;
pub mod catalog;
pub mod context;
pub mod controller;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod gate;
pub mod phase;
pub mod reference;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{CompiledWorkflow, WorkflowCatalog};
pub use controller::{RunController, RunOptions};
pub use definition::WorkflowError;
pub use executor::{ExecutionSettings, ExecutorError, StepExecutor};
