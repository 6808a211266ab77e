//! Dependency scheduling: cycle detection, deterministic ordering, and
//! transitive dependents.
//!
//! Uses `petgraph` to model step dependencies as a directed graph for cycle
//! detection. The execution order itself comes from Kahn's algorithm with a
//! min-heap over declaration indices, so ties among simultaneously-ready steps
//! always resolve in declaration order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use stagewright_types::checkpoint::CheckpointRecord;
use stagewright_types::workflow::StepDefinition;

use super::definition::WorkflowError;

fn index_by_id(steps: &[StepDefinition]) -> HashMap<&str, usize> {
    steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect()
}

fn unknown_dependency(step: &StepDefinition, dep: &str) -> WorkflowError {
    WorkflowError::UnknownDependency(format!(
        "step '{}' depends on unknown step '{}'",
        step.id, dep
    ))
}

// ---------------------------------------------------------------------------
// DAG validation
// ---------------------------------------------------------------------------

/// Validate that steps form a valid DAG (no cycles, all references exist).
pub fn validate_dag(steps: &[StepDefinition]) -> Result<(), WorkflowError> {
    let id_to_idx = index_by_id(steps);

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    for step in steps {
        let to_idx = id_to_idx[step.id.as_str()];
        for dep in &step.depends_on {
            let from_idx = id_to_idx
                .get(dep.as_str())
                .ok_or_else(|| unknown_dependency(step, dep))?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving step '{}'", node_id))
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Execution order (Kahn's algorithm)
// ---------------------------------------------------------------------------

/// Compute the execution order of `steps`.
///
/// Every step appears after all of its dependencies. Among steps that become
/// ready at the same time, the one declared first runs first, so the order is
/// a pure function of the definition.
pub fn execution_order(steps: &[StepDefinition]) -> Result<Vec<&StepDefinition>, WorkflowError> {
    let id_to_idx = index_by_id(steps);

    let mut indegree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (idx, step) in steps.iter().enumerate() {
        // Duplicate edges would inflate the indegree without a matching decrement.
        let unique: HashSet<&str> = step.depends_on.iter().map(String::as_str).collect();
        for dep in unique {
            let from = *id_to_idx
                .get(dep)
                .ok_or_else(|| unknown_dependency(step, dep))?;
            indegree[idx] += 1;
            dependents[from].push(idx);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(Reverse(idx)) = ready.pop() {
        order.push(&steps[idx]);
        for &next in &dependents[idx] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() != steps.len() {
        let stuck = indegree
            .iter()
            .position(|d| *d > 0)
            .map(|i| steps[i].id.as_str())
            .unwrap_or_default();
        return Err(WorkflowError::CycleDetected(format!(
            "cycle detected involving step '{}'",
            stuck
        )));
    }

    Ok(order)
}

/// Filter an execution order down to the steps a resumed run still has to
/// execute: those not recorded complete in `record`.
pub fn pending_steps<'a>(
    order: &[&'a StepDefinition],
    record: &CheckpointRecord,
) -> Vec<&'a StepDefinition> {
    order
        .iter()
        .copied()
        .filter(|s| !record.is_stage_complete(&s.id))
        .collect()
}

// ---------------------------------------------------------------------------
// Transitive dependents
// ---------------------------------------------------------------------------

/// Returns every step that transitively depends on `step_id`, in declaration
/// order. Used to invalidate downstream results when a step is force-reset.
///
/// If `step_id` is not found, returns an empty vec.
pub fn get_dependents<'a>(step_id: &str, steps: &'a [StepDefinition]) -> Vec<&'a str> {
    let mut reached: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(step_id);

    while let Some(current) = queue.pop_front() {
        for step in steps {
            if step.depends_on.iter().any(|d| d == current) && reached.insert(step.id.as_str()) {
                queue.push_back(step.id.as_str());
            }
        }
    }

    steps
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| reached.contains(id))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
