//! Step graph construction, cycle detection and descendant walks.
//!
//! Uses `petgraph` to model step dependencies as a directed graph, edges
//! running from parent to child. Declarations are checked with a topological
//! sort; persisted step runs are walked forward for replay preflight.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use taskloom_types::run::StepRun;
use taskloom_types::workflow::StepDeclaration;
use uuid::Uuid;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Declared steps
// ---------------------------------------------------------------------------

/// Order a job's steps so every step follows all of its parents.
///
/// Fails with `UnknownDependency` when a parent is not declared in the same
/// job and with `CycleDetected` when the parents form a cycle.
pub fn topological_steps(steps: &[StepDeclaration]) -> Result<Vec<&StepDeclaration>, EngineError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.readable_id.as_str(), i))
        .collect();

    let mut graph = DiGraph::<usize, ()>::new();
    let node_indices: Vec<_> = (0..steps.len()).map(|i| graph.add_node(i)).collect();

    for (to_idx, step) in steps.iter().enumerate() {
        for parent in &step.parents {
            let from_idx = id_to_idx.get(parent.as_str()).ok_or_else(|| {
                EngineError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.readable_id, parent
                ))
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let step = &steps[graph[cycle.node_id()]];
        EngineError::CycleDetected(format!("cycle involving step '{}'", step.readable_id))
    })?;

    Ok(sorted.into_iter().map(|idx| &steps[graph[idx]]).collect())
}

// ---------------------------------------------------------------------------
// Persisted step runs
// ---------------------------------------------------------------------------

/// Every step run reachable from `target` through child edges, in
/// breadth-first order. `target` itself is not included.
///
/// Parent references outside `steps` are ignored.
pub fn descendants(target: Uuid, steps: &[StepRun]) -> Vec<Uuid> {
    let mut graph = DiGraph::<Uuid, ()>::new();
    let nodes: HashMap<Uuid, NodeIndex> = steps
        .iter()
        .map(|s| (s.id, graph.add_node(s.id)))
        .collect();

    for step in steps {
        for parent in &step.parent_ids {
            if let Some(from) = nodes.get(parent) {
                graph.add_edge(*from, nodes[&step.id], ());
            }
        }
    }

    let Some(start) = nodes.get(&target) else {
        return Vec::new();
    };

    let mut found = Vec::new();
    let mut bfs = Bfs::new(&graph, *start);
    while let Some(node) = bfs.next(&graph) {
        if node != *start {
            found.push(graph[node]);
        }
    }
    found
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
