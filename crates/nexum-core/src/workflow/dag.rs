//! Dependency graph validation.
//!
//! Uses `petgraph` to model node dependencies as a directed graph. Every
//! dependency must name a declared node, and a topological sort rejects
//! cycles (including self-dependencies).

use std::collections::HashMap;

use nexum_types::ir::WorkflowIr;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::definition::BuildError;

/// Validate that the IR forms a DAG whose edges all point at declared nodes.
///
/// Returns the node ids in a topological order (dependencies first).
pub fn validate_dag(ir: &WorkflowIr) -> Result<Vec<String>, BuildError> {
    let id_to_idx: HashMap<&str, usize> = ir
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (id, i))
        .collect();

    // Edge from dependency -> dependent
    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = ir.iter().map(|(id, _)| graph.add_node(id)).collect();

    for (to_idx, (id, node)) in ir.iter().enumerate() {
        for dep in node.dependencies() {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                BuildError::UnknownDependency {
                    node_id: id.to_string(),
                    dependency: dep.clone(),
                }
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    let sorted = toposort(&graph, None)
        .map_err(|cycle| BuildError::CycleDetected(graph[cycle.node_id()].to_string()))?;

    Ok(sorted.into_iter().map(|idx| graph[idx].to_string()).collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
