use std::collections::HashSet;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;

use crate::graph::builder::DependencyGraph;

/// Returns `true` if the graph contains a cycle.
pub fn has_cycle(dg: &DependencyGraph) -> bool {
    toposort(&dg.graph, None).is_err()
}

/// Find a cycle in the graph, returning the node labels along it with the
/// first label repeated at the end. Returns `None` if the graph is acyclic.
pub fn find_cycle(dg: &DependencyGraph) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut in_stack = HashSet::new();
    let mut stack_path = Vec::new();

    for &start in &dg.node_indices {
        if !visited.contains(&start)
            && let Some(cycle) =
                dfs_find_cycle(dg, start, &mut visited, &mut in_stack, &mut stack_path)
        {
            return Some(cycle);
        }
    }

    None
}

fn dfs_find_cycle(
    dg: &DependencyGraph,
    node: NodeIndex,
    visited: &mut HashSet<NodeIndex>,
    in_stack: &mut HashSet<NodeIndex>,
    stack_path: &mut Vec<NodeIndex>,
) -> Option<Vec<String>> {
    visited.insert(node);
    in_stack.insert(node);
    stack_path.push(node);

    for neighbor in dg.graph.neighbors_directed(node, Direction::Outgoing) {
        if !visited.contains(&neighbor) {
            if let Some(cycle) = dfs_find_cycle(dg, neighbor, visited, in_stack, stack_path) {
                return Some(cycle);
            }
        } else if in_stack.contains(&neighbor) {
            let cycle_start = stack_path
                .iter()
                .position(|&n| n == neighbor)
                .unwrap_or_default();
            let mut cycle: Vec<String> = stack_path[cycle_start..]
                .iter()
                .map(|&idx| dg.graph[idx].clone())
                .collect();
            cycle.push(dg.graph[neighbor].clone());
            return Some(cycle);
        }
    }

    stack_path.pop();
    in_stack.remove(&node);
    None
}

/// Node positions ordered so that every dependency comes before its
/// dependents.
///
/// # Errors
///
/// Returns the label of a node on a cycle.
pub fn dependency_order(dg: &DependencyGraph) -> Result<Vec<usize>, String> {
    let sorted = toposort(&dg.graph, None).map_err(|e| dg.graph[e.node_id()].clone())?;
    // petgraph sorts along edge direction, i.e. dependents first.
    Ok(sorted.into_iter().rev().map(NodeIndex::index).collect())
}
