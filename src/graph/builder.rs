use petgraph::graph::{DiGraph, NodeIndex};

/// A named dependency graph backed by petgraph.
///
/// An edge `a -> b` means `a` depends on `b`.
pub struct DependencyGraph {
    pub graph: DiGraph<String, ()>,
    pub node_indices: Vec<NodeIndex>,
}

/// Build a graph from node labels and `(dependent, dependency)` index pairs.
pub fn build<N, E>(labels: N, edges: E) -> DependencyGraph
where
    N: IntoIterator<Item = String>,
    E: IntoIterator<Item = (usize, usize)>,
{
    let mut graph = DiGraph::new();
    let node_indices: Vec<NodeIndex> = labels.into_iter().map(|l| graph.add_node(l)).collect();

    for (from, to) in edges {
        graph.add_edge(node_indices[from], node_indices[to], ());
    }

    DependencyGraph {
        graph,
        node_indices,
    }
}
