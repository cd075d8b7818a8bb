use crate::error::Rejection;
use crate::types::{Dag, Edge, Node, NodeId};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// Validated graph view over a workflow DAG
pub struct WorkflowGraph<'a> {
    graph: DiGraph<&'a Node, ()>,
}

impl<'a> WorkflowGraph<'a> {
    /// Build the graph, rejecting duplicate nodes, dangling edges and cycles
    pub fn build(dag: &'a Dag) -> Result<Self, Rejection> {
        let mut graph = DiGraph::new();
        let mut node_indices: HashMap<&NodeId, NodeIndex> = HashMap::new();

        for node in &dag.nodes {
            let index = graph.add_node(node);
            if node_indices.insert(&node.id, index).is_some() {
                return Err(Rejection::DuplicateNode(node.id.clone()));
            }
        }

        for edge in &dag.edges {
            let from = node_indices
                .get(&edge.from)
                .ok_or_else(|| Rejection::UnknownEdgeEndpoint(edge.from.clone()))?;
            let to = node_indices
                .get(&edge.to)
                .ok_or_else(|| Rejection::UnknownEdgeEndpoint(edge.to.clone()))?;
            graph.add_edge(*from, *to, ());
        }

        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            let node = graph[cycle.node_id()];
            return Err(Rejection::WouldIntroduceCycle(node.id.clone()));
        }

        Ok(Self { graph })
    }

    /// Node ids with producers before consumers
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut topo = petgraph::visit::Topo::new(&self.graph);
        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(index) = topo.next(&self.graph) {
            order.push(self.graph[index].id.clone());
        }
        order
    }
}

impl Dag {
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| &n.id == id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Producers of `id`, following edge order
    pub fn predecessors<'s>(&'s self, id: &'s NodeId) -> impl Iterator<Item = &'s NodeId> + 's {
        self.edges.iter().filter(move |e| &e.to == id).map(|e| &e.from)
    }

    /// Append nodes and edges without validating them
    pub fn extend(&mut self, nodes: impl IntoIterator<Item = Node>, edges: impl IntoIterator<Item = Edge>) {
        self.nodes.extend(nodes);
        self.edges.extend(edges);
    }

    pub fn validate(&self) -> Result<(), Rejection> {
        WorkflowGraph::build(self).map(|_| ())
    }
}
