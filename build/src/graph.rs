//! The invocation graph: one node per invocation, one edge per path an invocation produces and
//! another consumes.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    ops::Index,
};

use petgraph::{graph::NodeIndex, visit::EdgeRef, Direction};
use thiserror::Error;
use tracing::debug;

use pbx_invocation::Invocation;
use pbx_metrics::scoped_metric;
use pbx_paths::{InsertResult, PathCache, PathRef};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GraphError {
    #[error("multiple invocations produce '{path}'")]
    DuplicateOutput { path: String },
    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// The consumer reads the path. Rebuilding the producer rebuilds the consumer.
    Content,
    /// The consumer only has to run after the producer.
    Order,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub path: String,
    pub kind: EdgeKind,
}

pub type InvocationId = NodeIndex;

#[derive(Debug)]
pub struct InvocationGraph {
    graph: petgraph::Graph<Invocation, Edge>,
    outputs: PathCache,
    // Indexed by the PathRef of the output.
    producers: Vec<InvocationId>,
    order: Vec<InvocationId>,
}

impl InvocationGraph {
    pub fn new(invocations: Vec<Invocation>) -> Result<InvocationGraph, GraphError> {
        scoped_metric!("graph");
        let mut graph = petgraph::Graph::with_capacity(invocations.len(), invocations.len());
        for invocation in invocations {
            graph.add_node(invocation);
        }

        let mut outputs = PathCache::new();
        let mut producers: Vec<InvocationId> = Vec::new();
        for id in graph.node_indices() {
            for output in graph[id].outputs() {
                match outputs.insert(output.as_str()) {
                    InsertResult::Inserted(_) => producers.push(id),
                    // Listing an output twice in one invocation is harmless.
                    InsertResult::AlreadyExists(r) if producers[r] == id => {}
                    InsertResult::AlreadyExists(_) => {
                        return Err(GraphError::DuplicateOutput {
                            path: output.clone(),
                        })
                    }
                }
            }
        }

        // One edge per (producer, consumer) pair. Content wins over order.
        let mut edges: Vec<(InvocationId, InvocationId, Edge)> = Vec::new();
        let mut seen: HashMap<(InvocationId, InvocationId), usize> = HashMap::new();
        for consumer in graph.node_indices() {
            let invocation = &graph[consumer];
            let content = invocation.content_inputs().map(|p| (p, EdgeKind::Content));
            let order = invocation
                .order_dependencies()
                .iter()
                .chain(invocation.phony_inputs())
                .map(|p| (p.as_str(), EdgeKind::Order));
            for (path, kind) in content.chain(order) {
                let producer = match outputs.lookup(path) {
                    Some(r) => producers[r],
                    None => continue,
                };
                let edge = Edge {
                    path: path.to_owned(),
                    kind,
                };
                match seen.get(&(producer, consumer)) {
                    Some(&i) => {
                        if edges[i].2.kind == EdgeKind::Order && kind == EdgeKind::Content {
                            edges[i].2 = edge;
                        }
                    }
                    None => {
                        seen.insert((producer, consumer), edges.len());
                        edges.push((producer, consumer, edge));
                    }
                }
            }
        }
        for (producer, consumer, edge) in edges {
            graph.add_edge(producer, consumer, edge);
        }

        let order = topological_order(&graph)?;
        debug!(
            invocations = graph.node_count(),
            edges = graph.edge_count(),
            "built invocation graph"
        );
        Ok(InvocationGraph {
            graph,
            outputs,
            producers,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Every invocation, producers before consumers. Among invocations that are ready at the same
    /// time, the one given first comes first.
    pub fn order(&self) -> &[InvocationId] {
        &self.order
    }

    pub fn ids(&self) -> impl Iterator<Item = InvocationId> {
        self.graph.node_indices()
    }

    /// The invocation producing `path`, if any.
    pub fn producer(&self, path: &str) -> Option<InvocationId> {
        self.outputs
            .lookup(path)
            .map(|r: PathRef| self.producers[r])
    }

    /// Producers this invocation waits for, with the edge joining them.
    pub fn dependencies(&self, id: InvocationId) -> impl Iterator<Item = (InvocationId, &Edge)> {
        self.graph
            .edges_directed(id, Direction::Incoming)
            .map(|e| (e.source(), e.weight()))
    }

    /// Consumers waiting for this invocation, with the edge joining them.
    pub fn dependents(&self, id: InvocationId) -> impl Iterator<Item = (InvocationId, &Edge)> {
        self.graph
            .edges_directed(id, Direction::Outgoing)
            .map(|e| (e.target(), e.weight()))
    }
}

impl Index<InvocationId> for InvocationGraph {
    type Output = Invocation;

    fn index(&self, id: InvocationId) -> &Invocation {
        &self.graph[id]
    }
}

// Kahn's algorithm with a min-heap so ties resolve to the lowest index.
fn topological_order(
    graph: &petgraph::Graph<Invocation, Edge>,
) -> Result<Vec<InvocationId>, GraphError> {
    let mut waiting: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.edges_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<usize>> = waiting
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(i)) = ready.pop() {
        let node = NodeIndex::new(i);
        order.push(node);
        for edge in graph.edges_directed(node, Direction::Outgoing) {
            let target = edge.target().index();
            waiting[target] -= 1;
            if waiting[target] == 0 {
                ready.push(Reverse(target));
            }
        }
    }
    if order.len() == graph.node_count() {
        Ok(order)
    } else {
        Err(GraphError::CyclicDependency {
            cycle: find_cycle(graph, &waiting),
        })
    }
}

// Every node left with a non-zero count has a predecessor that is also left, so walking
// predecessors depth first from any of them must revisit a node.
fn find_cycle(graph: &petgraph::Graph<Invocation, Edge>, waiting: &[usize]) -> Vec<String> {
    let remaining = |n: NodeIndex| waiting[n.index()] > 0;
    let mut current = match graph.node_indices().find(|n| remaining(*n)) {
        Some(n) => n,
        None => return vec![],
    };
    let mut visited: HashMap<NodeIndex, usize> = HashMap::new();
    // walk[i] is the path that leads into the i-th visited node.
    let mut walk: Vec<String> = Vec::new();
    loop {
        if let Some(&start) = visited.get(&current) {
            let mut cycle: Vec<String> = walk[start..].iter().rev().cloned().collect();
            if let Some(first) = cycle.first().cloned() {
                cycle.push(first);
            }
            return cycle;
        }
        visited.insert(current, walk.len());
        let edge = match graph
            .edges_directed(current, Direction::Incoming)
            .find(|e| remaining(e.source()))
        {
            Some(edge) => edge,
            None => return walk,
        };
        walk.push(edge.weight().path.clone());
        current = edge.source();
    }
}
