//! Resource dependency graph construction and ordering.
//!
//! Nodes are resource declarations; an edge runs from a dependency to each
//! resource referencing it. Explicit `depends_on`, parent nesting, address
//! scopes, lock targets, and property placeholders all produce the same kind
//! of edge. The apply order is a topological sort with ties broken by
//! declaration order, so an unchanged template always plans identically.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BinaryHeap, HashMap};

use crate::error::{GraphError, Result, StrataError};
use crate::template::ResourceSpec;

/// The dependency graph over a template's resource declarations.
#[derive(Debug)]
pub struct ResourceGraph {
    /// Underlying directed graph; node weights are declaration indices.
    graph: DiGraph<usize, ()>,
    /// Node handle per declaration index.
    nodes: Vec<NodeIndex>,
    /// Resource address per declaration index.
    addresses: Vec<String>,
}

impl ResourceGraph {
    /// Builds the dependency graph for a set of resource declarations.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource references itself or an address not
    /// declared in the set.
    pub fn build(resources: &[ResourceSpec]) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(resources.len(), resources.len());
        let mut nodes = Vec::with_capacity(resources.len());
        let mut addresses = Vec::with_capacity(resources.len());
        let mut by_address: HashMap<String, usize> = HashMap::with_capacity(resources.len());

        for (i, resource) in resources.iter().enumerate() {
            let address = resource.address();
            nodes.push(graph.add_node(i));
            by_address.insert(address.clone(), i);
            addresses.push(address);
        }

        for (i, resource) in resources.iter().enumerate() {
            for reference in resource.references() {
                let Some(&dep) = by_address.get(&reference) else {
                    return Err(StrataError::Graph(GraphError::UnresolvedReference {
                        from: addresses[i].clone(),
                        to: reference,
                    }));
                };
                if dep == i {
                    return Err(StrataError::Graph(GraphError::SelfReference {
                        address: addresses[i].clone(),
                    }));
                }
                graph.update_edge(nodes[dep], nodes[i], ());
            }
        }

        Ok(Self {
            graph,
            nodes,
            addresses,
        })
    }

    /// Returns a topological order over declaration indices.
    ///
    /// Ready nodes are consumed smallest declaration index first, which makes
    /// the order deterministic across runs for the same template.
    ///
    /// # Errors
    ///
    /// Returns a cycle error naming the resources stuck in the cycle.
    pub fn topo_order(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = self
            .nodes
            .iter()
            .map(|&n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<std::cmp::Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(i, _)| std::cmp::Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(std::cmp::Reverse(i)) = ready.pop() {
            order.push(i);
            for neighbor in self
                .graph
                .neighbors_directed(self.nodes[i], Direction::Outgoing)
            {
                let j = self.graph[neighbor];
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.push(std::cmp::Reverse(j));
                }
            }
        }

        if order.len() < self.nodes.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, &deg)| deg > 0)
                .map(|(i, _)| self.addresses[i].as_str())
                .collect();
            return Err(StrataError::Graph(GraphError::CycleDetected {
                cycle: stuck.join(" -> "),
            }));
        }

        Ok(order)
    }

    /// Returns the declaration indices of a resource's direct dependencies.
    #[must_use]
    pub fn direct_dependencies(&self, index: usize) -> Vec<usize> {
        let mut deps: Vec<usize> = self
            .graph
            .neighbors_directed(self.nodes[index], Direction::Incoming)
            .map(|n| self.graph[n])
            .collect();
        deps.sort_unstable();
        deps
    }

    /// Returns every resource transitively depending on the given one, in
    /// breadth-first order.
    #[must_use]
    pub fn dependents_closure(&self, index: usize) -> Vec<usize> {
        let mut visited = vec![false; self.nodes.len()];
        let mut queue = std::collections::VecDeque::from([index]);
        let mut closure = Vec::new();

        while let Some(current) = queue.pop_front() {
            for neighbor in self
                .graph
                .neighbors_directed(self.nodes[current], Direction::Outgoing)
            {
                let j = self.graph[neighbor];
                if !visited[j] {
                    visited[j] = true;
                    closure.push(j);
                    queue.push_back(j);
                }
            }
        }

        closure.sort_unstable();
        closure
    }

    /// Returns the address for a declaration index.
    #[must_use]
    pub fn address(&self, index: usize) -> &str {
        &self.addresses[index]
    }

    /// Returns the number of resources in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the number of reference edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}
