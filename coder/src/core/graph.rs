//! File dependency graph.
//!
//! Nodes are workspace-relative paths; an edge `a -> b` means `a` references
//! `b`. Edges are only added between nodes that already exist, so the graph
//! converges on the real import graph as files are (re)processed rather than
//! holding dangling references.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned by [`DependencyGraph::execution_order`] when no order exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency graph has cycles: {}", format_cycles(.cycles))]
pub struct CyclicGraphError {
    pub cycles: Vec<Vec<String>>,
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|cycle| {
            let mut parts = cycle.clone();
            if let Some(first) = cycle.first() {
                parts.push(first.clone());
            }
            parts.join(" -> ")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "GraphSnapshot", into = "GraphSnapshot")]
pub struct DependencyGraph {
    graph: StableDiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

/// Serialized form: sorted nodes and edges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<String>,
    pub edges: Vec<(String, String)>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    /// Insert `path` if missing and add an edge to every dependency that is
    /// already tracked. Unknown dependencies are ignored, and so is `path`
    /// itself: a self-dependency never becomes an edge, so it cannot show up
    /// as a cycle. Existing edges are kept. Returns the dependencies that were
    /// ignored.
    pub fn add_file(&mut self, path: &str, dependencies: &[String]) -> Vec<String> {
        let source = self.upsert(path);
        let mut ignored = Vec::new();
        for dep in dependencies {
            if dep == path {
                ignored.push(dep.clone());
                continue;
            }
            match self.index.get(dep.as_str()) {
                Some(&target) => {
                    if self.graph.find_edge(source, target).is_none() {
                        self.graph.add_edge(source, target, ());
                    }
                }
                None => ignored.push(dep.clone()),
            }
        }
        ignored
    }

    /// Remove `path` and its incident edges. No-op when absent.
    pub fn remove_file(&mut self, path: &str) {
        if let Some(node) = self.index.remove(path) {
            self.graph.remove_node(node);
        }
    }

    /// Direct successors: files `path` references.
    pub fn dependencies_of(&self, path: &str) -> Vec<String> {
        self.neighbors(path, Direction::Outgoing)
    }

    /// Direct predecessors: files that reference `path`.
    pub fn dependents_of(&self, path: &str) -> Vec<String> {
        self.neighbors(path, Direction::Incoming)
    }

    /// Every file reachable from `path` along dependency edges.
    pub fn impact_of(&self, path: &str) -> Vec<String> {
        let Some(&start) = self.index.get(path) else {
            return Vec::new();
        };
        let mut reached = BTreeSet::new();
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                reached.insert(self.graph[node].clone());
            }
        }
        // A cycle through `start` reaches it again.
        if self.on_cycle(start) {
            reached.insert(path.to_string());
        }
        reached.into_iter().collect()
    }

    /// Enumerate simple cycles.
    ///
    /// Each cycle starts at its lexicographically smallest node and cycles are
    /// returned sorted, so the output is deterministic.
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        let adjacency: BTreeMap<&str, Vec<&str>> = self
            .index
            .iter()
            .map(|(name, &node)| {
                let mut next: Vec<&str> = self
                    .graph
                    .neighbors_directed(node, Direction::Outgoing)
                    .map(|n| self.graph[n].as_str())
                    .collect();
                next.sort_unstable();
                (name.as_str(), next)
            })
            .collect();

        let mut cycles = Vec::new();
        for &start in adjacency.keys() {
            let mut path = vec![start];
            let mut on_path = BTreeSet::from([start]);
            collect_cycles(start, start, &adjacency, &mut path, &mut on_path, &mut cycles);
        }
        cycles.sort();
        cycles
    }

    /// Topological order with dependencies before the files that use them.
    pub fn execution_order(&self) -> Result<Vec<String>, CyclicGraphError> {
        match toposort(&self.graph, None) {
            Ok(order) => Ok(order
                .into_iter()
                .rev()
                .map(|node| self.graph[node].clone())
                .collect()),
            Err(_) => Err(CyclicGraphError {
                cycles: self.find_cycles(),
            }),
        }
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let mut nodes: Vec<String> = self.index.keys().cloned().collect();
        nodes.sort();
        let mut edges: Vec<(String, String)> = self
            .graph
            .edge_indices()
            .filter_map(|edge| self.graph.edge_endpoints(edge))
            .map(|(a, b)| (self.graph[a].clone(), self.graph[b].clone()))
            .collect();
        edges.sort();
        GraphSnapshot { nodes, edges }
    }

    fn upsert(&mut self, path: &str) -> NodeIndex {
        if let Some(&node) = self.index.get(path) {
            return node;
        }
        let node = self.graph.add_node(path.to_string());
        self.index.insert(path.to_string(), node);
        node
    }

    fn neighbors(&self, path: &str, direction: Direction) -> Vec<String> {
        let Some(&node) = self.index.get(path) else {
            return Vec::new();
        };
        let mut out: Vec<String> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    fn on_cycle(&self, node: NodeIndex) -> bool {
        self.graph
            .neighbors_directed(node, Direction::Outgoing)
            .any(|next| {
                let mut dfs = Dfs::new(&self.graph, next);
                while let Some(reached) = dfs.next(&self.graph) {
                    if reached == node {
                        return true;
                    }
                }
                false
            })
    }
}

/// Depth-first search for cycles whose smallest node is `start`.
fn collect_cycles<'a>(
    start: &'a str,
    current: &'a str,
    adjacency: &BTreeMap<&'a str, Vec<&'a str>>,
    path: &mut Vec<&'a str>,
    on_path: &mut BTreeSet<&'a str>,
    cycles: &mut Vec<Vec<String>>,
) {
    let Some(next) = adjacency.get(current) else {
        return;
    };
    for &candidate in next {
        if candidate == start {
            cycles.push(path.iter().map(|s| s.to_string()).collect());
        } else if candidate > start && !on_path.contains(candidate) {
            path.push(candidate);
            on_path.insert(candidate);
            collect_cycles(start, candidate, adjacency, path, on_path, cycles);
            on_path.remove(candidate);
            path.pop();
        }
    }
}

impl From<GraphSnapshot> for DependencyGraph {
    fn from(snapshot: GraphSnapshot) -> Self {
        let mut graph = DependencyGraph::new();
        for node in &snapshot.nodes {
            graph.upsert(node);
        }
        for (from, to) in snapshot.edges {
            graph.upsert(&from);
            graph.upsert(&to);
            graph.add_file(&from, &[to]);
        }
        graph
    }
}

impl From<DependencyGraph> for GraphSnapshot {
    fn from(graph: DependencyGraph) -> Self {
        graph.snapshot()
    }
}
