use std::collections::{HashMap, HashSet};

use waypoint_core::error::{Result, WaypointError};

use super::edge::Edge;
use super::node::Node;

/// A directed graph of nodes with one start node and at least one finish
/// node. Plain data: execution lives in [`super::executor`].
#[derive(Debug, Clone)]
pub struct StrategyGraph {
    name: String,
    nodes: HashMap<String, Node>,
    edges: Vec<Edge>,
    finish: HashSet<String>,
}

impl StrategyGraph {
    pub const START: &'static str = "__start__";
    pub const FINISH: &'static str = "__finish__";

    pub fn builder(name: impl Into<String>) -> StrategyBuilder {
        StrategyBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Outgoing edges of `name` in declaration order.
    pub fn edges_from<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == name)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn is_finish(&self, name: &str) -> bool {
        self.finish.contains(name)
    }

    pub fn node_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.nodes.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/// Incremental builder for a [`StrategyGraph`].
///
/// The reserved `__start__` and `__finish__` nodes are always present.
pub struct StrategyBuilder {
    name: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    finish: Vec<String>,
}

impl StrategyBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: vec![Node::start(), Node::finish()],
            edges: Vec::new(),
            finish: vec![StrategyGraph::FINISH.to_string()],
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn edges(mut self, edges: impl IntoIterator<Item = Edge>) -> Self {
        self.edges.extend(edges);
        self
    }

    /// Mark `node` as an additional exit point; its output ends the walk.
    pub fn finish_at(mut self, node: impl Into<String>) -> Self {
        self.finish.push(node.into());
        self
    }

    pub fn build(self) -> Result<StrategyGraph> {
        let invalid = |reason: String| WaypointError::InvalidGraph {
            graph: self.name.clone(),
            reason,
        };

        let mut nodes = HashMap::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if nodes.insert(node.name.clone(), node.clone()).is_some() {
                return Err(invalid(format!("duplicate node name '{}'", node.name)));
            }
        }

        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !nodes.contains_key(end) {
                    return Err(invalid(format!(
                        "edge '{}' -> '{}' refers to unknown node '{}'",
                        edge.from, edge.to, end
                    )));
                }
            }
        }

        let finish: HashSet<String> = self.finish.iter().cloned().collect();
        for name in &finish {
            if !nodes.contains_key(name) {
                return Err(invalid(format!("finish node '{}' does not exist", name)));
            }
            if name == StrategyGraph::START {
                return Err(invalid("the start node cannot be a finish node".into()));
            }
        }

        if let Some(edge) = self.edges.iter().find(|e| finish.contains(&e.from)) {
            return Err(invalid(format!(
                "finish node '{}' has an outgoing edge to '{}'",
                edge.from, edge.to
            )));
        }

        if !self.edges.iter().any(|e| e.from == StrategyGraph::START) {
            return Err(invalid("start node has no outgoing edge".into()));
        }

        if !self.edges.iter().any(|e| finish.contains(&e.to)) {
            return Err(invalid("no edge leads to a finish node".into()));
        }

        Ok(StrategyGraph {
            name: self.name,
            nodes,
            edges: self.edges,
            finish,
        })
    }
}
