use std::future::Future;
use std::sync::Arc;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::payload::Payload;

use crate::context::AgentContext;
use crate::graph::{executor, node_fn, NodeFn, StrategyGraph};

/// An agent's control flow: a strategy graph or a single async function.
#[derive(Clone)]
pub enum AgentStrategy {
    Graph(Arc<StrategyGraph>),
    Functional { name: String, body: NodeFn },
}

impl AgentStrategy {
    pub fn graph(graph: StrategyGraph) -> Self {
        Self::Graph(Arc::new(graph))
    }

    /// A strategy written as plain async code against the context.
    pub fn functional<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(AgentContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        Self::Functional {
            name: name.into(),
            body: node_fn(f),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Graph(graph) => graph.name(),
            Self::Functional { name, .. } => name,
        }
    }

    pub(crate) async fn execute(&self, ctx: &AgentContext, input: Payload) -> Result<Payload> {
        match self {
            Self::Graph(graph) => executor::run(ctx, graph, input).await,
            Self::Functional { body, .. } => body(ctx.clone(), input).await,
        }
    }

    /// Continue a graph walk at `node`.
    pub(crate) async fn resume(&self, ctx: &AgentContext, node: &str, input: Payload) -> Result<Payload> {
        match self {
            Self::Graph(graph) => executor::run_from(ctx, graph, node, input).await,
            Self::Functional { name, .. } => Err(WaypointError::Checkpoint(format!(
                "functional strategy '{}' cannot resume at a node",
                name
            ))),
        }
    }

    /// Whether a checkpoint taken at `node` can be resumed.
    pub(crate) fn can_resume_at(&self, node: &str) -> bool {
        match self {
            Self::Graph(graph) => graph.contains(node),
            Self::Functional { .. } => false,
        }
    }
}

impl From<StrategyGraph> for AgentStrategy {
    fn from(graph: StrategyGraph) -> Self {
        Self::graph(graph)
    }
}

impl std::fmt::Debug for AgentStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Graph(graph) => f.debug_tuple("Graph").field(&graph.name()).finish(),
            Self::Functional { name, .. } => f.debug_tuple("Functional").field(name).finish(),
        }
    }
}
