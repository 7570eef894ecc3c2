use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use waypoint_core::error::Result;
use waypoint_core::payload::Payload;
use waypoint_core::types::LlmModel;

use super::strategy::StrategyGraph;
use crate::context::AgentContext;

pub type NodeFuture = BoxFuture<'static, Result<Payload>>;

/// A node body: an async function of the run context and the node input.
pub type NodeFn = Arc<dyn Fn(AgentContext, Payload) -> NodeFuture + Send + Sync>;

/// Wrap an async closure as a [`NodeFn`].
pub fn node_fn<F, Fut>(f: F) -> NodeFn
where
    F: Fn(AgentContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    Arc::new(move |ctx, input| Box::pin(f(ctx, input)))
}

/// A nested strategy run as one node of its parent.
///
/// `tools` narrows the active tool list to the named registry entries and
/// `model` switches the model, both for the duration of the subgraph.
#[derive(Clone)]
pub struct Subgraph {
    pub strategy: Arc<StrategyGraph>,
    pub tools: Option<Vec<String>>,
    pub model: Option<LlmModel>,
}

#[derive(Clone)]
pub enum NodeKind {
    /// Entry point; passes its input through.
    Start,
    /// Exit point; passes its input through.
    Finish,
    Task(NodeFn),
    Subgraph(Subgraph),
}

/// A named unit of computation in a strategy graph.
#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
}

impl Node {
    /// Create a node from an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(AgentContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        Self::from_fn(name, node_fn(f))
    }

    pub fn from_fn(name: impl Into<String>, f: NodeFn) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Task(f),
        }
    }

    /// Create a node that runs `strategy` with the parent's tools and model.
    pub fn subgraph(name: impl Into<String>, strategy: StrategyGraph) -> Self {
        Self::subgraph_with(name, strategy, None, None)
    }

    /// Create a subgraph node with a scoped tool subset and/or model.
    pub fn subgraph_with(
        name: impl Into<String>,
        strategy: StrategyGraph,
        tools: Option<Vec<String>>,
        model: Option<LlmModel>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Subgraph(Subgraph {
                strategy: Arc::new(strategy),
                tools,
                model,
            }),
        }
    }

    pub(crate) fn start() -> Self {
        Self {
            name: StrategyGraph::START.to_string(),
            kind: NodeKind::Start,
        }
    }

    pub(crate) fn finish() -> Self {
        Self {
            name: StrategyGraph::FINISH.to_string(),
            kind: NodeKind::Finish,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            NodeKind::Start => "start".to_string(),
            NodeKind::Finish => "finish".to_string(),
            NodeKind::Task(_) => "task".to_string(),
            NodeKind::Subgraph(sub) => format!("subgraph({})", sub.strategy.name()),
        };
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}
