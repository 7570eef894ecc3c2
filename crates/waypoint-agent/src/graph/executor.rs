use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::{
    NodeCompleted, NodeFailed, NodeStarting, SubgraphCompleted, SubgraphFailed, SubgraphStarting,
};
use waypoint_core::payload::Payload;
use waypoint_core::types::{LlmModel, ToolDescriptor};

use super::edge::Edge;
use super::node::{NodeKind, Subgraph};
use super::strategy::StrategyGraph;
use crate::context::AgentContext;

/// Walk `graph` from its start node.
pub async fn run(ctx: &AgentContext, graph: &StrategyGraph, input: Payload) -> Result<Payload> {
    walk(ctx, graph, StrategyGraph::START.to_string(), input).await
}

/// Walk `graph` starting at `node` instead of the start node.
pub async fn run_from(
    ctx: &AgentContext,
    graph: &StrategyGraph,
    node: &str,
    input: Payload,
) -> Result<Payload> {
    if !graph.contains(node) {
        return Err(WaypointError::NodeNotFound(node.to_string()));
    }
    walk(ctx, graph, node.to_string(), input).await
}

/// The dispatch loop. Boxed because subgraph nodes recurse into it.
fn walk<'a>(
    ctx: &'a AgentContext,
    graph: &'a StrategyGraph,
    start: String,
    input: Payload,
) -> BoxFuture<'a, Result<Payload>> {
    Box::pin(async move {
        let mut current = start;
        let mut value = input;

        loop {
            if ctx.is_cancelled() {
                return Err(WaypointError::Cancelled);
            }
            ctx.tick()?;

            let node = graph
                .node(&current)
                .ok_or_else(|| WaypointError::NodeNotFound(current.clone()))?;

            ctx.emit(NodeStarting {
                node: node.name.clone(),
                input: value.clone(),
            });
            debug!(strategy = %graph.name(), node = %node.name, input = value.kind_name(), "Executing node");

            let output = match invoke(ctx, &node.name, &node.kind, value.clone()).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(strategy = %graph.name(), node = %node.name, error = %e, "Node failed");
                    ctx.emit(NodeFailed {
                        node: node.name.clone(),
                        input: value,
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            };

            if graph.is_finish(&node.name) {
                ctx.emit(NodeCompleted {
                    node: node.name.clone(),
                    input: value,
                    output: output.clone(),
                });
                return Ok(output);
            }

            // Guards are part of the source node: a failing guard fails the node
            let next = match select_edge(graph, &node.name, &output) {
                Ok(next) => next,
                Err(e) => {
                    warn!(strategy = %graph.name(), node = %node.name, error = %e, "Edge predicate failed");
                    ctx.emit(NodeFailed {
                        node: node.name.clone(),
                        input: value,
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            };

            ctx.emit(NodeCompleted {
                node: node.name.clone(),
                input: value,
                output: output.clone(),
            });

            match next {
                Some(edge) => {
                    debug!(from = %edge.from, to = %edge.to, "Following edge");
                    value = edge.apply(output);
                    current = edge.to.clone();
                }
                None => {
                    warn!(strategy = %graph.name(), node = %node.name, "No matching edge");
                    return Err(WaypointError::NoMatchingEdge {
                        node: node.name.clone(),
                        output: format!("{:?}", output),
                    });
                }
            }
        }
    })
}

/// First outgoing edge, in declaration order, that accepts `output`.
fn select_edge<'g>(graph: &'g StrategyGraph, from: &str, output: &Payload) -> Result<Option<&'g Edge>> {
    for edge in graph.edges().iter().filter(|e| e.from == from) {
        if edge.matches(output)? {
            return Ok(Some(edge));
        }
    }
    Ok(None)
}

async fn invoke(ctx: &AgentContext, name: &str, kind: &NodeKind, input: Payload) -> Result<Payload> {
    match kind {
        NodeKind::Start | NodeKind::Finish => Ok(input),
        NodeKind::Task(f) => f(ctx.clone(), input).await,
        NodeKind::Subgraph(Subgraph {
            strategy,
            tools,
            model,
        }) => run_nested(ctx, name, strategy, tools.as_deref(), model.as_ref(), input).await,
    }
}

/// Run `graph` under a child execution frame, with optional scoped tools and
/// model that are restored on exit.
pub(crate) async fn run_nested(
    ctx: &AgentContext,
    name: &str,
    graph: &StrategyGraph,
    tools: Option<&[String]>,
    model: Option<&LlmModel>,
    input: Payload,
) -> Result<Payload> {
    let child = ctx.with_scope(name);
    child.emit(SubgraphStarting {
        subgraph: name.to_string(),
        input: input.clone(),
    });
    info!(subgraph = %name, path = %child.execution().path, "Entering subgraph");

    let result = async {
        let previous = enter_scope(&child, tools, model).await?;
        let result = walk(&child, graph, StrategyGraph::START.to_string(), input.clone()).await;
        if let Some((tools, model)) = previous {
            let restored = child
                .llm()
                .write_session(|session| async move {
                    session.set_tools(tools);
                    session.set_model(model);
                    Ok(())
                })
                .await;
            // A failed walk keeps its own error
            if let (Ok(_), Err(e)) = (&result, restored) {
                return Err(e);
            }
        }
        result
    }
    .await;

    match &result {
        Ok(output) => child.emit(SubgraphCompleted {
            subgraph: name.to_string(),
            input,
            output: output.clone(),
        }),
        Err(e) => child.emit(SubgraphFailed {
            subgraph: name.to_string(),
            input,
            error: e.to_string(),
        }),
    }
    result
}

/// Apply scoped tools/model; returns what to restore.
async fn enter_scope(
    ctx: &AgentContext,
    tools: Option<&[String]>,
    model: Option<&LlmModel>,
) -> Result<Option<(Vec<ToolDescriptor>, LlmModel)>> {
    if tools.is_none() && model.is_none() {
        return Ok(None);
    }

    let scoped_tools = match tools {
        Some(names) => Some(ctx.tools().registry().descriptors_for(names)?),
        None => None,
    };
    let scoped_model = model.cloned();

    ctx.llm()
        .write_session(|session| async move {
            let previous = (session.tools(), session.model());
            if let Some(tools) = scoped_tools {
                session.set_tools(tools);
            }
            if let Some(model) = scoped_model {
                session.set_model(model);
            }
            Ok(Some(previous))
        })
        .await
}
