//! Ready-made nodes and strategies for the common LLM/tool loop.

use std::sync::Arc;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::payload::Payload;
use waypoint_core::types::Prompt;

use super::edge::Edge;
use super::node::Node;
use super::strategy::StrategyGraph;

fn unexpected(node: &str, expected: &str, got: &Payload) -> WaypointError {
    WaypointError::NodeFailure(format!(
        "node '{}' expected {}, got {}",
        node,
        expected,
        got.kind_name()
    ))
}

/// Send the input text as a user turn and output the reply message.
/// An empty input sends the history as is.
pub fn llm_request(name: &str, allow_tool_calls: bool) -> Node {
    Node::new(name, move |ctx, input| async move {
        let reply = ctx
            .request_llm(input.text_content(), allow_tool_calls)
            .await?;
        Ok(Payload::Message(reply))
    })
}

/// Like [`llm_request`], outputting every reply message.
pub fn llm_request_multiple(name: &str) -> Node {
    Node::new(name, |ctx, input| async move {
        Ok(Payload::Messages(
            ctx.request_llm_multiple(input.text_content()).await?,
        ))
    })
}

/// The model must answer with a tool call.
pub fn llm_request_only_calling_tools(name: &str) -> Node {
    Node::new(name, |ctx, input| async move {
        let reply = ctx
            .request_llm_only_calling_tools(input.text_content())
            .await?;
        Ok(Payload::Message(reply))
    })
}

/// The model must answer with a call to `tool`.
pub fn llm_request_force_one_tool(name: &str, tool: &str) -> Node {
    let tool = tool.to_string();
    Node::new(name, move |ctx, input| {
        let tool = tool.clone();
        async move {
            let reply = ctx
                .request_llm_force_one_tool(input.text_content(), tool)
                .await?;
            Ok(Payload::Message(reply))
        }
    })
}

/// Stream the reply; frames are reported through lifecycle events.
pub fn llm_request_streaming(name: &str) -> Node {
    Node::new(name, |ctx, input| async move {
        let reply = ctx
            .request_llm_streaming(input.text_content(), None)
            .await?;
        Ok(Payload::Message(reply))
    })
}

/// Execute the tool call in the input; outputs a tool result.
pub fn execute_tool(name: &str) -> Node {
    let node = name.to_string();
    Node::new(name, move |ctx, input| {
        let node = node.clone();
        async move {
            let call = input
                .tool_call()
                .ok_or_else(|| unexpected(&node, "a tool call", &input))?;
            Ok(Payload::ToolResult(ctx.execute_tool(call).await?))
        }
    })
}

/// Execute every tool call in the input; outputs results in call order.
pub fn execute_multiple_tools(name: &str, parallel: bool) -> Node {
    let node = name.to_string();
    Node::new(name, move |ctx, input| {
        let node = node.clone();
        async move {
            let calls = input.tool_calls();
            if calls.is_empty() {
                return Err(unexpected(&node, "tool calls", &input));
            }
            Ok(Payload::ToolResults(
                ctx.execute_multiple_tools(calls, parallel).await?,
            ))
        }
    })
}

/// Report a tool result to the model; outputs its reply.
pub fn send_tool_result(name: &str) -> Node {
    let node = name.to_string();
    Node::new(name, move |ctx, input| {
        let node = node.clone();
        async move {
            match input {
                Payload::ToolResult(result) => {
                    Ok(Payload::Message(ctx.send_tool_result(result).await?))
                }
                other => Err(unexpected(&node, "a tool result", &other)),
            }
        }
    })
}

/// Report a batch of tool results; outputs every reply message.
pub fn send_multiple_tool_results(name: &str) -> Node {
    let node = name.to_string();
    Node::new(name, move |ctx, input| {
        let node = node.clone();
        async move {
            let results = match input {
                Payload::ToolResults(results) => results,
                Payload::ToolResult(result) => vec![result],
                other => return Err(unexpected(&node, "tool results", &other)),
            };
            Ok(Payload::Messages(
                ctx.send_multiple_tool_results(results).await?,
            ))
        }
    })
}

/// Edit the prompt through a write session; passes the input through.
pub fn append_prompt<F>(name: &str, f: F) -> Node
where
    F: Fn(&mut Prompt) + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Node::new(name, move |ctx, input| {
        let f = f.clone();
        async move {
            ctx.update_prompt(|prompt| f(prompt)).await?;
            Ok(input)
        }
    })
}

/// A pure function of the input.
pub fn transform<F>(name: &str, f: F) -> Node
where
    F: Fn(Payload) -> Result<Payload> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Node::new(name, move |_ctx, input| {
        let f = f.clone();
        async move { f(input) }
    })
}

/// The canonical tool loop: ask the model, run requested tools, report the
/// results, repeat until the model answers in plain text.
///
/// ```text
/// __start__ -> callLLM
/// callLLM --tool calls--> executeTools -> sendToolResults
/// sendToolResults --tool calls--> executeTools
/// callLLM | sendToolResults --assistant text--> __finish__
/// ```
pub fn single_run_strategy(parallel_tools: bool) -> Result<StrategyGraph> {
    const CALL_LLM: &str = "callLLM";
    const EXECUTE: &str = "executeTools";
    const SEND: &str = "sendToolResults";

    StrategyGraph::builder("single_run")
        .node(llm_request(CALL_LLM, true))
        .node(execute_multiple_tools(EXECUTE, parallel_tools))
        .node(send_multiple_tool_results(SEND))
        .edge(Edge::new(StrategyGraph::START, CALL_LLM))
        .edge(Edge::on_tool_calls(CALL_LLM, EXECUTE))
        .edge(Edge::on_assistant_message(CALL_LLM, StrategyGraph::FINISH))
        .edge(Edge::new(EXECUTE, SEND))
        .edge(Edge::on_tool_calls(SEND, EXECUTE))
        .edge(Edge::on_assistant_message(SEND, StrategyGraph::FINISH))
        .build()
}

/// How a tool loop handles the calls in one model reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ToolCallMode {
    /// Run every requested call, one after another.
    #[default]
    Sequential,
    /// Run every requested call concurrently.
    Parallel,
    /// Run only the first requested call, report it, then ask again.
    SingleRunSequential,
}

/// The tool loop for `mode`. [`ToolCallMode::SingleRunSequential`] runs one
/// call per model turn:
///
/// ```text
/// __start__ -> callLLM
/// callLLM --tool call--> executeTool -> sendToolResult
/// sendToolResult --tool call--> executeTool
/// callLLM | sendToolResult --assistant text--> __finish__
/// ```
pub fn tool_loop_strategy(mode: ToolCallMode) -> Result<StrategyGraph> {
    const CALL_LLM: &str = "callLLM";
    const EXECUTE: &str = "executeTool";
    const SEND: &str = "sendToolResult";

    match mode {
        ToolCallMode::Sequential => single_run_strategy(false),
        ToolCallMode::Parallel => single_run_strategy(true),
        ToolCallMode::SingleRunSequential => StrategyGraph::builder("single_run_sequential")
            .node(llm_request(CALL_LLM, true))
            .node(execute_tool(EXECUTE))
            .node(send_tool_result(SEND))
            .edge(Edge::new(StrategyGraph::START, CALL_LLM))
            .edge(Edge::on_tool_call(CALL_LLM, EXECUTE))
            .edge(Edge::on_assistant_message(CALL_LLM, StrategyGraph::FINISH))
            .edge(Edge::new(EXECUTE, SEND))
            .edge(Edge::on_tool_call(SEND, EXECUTE))
            .edge(Edge::on_assistant_message(SEND, StrategyGraph::FINISH))
            .build(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use serde_json::json;
    use waypoint_core::event::EventKind;
    use waypoint_core::types::{ChatMessage, StreamFrame, ToolChoice};
    use waypoint_tools::ToolRegistry;
    use waypoint_test_utils::{test_model, CalculatorTool, EventRecorder, MockExecutor};

    fn linear(name: &str, nodes: Vec<Node>) -> StrategyGraph {
        let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
        let mut builder = StrategyGraph::builder(name);
        for node in nodes {
            builder = builder.node(node);
        }
        let mut from = StrategyGraph::START.to_string();
        for to in names.into_iter().chain([StrategyGraph::FINISH.to_string()]) {
            builder = builder.edge(Edge::new(from.clone(), to.clone()));
            from = to;
        }
        builder.build().unwrap()
    }

    fn calculator_registry() -> ToolRegistry {
        ToolRegistry::new().with(CalculatorTool::new()).unwrap()
    }

    #[tokio::test]
    async fn force_one_tool_names_the_tool() {
        let mock = Arc::new(
            MockExecutor::new().then_tool_call("calculator", json!({"op": "add", "a": 1, "b": 1})),
        );
        let agent = Agent::builder()
            .shared_executor(mock.clone())
            .model(test_model())
            .tools(calculator_registry())
            .strategy(linear("forced", vec![llm_request_force_one_tool("ask", "calculator")]))
            .build()
            .unwrap();

        let out = agent.run("one plus one").await.unwrap();
        assert_eq!(out.tool_calls().len(), 1);
        let calls = mock.calls();
        assert_eq!(
            calls[0].prompt.params.tool_choice,
            Some(ToolChoice::Named("calculator".into()))
        );
    }

    #[tokio::test]
    async fn llm_request_without_tools_offers_none() {
        let mock = Arc::new(MockExecutor::new());
        let agent = Agent::builder()
            .shared_executor(mock.clone())
            .model(test_model())
            .tools(calculator_registry())
            .strategy(linear("plain", vec![llm_request("ask", false)]))
            .build()
            .unwrap();

        agent.run("hello").await.unwrap();
        assert!(mock.calls()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn execute_tool_rejects_wrong_input() {
        let recorder = EventRecorder::new();
        let agent = Agent::builder()
            .executor(MockExecutor::new())
            .model(test_model())
            .strategy(linear("wrong", vec![execute_tool("run")]))
            .install(recorder.clone())
            .build()
            .unwrap();

        let err = agent.run("not a call").await.unwrap_err();
        assert!(err.to_string().contains("expected a tool call"));
        assert_eq!(recorder.labels_of(&[EventKind::NodeFailed]), vec!["NodeFailed(run)"]);
    }

    #[tokio::test]
    async fn append_prompt_edits_history_and_passes_input() {
        let mock = Arc::new(MockExecutor::new());
        let agent = Agent::builder()
            .shared_executor(mock.clone())
            .model(test_model())
            .strategy(linear(
                "prep",
                vec![
                    append_prompt("prime", |p| p.push(ChatMessage::user("context first"))),
                    transform("upper", |p| Ok(Payload::Text(p.text_content().to_uppercase()))),
                    llm_request("ask", true),
                ],
            ))
            .build()
            .unwrap();

        agent.run("question").await.unwrap();
        let prompt = &mock.calls()[0].prompt;
        let texts: Vec<String> = prompt.messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["context first", "QUESTION"]);
    }

    #[tokio::test]
    async fn streaming_node_assembles_reply() {
        let agent = Agent::builder()
            .executor(MockExecutor::new().then_stream(vec![
                StreamFrame::Append { text: "Hel".into() },
                StreamFrame::Append { text: "lo".into() },
                StreamFrame::End { finish_reason: None },
            ]))
            .model(test_model())
            .strategy(linear("stream", vec![llm_request_streaming("ask")]))
            .build()
            .unwrap();

        let out = agent.run("hi").await.unwrap();
        assert_eq!(out.text_content(), "Hello");
    }
}
