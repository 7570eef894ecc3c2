use std::sync::Arc;

use serde_json::json;

use waypoint::core::types::ContentBlock;
use waypoint::prebuilt::llm_request;
use waypoint::{
    single_run_strategy, Agent, Edge, EventKind, Node, Payload, StrategyGraph,
    ToolRegistry, WaypointError,
};
use waypoint_test_utils::{init_tracing, test_model, CalculatorTool, EventRecorder, MockExecutor};

fn linear_graph() -> StrategyGraph {
    StrategyGraph::builder("linear")
        .node(llm_request("llmCall", true))
        .edge(Edge::new(StrategyGraph::START, "llmCall"))
        .edge(Edge::new("llmCall", StrategyGraph::FINISH))
        .build()
        .unwrap()
}

#[tokio::test]
async fn linear_graph_emits_complete_ordered_events() {
    init_tracing();
    let recorder = EventRecorder::new();
    let agent = Agent::builder()
        .executor(MockExecutor::new().then_text("Done"))
        .model(test_model())
        .strategy(linear_graph())
        .install(recorder.clone())
        .build()
        .unwrap();

    let out = agent.run("hi").await.unwrap();
    assert_eq!(out.text_content(), "Done");
    assert_eq!(
        recorder.labels(),
        vec![
            "AgentStarting(linear)",
            "StrategyStarting(linear)",
            "NodeStarting(__start__)",
            "NodeCompleted(__start__)",
            "NodeStarting(llmCall)",
            "LlmCallStarting",
            "LlmCallCompleted",
            "NodeCompleted(llmCall)",
            "NodeStarting(__finish__)",
            "NodeCompleted(__finish__)",
            "StrategyCompleted(linear)",
            "AgentCompleted(linear)",
        ]
    );

    let events = recorder.events();
    assert!(events.iter().all(|(meta, _)| meta.run_id == events[0].0.run_id));
}

#[tokio::test]
async fn tool_loop_runs_calculator_and_answers() {
    init_tracing();
    let mock = Arc::new(
        MockExecutor::new()
            .then_tool_call("calculator", json!({"op": "add", "a": 2, "b": 3}))
            .then_text("The answer is 5"),
    );
    let recorder = EventRecorder::new();
    let agent = Agent::builder()
        .shared_executor(mock.clone())
        .model(test_model())
        .system_prompt("You are a calculator.")
        .tools(ToolRegistry::new().with(CalculatorTool::new()).unwrap())
        .strategy(single_run_strategy(false).unwrap())
        .install(recorder.clone())
        .build()
        .unwrap();

    let out = agent.run("What is 2 + 3?").await.unwrap();
    assert_eq!(out.text_content(), "The answer is 5");

    assert_eq!(
        recorder.labels_of(&[
            EventKind::NodeStarting,
            EventKind::ToolCallStarting,
            EventKind::ToolCallCompleted,
        ]),
        vec![
            "NodeStarting(__start__)",
            "NodeStarting(callLLM)",
            "NodeStarting(executeTools)",
            "ToolCallStarting(calculator)",
            "ToolCallCompleted(calculator)",
            "NodeStarting(sendToolResults)",
            "NodeStarting(__finish__)",
        ]
    );

    // second request carries the call and its result
    let calls = mock.calls();
    assert_eq!(calls.len(), 2);
    let history = &calls[1].prompt.messages;
    assert_eq!(history.len(), 4);
    assert!(history[2].is_tool_call());
    assert!(matches!(
        &history[3].content[0],
        ContentBlock::ToolResult { content, is_error: false, .. } if content == "5"
    ));
    assert!(calls[1].tools.iter().any(|t| t.name == "calculator"));
}

#[tokio::test]
async fn failing_node_stops_events_at_failure() {
    init_tracing();
    let graph = StrategyGraph::builder("broken")
        .node(Node::new("explode", |_ctx, _input| async {
            Err::<Payload, _>(WaypointError::NodeFailure("X".into()))
        }))
        .edge(Edge::new(StrategyGraph::START, "explode"))
        .edge(Edge::new("explode", StrategyGraph::FINISH))
        .build()
        .unwrap();
    let recorder = EventRecorder::new();
    let agent = Agent::builder()
        .executor(MockExecutor::new())
        .model(test_model())
        .strategy(graph)
        .install(recorder.clone())
        .build()
        .unwrap();

    let err = agent.run("hi").await.unwrap_err();
    assert!(matches!(err, WaypointError::NodeFailure(ref m) if m == "X"));

    let labels = recorder.labels();
    assert_eq!(
        &labels[labels.len() - 2..],
        &["NodeFailed(explode)".to_string(), "AgentFailed(broken)".to_string()]
    );
    assert_eq!(recorder.count(EventKind::StrategyCompleted), 0);
    assert_eq!(recorder.count(EventKind::AgentCompleted), 0);
}

#[tokio::test]
async fn broadcast_subscribers_see_the_run() {
    let agent = Agent::builder()
        .executor(MockExecutor::new().then_text("Done"))
        .model(test_model())
        .strategy(linear_graph())
        .build()
        .unwrap();
    let mut rx = agent.subscribe();

    agent.run("hi").await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.event.kind());
    }
    assert_eq!(kinds.first(), Some(&EventKind::AgentStarting));
    assert_eq!(kinds.last(), Some(&EventKind::AgentCompleted));
}
