//! Delegating a self-contained task to a nested tool loop.

use tracing::info;

use waypoint_core::error::Result;
use waypoint_core::payload::Payload;
use waypoint_core::types::LlmModel;

use crate::context::AgentContext;
use crate::graph::{executor, tool_loop_strategy, ToolCallMode};

/// Execution frame name of every subtask.
pub const SUBTASK_SCOPE: &str = "subtask";

/// A task description handed to the model inside a child scope.
///
/// Built by [`AgentContext::subtask`]. The task and its input are sent as one
/// user turn and the tool loop runs until the model answers in plain text.
/// Scoped tools and model apply only for the duration of [`run`](Self::run).
#[must_use = "a subtask does nothing until `run` is awaited"]
pub struct Subtask<'a> {
    ctx: &'a AgentContext,
    task: String,
    input: Payload,
    tools: Option<Vec<String>>,
    model: Option<LlmModel>,
    mode: ToolCallMode,
}

impl<'a> Subtask<'a> {
    pub(crate) fn new(ctx: &'a AgentContext, task: String) -> Self {
        Self {
            ctx,
            task,
            input: Payload::Empty,
            tools: None,
            model: None,
            mode: ToolCallMode::default(),
        }
    }

    pub fn with_input(mut self, input: impl Into<Payload>) -> Self {
        self.input = input.into();
        self
    }

    /// Restrict the offered tools to these registered names.
    pub fn with_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn use_model(mut self, model: LlmModel) -> Self {
        self.model = Some(model);
        self
    }

    pub fn run_mode(mut self, mode: ToolCallMode) -> Self {
        self.mode = mode;
        self
    }

    /// Run the loop; returns the model's final text.
    pub async fn run(self) -> Result<Payload> {
        let graph = tool_loop_strategy(self.mode)?;
        let input = self.input.text_content();
        let request = if input.is_empty() {
            self.task
        } else {
            format!("{}\n\n{}", self.task, input)
        };
        info!(mode = ?self.mode, path = %self.ctx.execution().path, "Starting subtask");
        executor::run_nested(
            self.ctx,
            SUBTASK_SCOPE,
            &graph,
            self.tools.as_deref(),
            self.model.as_ref(),
            Payload::Text(request),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::strategy::AgentStrategy;
    use serde_json::json;
    use std::sync::Arc;
    use waypoint_core::error::WaypointError;
    use waypoint_core::event::EventKind;
    use waypoint_tools::ToolRegistry;
    use waypoint_test_utils::{test_model, CalculatorTool, EchoTool, EventRecorder, MockExecutor};

    fn registry() -> ToolRegistry {
        ToolRegistry::new()
            .with(CalculatorTool::new())
            .unwrap()
            .with(EchoTool)
            .unwrap()
    }

    fn delegating_agent(
        mock: Arc<MockExecutor>,
        recorder: &EventRecorder,
        mode: ToolCallMode,
    ) -> Agent {
        Agent::builder()
            .shared_executor(mock)
            .model(test_model())
            .tools(registry())
            .strategy(AgentStrategy::functional("delegate", move |ctx, input| async move {
                let result = ctx
                    .subtask("Add the numbers")
                    .with_input(input)
                    .with_tools(["calculator"])
                    .use_model(LlmModel::new("mock", "small"))
                    .run_mode(mode)
                    .run()
                    .await?;
                // back in the parent scope with every tool
                let after = ctx.request_llm("", true).await?;
                Ok(Payload::Text(format!("{} / {}", result.text_content(), after.text())))
            }))
            .install(recorder.clone())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn subtask_scopes_tools_and_model() {
        let mock = Arc::new(
            MockExecutor::new()
                .then_tool_calls(vec![
                    ("calculator", json!({"op": "add", "a": 7, "b": 8})),
                    ("calculator", json!({"op": "mul", "a": 2, "b": 3})),
                ])
                .then_text("15 and 6")
                .then_text("done"),
        );
        let recorder = EventRecorder::new();
        let agent = delegating_agent(mock.clone(), &recorder, ToolCallMode::Parallel);

        let out = agent.run("7 and 8").await.unwrap();
        assert_eq!(out, Payload::Text("15 and 6 / done".into()));

        let calls = mock.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].prompt.messages.last().unwrap().text(), "Add the numbers\n\n7 and 8");
        for call in &calls[..2] {
            assert_eq!(call.model.id, "small");
            let names: Vec<&str> = call.tools.iter().map(|t| t.name.as_str()).collect();
            assert_eq!(names, vec!["calculator"]);
        }
        assert_eq!(calls[2].model, test_model());
        assert_eq!(calls[2].tools.len(), 2);

        assert_eq!(recorder.count(EventKind::ToolCallCompleted), 2);
        assert_eq!(
            recorder.labels_of(&[EventKind::SubgraphStarting, EventKind::SubgraphCompleted]),
            vec!["SubgraphStarting(subtask)", "SubgraphCompleted(subtask)"]
        );
        let (meta, _) = recorder
            .events()
            .into_iter()
            .find(|(_, e)| e.kind() == EventKind::ToolCallStarting)
            .unwrap();
        assert!(meta.execution.path.to_string().ends_with(SUBTASK_SCOPE));
    }

    #[tokio::test]
    async fn single_run_sequential_runs_one_call_per_turn() {
        let mock = Arc::new(
            MockExecutor::new()
                .then_tool_calls(vec![
                    ("calculator", json!({"op": "add", "a": 7, "b": 8})),
                    ("calculator", json!({"op": "add", "a": 1, "b": 1})),
                ])
                .then_tool_call("calculator", json!({"op": "add", "a": 1, "b": 1}))
                .then_text("15 then 2")
                .then_text("done"),
        );
        let recorder = EventRecorder::new();
        let agent = delegating_agent(mock.clone(), &recorder, ToolCallMode::SingleRunSequential);

        let out = agent.run("").await.unwrap();
        assert_eq!(out, Payload::Text("15 then 2 / done".into()));
        assert_eq!(recorder.count(EventKind::ToolCallStarting), 2);
        assert_eq!(mock.calls()[0].prompt.messages.last().unwrap().text(), "Add the numbers");
    }

    #[tokio::test]
    async fn unknown_scoped_tool_fails_the_subtask() {
        let recorder = EventRecorder::new();
        let agent = Agent::builder()
            .executor(MockExecutor::new())
            .model(test_model())
            .tools(registry())
            .strategy(AgentStrategy::functional("delegate", |ctx, _input| async move {
                ctx.subtask("Use a missing tool").with_tools(["nope"]).run().await
            }))
            .install(recorder.clone())
            .build()
            .unwrap();

        let err = agent.run("").await.unwrap_err();
        assert!(matches!(err, WaypointError::ToolNotFound(ref name) if name == "nope"));
        assert_eq!(recorder.count(EventKind::SubgraphFailed), 1);
    }
}
