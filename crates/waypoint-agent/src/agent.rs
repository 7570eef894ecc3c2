use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use waypoint_core::config::{AgentConfig, AppConfig};
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::*;
use waypoint_core::execution::ExecutionInfo;
use waypoint_core::payload::Payload;
use waypoint_core::traits::{LlmExecutor, Tool};
use waypoint_core::types::{LlmModel, LlmParams, Prompt};
use waypoint_tools::ToolRegistry;

use crate::checkpoint::AgentCheckpoint;
use crate::context::{AgentContext, ContextInner};
use crate::environment::ToolEnvironment;
use crate::session::{LlmDispatch, LlmSession, SessionState};
use crate::strategy::AgentStrategy;

/// Where an agent is in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentState {
    NotStarted,
    Running,
    Finished(Payload),
    Failed(String),
}

/// A configured agent: strategy, model, tools and installed features.
///
/// Runs may repeat but never overlap. Every run starts from fresh session
/// state; nothing but the cancel token carries over between runs.
pub struct Agent {
    id: String,
    executor: Arc<dyn LlmExecutor>,
    config: AgentConfig,
    model: LlmModel,
    params: LlmParams,
    registry: Arc<ToolRegistry>,
    strategy: AgentStrategy,
    pipeline: Arc<EventPipeline>,
    cancel: CancellationToken,
    state: Mutex<AgentState>,
    closed: AtomicBool,
}

/// Resets a run's state if its future is dropped before finishing.
struct RunGuard<'a> {
    state: &'a Mutex<AgentState>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == AgentState::Running {
            *state = AgentState::Failed("run aborted".to_string());
        }
    }
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> AgentState {
        self.lock_state().clone()
    }

    pub fn strategy(&self) -> &AgentStrategy {
        &self.strategy
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Cancels the current run and every later one.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Async tap on every event this agent emits.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Arc<Event>> {
        self.pipeline.subscribe()
    }

    /// Run the strategy on `input` and return the finish node's output.
    pub async fn run(&self, input: impl Into<Payload>) -> Result<Payload> {
        let input = input.into();
        let _guard = self.begin()?;
        let prompt = self.config.initial_prompt(self.params.clone());
        let ctx = self.new_context(prompt);
        self.drive(&ctx, input, None).await
    }

    /// Restore a checkpoint's history and continue the walk at its node.
    pub async fn resume(&self, checkpoint: AgentCheckpoint) -> Result<Payload> {
        if !self.strategy.can_resume_at(&checkpoint.node_id) {
            return Err(WaypointError::Checkpoint(format!(
                "strategy '{}' has no node '{}'",
                self.strategy.name(),
                checkpoint.node_id
            )));
        }
        let _guard = self.begin()?;
        let mut prompt = self.config.initial_prompt(self.params.clone());
        prompt.messages = checkpoint.message_history;
        let ctx = self.new_context(prompt);
        info!(
            agent_id = %self.id,
            checkpoint = %checkpoint.checkpoint_id,
            node = %checkpoint.node_id,
            "Resuming from checkpoint"
        );
        self.drive(&ctx, checkpoint.last_input, Some(checkpoint.node_id))
            .await
    }

    /// Emit AgentClosing. Later calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let meta = EventMeta::now("", self.id.clone(), ExecutionInfo::root(self.id.clone()));
        self.pipeline.emit(meta, AgentClosing);
        debug!(agent_id = %self.id, "Agent closed");
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> Result<RunGuard<'_>> {
        let mut state = self.lock_state();
        if *state == AgentState::Running {
            return Err(WaypointError::AlreadyRunning(self.id.clone()));
        }
        *state = AgentState::Running;
        Ok(RunGuard { state: &self.state })
    }

    fn finish(&self, state: AgentState) {
        *self.lock_state() = state;
    }

    fn new_context(&self, prompt: Prompt) -> AgentContext {
        let run_id = Uuid::new_v4().to_string();
        let execution = ExecutionInfo::root(self.strategy.name());
        let state = SessionState::new(prompt, self.registry.descriptors(), self.model.clone());
        let dispatch = LlmDispatch {
            executor: self.executor.clone(),
            pipeline: self.pipeline.clone(),
            run_id: run_id.clone(),
            agent_id: self.id.clone(),
            cancel: self.cancel.clone(),
        };
        let inner = ContextInner {
            run_id,
            agent_id: self.id.clone(),
            strategy: self.strategy.name().to_string(),
            config: self.config.clone(),
            session: LlmSession::new(state, dispatch, execution.clone()),
            environment: ToolEnvironment::new(self.registry.clone()),
            pipeline: self.pipeline.clone(),
            cancel: self.cancel.clone(),
            storage: Mutex::new(HashMap::new()),
            iterations: AtomicUsize::new(0),
        };
        AgentContext::new(inner, execution)
    }

    async fn drive(&self, ctx: &AgentContext, input: Payload, resume_at: Option<String>) -> Result<Payload> {
        let strategy = self.strategy.name().to_string();
        info!(agent_id = %self.id, run_id = %ctx.run_id(), strategy = %strategy, "Agent run starting");
        ctx.emit(AgentStarting {
            strategy: strategy.clone(),
            input: input.clone(),
        });
        ctx.emit(StrategyStarting {
            strategy: strategy.clone(),
        });

        let result = match resume_at {
            Some(node) => self.strategy.resume(ctx, &node, input).await,
            None => self.strategy.execute(ctx, input).await,
        };

        match result {
            Ok(output) => {
                ctx.emit(StrategyCompleted {
                    strategy: strategy.clone(),
                    result: output.clone(),
                });
                ctx.emit(AgentCompleted {
                    strategy,
                    result: output.clone(),
                });
                info!(agent_id = %self.id, run_id = %ctx.run_id(), "Agent run completed");
                self.finish(AgentState::Finished(output.clone()));
                Ok(output)
            }
            Err(e) => {
                ctx.emit(AgentFailed {
                    strategy,
                    error: e.to_string(),
                });
                warn!(agent_id = %self.id, run_id = %ctx.run_id(), error = %e, "Agent run failed");
                self.finish(AgentState::Failed(e.to_string()));
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("strategy", &self.strategy)
            .field("model", &self.model.id)
            .field("tools", &self.registry.list())
            .finish()
    }
}

/// Builder for [`Agent`]. Executor, model and strategy are required.
#[derive(Default)]
pub struct AgentBuilder {
    id: Option<String>,
    executor: Option<Arc<dyn LlmExecutor>>,
    config: AgentConfig,
    model: Option<LlmModel>,
    params: LlmParams,
    registry: ToolRegistry,
    strategy: Option<AgentStrategy>,
    pipeline: Option<EventPipeline>,
    broadcast_capacity: Option<usize>,
    features: Vec<Box<dyn Feature>>,
}

impl AgentBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn executor(self, executor: impl LlmExecutor) -> Self {
        self.shared_executor(Arc::new(executor))
    }

    pub fn shared_executor(mut self, executor: Arc<dyn LlmExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Agent settings, model, params and pipeline capacity from a loaded
    /// config file.
    pub fn from_app_config(mut self, app: &AppConfig) -> Self {
        self.config = app.agent.clone();
        self.model = Some(app.model.to_model());
        self.params = app.model.to_params();
        self.broadcast_capacity = Some(app.events.broadcast_capacity);
        self
    }

    pub fn model(mut self, model: LlmModel) -> Self {
        self.model = Some(model);
        self
    }

    pub fn params(mut self, params: LlmParams) -> Self {
        self.params = params;
        self
    }

    pub fn system_prompt(mut self, system: impl Into<String>) -> Self {
        self.config.system_prompt = Some(system.into());
        self
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_agent_iterations = max;
        self
    }

    pub fn tools(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register one more tool. A duplicate name fails the build.
    pub fn tool(mut self, tool: impl Tool) -> Result<Self> {
        self.registry.register(tool)?;
        Ok(self)
    }

    pub fn strategy(mut self, strategy: impl Into<AgentStrategy>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    /// Install a feature. Features install in the order given.
    pub fn install(mut self, feature: impl Feature + 'static) -> Self {
        self.features.push(Box::new(feature));
        self
    }

    /// Start from a pre-populated pipeline instead of an empty one.
    pub fn pipeline(mut self, pipeline: EventPipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn build(self) -> Result<Agent> {
        let executor = self
            .executor
            .ok_or_else(|| WaypointError::Config("agent has no LLM executor".into()))?;
        let model = self
            .model
            .ok_or_else(|| WaypointError::Config("agent has no model".into()))?;
        let strategy = self
            .strategy
            .ok_or_else(|| WaypointError::Config("agent has no strategy".into()))?;

        let mut pipeline = match (self.pipeline, self.broadcast_capacity) {
            (Some(pipeline), _) => pipeline,
            (None, Some(capacity)) => EventPipeline::new(capacity),
            (None, None) => EventPipeline::default(),
        };
        for feature in &self.features {
            debug!(feature = feature.name(), "Installing feature");
            feature.install(&mut pipeline);
        }

        Ok(Agent {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            executor,
            config: self.config,
            model,
            params: self.params,
            registry: Arc::new(self.registry),
            strategy,
            pipeline: Arc::new(pipeline),
            cancel: CancellationToken::new(),
            state: Mutex::new(AgentState::NotStarted),
            closed: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{single_run_strategy, Edge, Node, StrategyGraph};
    use std::time::Duration;
    use tokio::sync::Notify;
    use waypoint_core::types::ChatMessage;
    use waypoint_test_utils::{test_model, EventRecorder, MockExecutor};

    fn echo_strategy() -> AgentStrategy {
        AgentStrategy::functional("echo", |_ctx, input| async move { Ok(input) })
    }

    #[test]
    fn build_requires_executor_model_and_strategy() {
        let missing_executor = Agent::builder().model(test_model()).strategy(echo_strategy()).build();
        assert!(matches!(missing_executor, Err(WaypointError::Config(_))));

        let missing_model = Agent::builder()
            .executor(MockExecutor::new())
            .strategy(echo_strategy())
            .build();
        assert!(matches!(missing_model, Err(WaypointError::Config(_))));

        let missing_strategy = Agent::builder().executor(MockExecutor::new()).model(test_model()).build();
        assert!(matches!(missing_strategy, Err(WaypointError::Config(_))));
    }

    #[tokio::test]
    async fn functional_strategy_is_wrapped_in_strategy_events() {
        let recorder = EventRecorder::new();
        let agent = Agent::builder()
            .id("a1")
            .executor(MockExecutor::new())
            .model(test_model())
            .strategy(echo_strategy())
            .install(recorder.clone())
            .build()
            .unwrap();

        assert_eq!(agent.state(), AgentState::NotStarted);
        let out = agent.run("ping").await.unwrap();
        assert_eq!(out, Payload::Text("ping".into()));
        assert_eq!(agent.state(), AgentState::Finished(Payload::Text("ping".into())));
        assert_eq!(
            recorder.labels(),
            vec![
                "AgentStarting(echo)",
                "StrategyStarting(echo)",
                "StrategyCompleted(echo)",
                "AgentCompleted(echo)",
            ]
        );
        assert!(recorder.events().iter().all(|(meta, _)| meta.agent_id == "a1"));
    }

    #[tokio::test]
    async fn overlapping_runs_are_rejected() {
        let gate = Arc::new(Notify::new());
        let held = gate.clone();
        let agent = Arc::new(
            Agent::builder()
                .executor(MockExecutor::new())
                .model(test_model())
                .strategy(AgentStrategy::functional("wait", move |_ctx, input| {
                    let held = held.clone();
                    async move {
                        held.notified().await;
                        Ok(input)
                    }
                }))
                .build()
                .unwrap(),
        );

        let runner = agent.clone();
        let first = tokio::spawn(async move { runner.run("one").await });
        while agent.state() != AgentState::Running {
            tokio::task::yield_now().await;
        }

        let err = agent.run("two").await.unwrap_err();
        assert!(matches!(err, WaypointError::AlreadyRunning(_)));

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), Payload::Text("one".into()));
        // free again once the first run is done
        gate.notify_one();
        agent.run("three").await.unwrap();
    }

    #[tokio::test]
    async fn failed_run_records_state() {
        let agent = Agent::builder()
            .executor(MockExecutor::new())
            .model(test_model())
            .strategy(AgentStrategy::functional("boom", |_ctx, _input| async {
                Err::<Payload, _>(WaypointError::NodeFailure("X".into()))
            }))
            .build()
            .unwrap();

        let err = agent.run("").await.unwrap_err();
        assert!(matches!(err, WaypointError::NodeFailure(ref m) if m == "X"));
        assert!(matches!(agent.state(), AgentState::Failed(ref m) if m.contains('X')));
    }

    #[tokio::test]
    async fn cancel_interrupts_a_pending_llm_call() {
        let recorder = EventRecorder::new();
        let agent = Agent::builder()
            .executor(MockExecutor::new().then_hang())
            .model(test_model())
            .strategy(single_run_strategy(false).unwrap())
            .install(recorder.clone())
            .build()
            .unwrap();

        let token = agent.cancel_token();
        let canceller = async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        };
        let (result, ()) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(agent.run("hello"), canceller)
        })
        .await
        .expect("run did not stop after cancel");

        assert!(matches!(result, Err(WaypointError::Cancelled)));
        assert!(matches!(agent.state(), AgentState::Failed(_)));
        assert_eq!(recorder.count(EventKind::LlmCallCompleted), 0);
        assert_eq!(recorder.count(EventKind::NodeFailed), 1);
    }

    #[tokio::test]
    async fn each_run_starts_from_fresh_history() {
        let mock = Arc::new(MockExecutor::new().default_text("fine"));
        let agent = Agent::builder()
            .shared_executor(mock.clone())
            .model(test_model())
            .system_prompt("be brief")
            .strategy(single_run_strategy(false).unwrap())
            .build()
            .unwrap();

        agent.run("first").await.unwrap();
        agent.run("second").await.unwrap();

        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        for (call, expected) in calls.iter().zip(["first", "second"]) {
            assert_eq!(call.prompt.messages.len(), 2);
            assert_eq!(call.prompt.messages[1].text(), expected);
        }
    }

    #[tokio::test]
    async fn close_emits_once() {
        let recorder = EventRecorder::new();
        let agent = Agent::builder()
            .executor(MockExecutor::new())
            .model(test_model())
            .strategy(echo_strategy())
            .install(recorder.clone())
            .build()
            .unwrap();
        agent.close();
        agent.close();
        assert_eq!(recorder.labels(), vec!["AgentClosing"]);
    }

    fn resumable_graph() -> StrategyGraph {
        StrategyGraph::builder("resumable")
            .node(Node::new("first", |_ctx, _input| async {
                Ok(Payload::Text("from first".into()))
            }))
            .node(Node::new("second", |ctx, input| async move {
                let seen = ctx.history().await?.len();
                Ok(Payload::Text(format!("{} after {} messages", input.text_content(), seen)))
            }))
            .edge(Edge::new(StrategyGraph::START, "first"))
            .edge(Edge::new("first", "second"))
            .edge(Edge::new("second", StrategyGraph::FINISH))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn resume_restores_history_and_skips_earlier_nodes() {
        let recorder = EventRecorder::new();
        let agent = Agent::builder()
            .executor(MockExecutor::new())
            .model(test_model())
            .system_prompt("ignored on resume")
            .strategy(resumable_graph())
            .install(recorder.clone())
            .build()
            .unwrap();

        let checkpoint = AgentCheckpoint::new(
            "second",
            Payload::Text("restored".into()),
            vec![ChatMessage::user("q"), ChatMessage::assistant_text("a"), ChatMessage::user("q2")],
        );
        let out = agent.resume(checkpoint).await.unwrap();
        assert_eq!(out, Payload::Text("restored after 3 messages".into()));
        assert!(!recorder.labels().contains(&"NodeStarting(first)".to_string()));
    }

    #[tokio::test]
    async fn resume_rejects_unknown_node() {
        let recorder = EventRecorder::new();
        let agent = Agent::builder()
            .executor(MockExecutor::new())
            .model(test_model())
            .strategy(resumable_graph())
            .install(recorder.clone())
            .build()
            .unwrap();

        let err = agent
            .resume(AgentCheckpoint::new("gone", Payload::Empty, Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, WaypointError::Checkpoint(_)));
        assert_eq!(agent.state(), AgentState::NotStarted);
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn checkpoint_from_context_round_trips_through_resume() {
        let graph = StrategyGraph::builder("snap")
            .node(Node::new("ask", |ctx, input| async move {
                ctx.request_llm(input.text_content(), false).await?;
                let checkpoint = ctx.checkpoint("done", Payload::Text("later".into())).await?;
                Ok(Payload::Text(checkpoint.to_json()?))
            }))
            .node(Node::new("done", |_ctx, input| async move { Ok(input) }))
            .edge(Edge::new(StrategyGraph::START, "ask"))
            .edge(Edge::new("ask", StrategyGraph::FINISH))
            .edge(Edge::new("done", StrategyGraph::FINISH))
            .build()
            .unwrap();
        let agent = Agent::builder()
            .executor(MockExecutor::new().then_text("answer"))
            .model(test_model())
            .strategy(graph)
            .build()
            .unwrap();

        let json = agent.run("question").await.unwrap().text_content();
        let checkpoint = AgentCheckpoint::from_json(&json).unwrap();
        assert_eq!(checkpoint.node_id, "done");
        assert_eq!(checkpoint.message_history.len(), 2);

        let out = agent.resume(checkpoint).await.unwrap();
        assert_eq!(out, Payload::Text("later".into()));
    }
}
