use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use waypoint_core::config::AgentConfig;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::{EventMeta, EventPipeline, LifecycleEvent};
use waypoint_core::execution::ExecutionInfo;
use waypoint_core::payload::Payload;
use waypoint_core::types::*;

use crate::checkpoint::AgentCheckpoint;
use crate::environment::ToolEnvironment;
use crate::graph::executor;
use crate::graph::StrategyGraph;
use crate::session::LlmSession;
use crate::subtask::Subtask;

pub(crate) struct ContextInner {
    pub(crate) run_id: String,
    pub(crate) agent_id: String,
    pub(crate) strategy: String,
    pub(crate) config: AgentConfig,
    pub(crate) session: LlmSession,
    pub(crate) environment: ToolEnvironment,
    pub(crate) pipeline: Arc<EventPipeline>,
    pub(crate) cancel: CancellationToken,
    pub(crate) storage: Mutex<HashMap<String, serde_json::Value>>,
    pub(crate) iterations: AtomicUsize,
}

/// Everything a node body can reach during one run.
///
/// Cheap to clone. Each clone carries its own [`ExecutionInfo`]; entering a
/// subgraph or a named scope hands out a child context instead of mutating
/// shared state, so the path unwinds on every exit.
#[derive(Clone)]
pub struct AgentContext {
    inner: Arc<ContextInner>,
    execution: ExecutionInfo,
}

impl AgentContext {
    pub(crate) fn new(inner: ContextInner, execution: ExecutionInfo) -> Self {
        Self {
            inner: Arc::new(inner),
            execution,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn strategy_name(&self) -> &str {
        &self.inner.strategy
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn execution(&self) -> &ExecutionInfo {
        &self.execution
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn tools(&self) -> &ToolEnvironment {
        &self.inner.environment
    }

    pub fn meta(&self) -> EventMeta {
        EventMeta::now(
            self.inner.run_id.clone(),
            self.inner.agent_id.clone(),
            self.execution.clone(),
        )
    }

    pub(crate) fn emit(&self, event: impl Into<LifecycleEvent>) {
        self.inner.pipeline.emit(self.meta(), event);
    }

    /// A context for a named sub-unit: fresh execution id, parent linked.
    pub fn with_scope(&self, name: impl Into<String>) -> AgentContext {
        Self {
            inner: self.inner.clone(),
            execution: self.execution.child(name),
        }
    }

    /// Count one node execution against `max_agent_iterations`.
    pub(crate) fn tick(&self) -> Result<()> {
        let max = self.inner.config.max_agent_iterations;
        let done = self.inner.iterations.fetch_add(1, Ordering::SeqCst) + 1;
        if done > max {
            return Err(WaypointError::MaxIterationsExceeded(max));
        }
        Ok(())
    }

    /// Session handle over this run's prompt, tools and model.
    pub fn llm(&self) -> LlmSession {
        self.inner.session.scoped(self.execution.clone())
    }

    /// Append `message` as a user turn (unless empty) and ask the model.
    ///
    /// With `allow_tool_calls = false` no tools are offered.
    pub async fn request_llm(&self, message: impl Into<String>, allow_tool_calls: bool) -> Result<ChatMessage> {
        let message = message.into();
        self.llm()
            .write_session(|session| async move {
                append_user(&session, message);
                if allow_tool_calls {
                    session.request_llm().await
                } else {
                    session.request_llm_without_tools().await
                }
            })
            .await
    }

    /// Like [`request_llm`](Self::request_llm), returning every reply message.
    pub async fn request_llm_multiple(&self, message: impl Into<String>) -> Result<Vec<ChatMessage>> {
        let message = message.into();
        self.llm()
            .write_session(|session| async move {
                append_user(&session, message);
                session.request_llm_multiple().await
            })
            .await
    }

    pub async fn request_llm_only_calling_tools(&self, message: impl Into<String>) -> Result<ChatMessage> {
        let message = message.into();
        self.llm()
            .write_session(|session| async move {
                append_user(&session, message);
                session.request_llm_only_calling_tools().await
            })
            .await
    }

    pub async fn request_llm_force_one_tool(
        &self,
        message: impl Into<String>,
        tool: impl Into<String>,
    ) -> Result<ChatMessage> {
        let message = message.into();
        let tool = tool.into();
        self.llm()
            .write_session(|session| async move {
                append_user(&session, message);
                session.request_llm_force_one_tool(&tool).await
            })
            .await
    }

    pub async fn request_llm_streaming(
        &self,
        message: impl Into<String>,
        on_frame: Option<&(dyn Fn(&StreamFrame) + Send + Sync)>,
    ) -> Result<ChatMessage> {
        let message = message.into();
        self.llm()
            .write_session(|session| async move {
                append_user(&session, message);
                session.request_llm_streaming(on_frame).await
            })
            .await
    }

    /// Ask for a JSON reply matching `schema` and decode it into `T`.
    ///
    /// The schema is appended to `message` and no tools are offered. A reply
    /// that is not JSON, breaks the schema or does not fit `T` fails with
    /// [`WaypointError::StructuredOutput`] and leaves the history untouched.
    pub async fn request_llm_structured<T>(
        &self,
        message: impl Into<String>,
        schema: Value,
    ) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let request = structured_request(&message.into(), &schema);
        self.llm()
            .write_session(|session| async move {
                session.append_user(request);
                let reply = session.request_llm_without_tools().await?;
                decode_structured(&reply.text(), &schema)
            })
            .await
    }

    /// [`request_llm_structured`](Self::request_llm_structured) with the
    /// schema derived from `T`.
    pub async fn request_llm_typed<T>(&self, message: impl Into<String>) -> Result<T>
    where
        T: JsonSchema + DeserializeOwned + Send + 'static,
    {
        self.request_llm_structured(message, waypoint_tools::schema_of::<T>())
            .await
    }

    /// Start building a subtask that runs a tool loop in a child scope.
    pub fn subtask(&self, task: impl Into<String>) -> Subtask<'_> {
        Subtask::new(self, task.into())
    }

    pub async fn execute_tool(&self, call: ToolCall) -> Result<ReceivedToolResult> {
        self.inner.environment.execute(self, call).await
    }

    pub async fn execute_multiple_tools(
        &self,
        calls: Vec<ToolCall>,
        parallel: bool,
    ) -> Result<Vec<ReceivedToolResult>> {
        self.inner.environment.execute_all(self, calls, parallel).await
    }

    /// Report a tool result to the model and return its reply.
    pub async fn send_tool_result(&self, result: ReceivedToolResult) -> Result<ChatMessage> {
        self.llm()
            .write_session(|session| async move {
                session.append(ChatMessage::tool_result(&result));
                session.request_llm().await
            })
            .await
    }

    pub async fn send_multiple_tool_results(
        &self,
        results: Vec<ReceivedToolResult>,
    ) -> Result<Vec<ChatMessage>> {
        self.llm()
            .write_session(|session| async move {
                for result in &results {
                    session.append(ChatMessage::tool_result(result));
                }
                session.request_llm_multiple().await
            })
            .await
    }

    pub async fn history(&self) -> Result<Vec<ChatMessage>> {
        self.llm()
            .read_session(|session| async move { Ok(session.history()) })
            .await
    }

    pub async fn update_prompt<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Prompt),
    {
        self.llm().update_prompt(f).await
    }

    /// Run `graph` as a nested strategy of this context.
    pub async fn run_subgraph(
        &self,
        name: &str,
        graph: &StrategyGraph,
        input: Payload,
    ) -> Result<Payload> {
        executor::run_nested(self, name, graph, None, None, input).await
    }

    /// Capture enough state to resume at `node` with `input`.
    pub async fn checkpoint(&self, node: impl Into<String>, input: Payload) -> Result<AgentCheckpoint> {
        Ok(AgentCheckpoint::new(node, input, self.history().await?))
    }

    pub fn storage_set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.storage().insert(key.into(), value);
    }

    pub fn storage_get(&self, key: &str) -> Option<serde_json::Value> {
        self.storage().get(key).cloned()
    }

    pub fn storage_remove(&self, key: &str) -> Option<serde_json::Value> {
        self.storage().remove(key)
    }

    fn storage(&self) -> std::sync::MutexGuard<'_, HashMap<String, serde_json::Value>> {
        self.inner
            .storage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn append_user(session: &crate::session::WriteSession, message: String) {
    if !message.is_empty() {
        session.append_user(message);
    }
}

fn structured_request(message: &str, schema: &Value) -> String {
    let instruction = format!(
        "Respond with a single JSON value that conforms to this JSON Schema and nothing else:\n{}",
        schema
    );
    if message.is_empty() {
        instruction
    } else {
        format!("{}\n\n{}", message, instruction)
    }
}

/// Decode a structured reply, tolerating a surrounding Markdown code fence.
fn decode_structured<T: DeserializeOwned>(reply: &str, schema: &Value) -> Result<T> {
    let body = strip_code_fence(reply);
    let value: Value = serde_json::from_str(body).map_err(|e| {
        debug!(error = %e, "Structured reply is not JSON");
        WaypointError::StructuredOutput(format!("reply is not valid JSON: {}", e))
    })?;
    waypoint_tools::validate_against_schema(schema, &value)
        .map_err(WaypointError::StructuredOutput)?;
    serde_json::from_value(value).map_err(|e| WaypointError::StructuredOutput(e.to_string()))
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(fenced) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the language tag line
    let body = fenced.split_once('\n').map_or("", |(_, rest)| rest);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("run_id", &self.inner.run_id)
            .field("agent_id", &self.inner.agent_id)
            .field("path", &self.execution.path.to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::strategy::AgentStrategy;
    use serde::Deserialize;
    use serde_json::json;
    use waypoint_test_utils::{test_model, MockExecutor};

    #[derive(Debug, Deserialize, JsonSchema, PartialEq)]
    struct Calculation {
        result: i64,
        operation: String,
    }

    fn calculation_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "result": {"type": "integer"},
                "operation": {"type": "string", "enum": ["add", "sub"]}
            },
            "required": ["result", "operation"]
        })
    }

    fn structured_agent(mock: Arc<MockExecutor>) -> Agent {
        Agent::builder()
            .shared_executor(mock)
            .model(test_model())
            .system_prompt("answer in JSON")
            .strategy(AgentStrategy::functional("structured", |ctx, input| async move {
                let before = ctx.history().await?.len();
                let outcome = ctx
                    .request_llm_structured::<Calculation>(input.text_content(), calculation_schema())
                    .await;
                let after = ctx.history().await?.len();
                Ok(Payload::Text(match outcome {
                    Ok(calc) => format!("{} {} (+{})", calc.operation, calc.result, after - before),
                    Err(e) => format!("{} (+{})", e, after - before),
                }))
            }))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn structured_reply_is_decoded_and_kept() {
        let mock = Arc::new(
            MockExecutor::new().then_text("```json\n{\"result\": 42, \"operation\": \"add\"}\n```"),
        );
        let agent = structured_agent(mock.clone());

        let out = agent.run("Calculate 15 + 27").await.unwrap();
        assert_eq!(out, Payload::Text("add 42 (+2)".into()));

        let call = &mock.calls()[0];
        assert!(call.tools.is_empty());
        let sent = call.prompt.messages.last().unwrap().text();
        assert!(sent.starts_with("Calculate 15 + 27\n\n"));
        assert!(sent.contains("JSON Schema"));
        assert!(sent.contains("\"operation\""));
    }

    #[tokio::test]
    async fn schema_violation_is_rejected_and_rolled_back() {
        let mock = Arc::new(MockExecutor::new().then_text(r#"{"result": 42, "operation": "pow"}"#));
        let out = structured_agent(mock).run("Calculate").await.unwrap();
        let text = out.text_content();
        assert!(text.starts_with("Structured output rejected"), "{}", text);
        assert!(text.contains("pow"), "{}", text);
        assert!(text.ends_with("(+0)"), "{}", text);
    }

    #[tokio::test]
    async fn non_json_reply_is_rejected() {
        let mock = Arc::new(MockExecutor::new().then_text("Sure, the answer is 42."));
        let out = structured_agent(mock).run("Calculate").await.unwrap();
        assert!(out.text_content().contains("not valid JSON"));
    }

    #[tokio::test]
    async fn typed_request_derives_the_schema() {
        let mock = Arc::new(MockExecutor::new().then_text(r#"{"result": 3, "operation": "sub"}"#));
        let agent = Agent::builder()
            .shared_executor(mock.clone())
            .model(test_model())
            .strategy(AgentStrategy::functional("typed", |ctx, _input| async move {
                let calc: Calculation = ctx.request_llm_typed("").await?;
                Ok(Payload::Text(calc.result.to_string()))
            }))
            .build()
            .unwrap();

        assert_eq!(agent.run("").await.unwrap(), Payload::Text("3".into()));
        let sent = mock.calls()[0].prompt.messages.last().unwrap().text();
        assert!(sent.starts_with("Respond with a single JSON value"));
        assert!(sent.contains("\"result\""));
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("```\n[1]\n```\n"), "[1]");
        assert_eq!(strip_code_fence("  {\"a\": 1} "), "{\"a\": 1}");
    }
}
