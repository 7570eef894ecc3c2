//! Read/write session arbitration over the prompt, tool and model state of a
//! running agent.
//!
//! Any number of read sessions may run at once; a write session is exclusive.
//! Sessions are re-entrant per state instance: a task already inside a session
//! on the same instance reuses it instead of locking again. The marker lives in
//! a task-local map keyed by instance id, so independent agents never see each
//! other's sessions. Asking for a write session from inside a read session on
//! the same instance fails with [`WaypointError::SessionUpgrade`] instead of
//! deadlocking.
//!
//! A write session works on a private copy of the state. The copy replaces the
//! shared state when the session body returns `Ok`; on `Err` it is discarded.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use waypoint_core::event::{
    EventMeta, EventPipeline, LlmCallCompleted, LlmCallStarting, LlmStreamingCompleted,
    LlmStreamingFailed, LlmStreamingFrameReceived, LlmStreamingStarting,
};
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::execution::ExecutionInfo;
use waypoint_core::traits::LlmExecutor;
use waypoint_core::types::*;

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// The mutable aggregate every LLM call reads and writes.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub prompt: Prompt,
    pub tools: Vec<ToolDescriptor>,
    pub model: LlmModel,
}

impl SessionState {
    pub fn new(prompt: Prompt, tools: Vec<ToolDescriptor>, model: LlmModel) -> Self {
        Self {
            prompt,
            tools,
            model,
        }
    }
}

#[derive(Clone)]
enum ActiveSession {
    Read(Arc<OwnedRwLockReadGuard<SessionState>>),
    Write(Arc<Mutex<SessionState>>),
}

tokio::task_local! {
    static ACTIVE_SESSIONS: HashMap<u64, ActiveSession>;
}

fn active_session(state_id: u64) -> Option<ActiveSession> {
    ACTIVE_SESSIONS
        .try_with(|sessions| sessions.get(&state_id).cloned())
        .ok()
        .flatten()
}

fn sessions_with(state_id: u64, session: ActiveSession) -> HashMap<u64, ActiveSession> {
    let mut sessions = ACTIVE_SESSIONS
        .try_with(|sessions| sessions.clone())
        .unwrap_or_default();
    sessions.insert(state_id, session);
    sessions
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What an LLM call needs besides the session state.
pub(crate) struct LlmDispatch {
    pub(crate) executor: Arc<dyn LlmExecutor>,
    pub(crate) pipeline: Arc<EventPipeline>,
    pub(crate) run_id: String,
    pub(crate) agent_id: String,
    pub(crate) cancel: CancellationToken,
}

impl LlmDispatch {
    /// Drive `fut` unless the run is cancelled first.
    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(WaypointError::Cancelled),
            result = fut => result,
        }
    }
}

/// Handle to one agent's session state.
///
/// Cheap to clone; clones share the same state and lock.
#[derive(Clone)]
pub struct LlmSession {
    id: u64,
    state: Arc<RwLock<SessionState>>,
    dispatch: Arc<LlmDispatch>,
    execution: ExecutionInfo,
}

impl LlmSession {
    pub(crate) fn new(state: SessionState, dispatch: LlmDispatch, execution: ExecutionInfo) -> Self {
        Self {
            id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(RwLock::new(state)),
            dispatch: Arc::new(dispatch),
            execution,
        }
    }

    /// The same state, with events attributed to `execution`.
    pub(crate) fn scoped(&self, execution: ExecutionInfo) -> Self {
        Self {
            execution,
            ..self.clone()
        }
    }

    /// Run `f` with shared access to the state.
    ///
    /// Inside a write session on the same state this is a live view over the
    /// writer's in-progress copy.
    pub async fn read_session<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(ReadSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match active_session(self.id) {
            Some(ActiveSession::Read(guard)) => f(ReadSession::Snapshot(guard)).await,
            Some(ActiveSession::Write(state)) => f(ReadSession::Live(state)).await,
            None => {
                let guard = Arc::new(self.state.clone().read_owned().await);
                let sessions = sessions_with(self.id, ActiveSession::Read(guard.clone()));
                ACTIVE_SESSIONS
                    .scope(sessions, f(ReadSession::Snapshot(guard)))
                    .await
            }
        }
    }

    /// Run `f` with exclusive access to the state.
    pub async fn write_session<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(WriteSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match active_session(self.id) {
            Some(ActiveSession::Write(state)) => f(self.write_handle(state)).await,
            Some(ActiveSession::Read(_)) => {
                warn!(execution = %self.execution.path, "Write session requested inside a read session");
                Err(WaypointError::SessionUpgrade)
            }
            None => {
                let mut guard = self.state.clone().write_owned().await;
                let working = Arc::new(Mutex::new((*guard).clone()));
                let sessions = sessions_with(self.id, ActiveSession::Write(working.clone()));

                let result = ACTIVE_SESSIONS
                    .scope(sessions, f(self.write_handle(working.clone())))
                    .await;

                match &result {
                    Ok(_) => {
                        *guard = lock(&working).clone();
                        debug!(
                            execution = %self.execution.path,
                            messages = guard.prompt.messages.len(),
                            "Write session committed"
                        );
                    }
                    Err(e) => {
                        debug!(execution = %self.execution.path, error = %e, "Write session rolled back");
                    }
                }
                result
            }
        }
    }

    /// Mutate the prompt through the write path.
    pub async fn update_prompt<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Prompt),
    {
        self.write_session(|session| async move {
            session.update_prompt(f);
            Ok(())
        })
        .await
    }

    /// Snapshot of the current state.
    pub async fn snapshot(&self) -> Result<SessionState> {
        self.read_session(|session| async move { Ok(session.snapshot()) })
            .await
    }

    fn write_handle(&self, state: Arc<Mutex<SessionState>>) -> WriteSession {
        WriteSession {
            state,
            dispatch: self.dispatch.clone(),
            execution: self.execution.clone(),
        }
    }
}

impl std::fmt::Debug for LlmSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSession")
            .field("id", &self.id)
            .field("execution", &self.execution.path.to_string())
            .finish()
    }
}

/// Shared view of the state inside a read session.
pub enum ReadSession {
    Snapshot(Arc<OwnedRwLockReadGuard<SessionState>>),
    Live(Arc<Mutex<SessionState>>),
}

impl ReadSession {
    pub fn with<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        match self {
            Self::Snapshot(guard) => f(guard),
            Self::Live(state) => f(&lock(state)),
        }
    }

    pub fn prompt(&self) -> Prompt {
        self.with(|s| s.prompt.clone())
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.with(|s| s.prompt.messages.clone())
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.with(|s| s.tools.clone())
    }

    pub fn model(&self) -> LlmModel {
        self.with(|s| s.model.clone())
    }

    pub fn snapshot(&self) -> SessionState {
        self.with(|s| s.clone())
    }
}

/// Exclusive handle inside a write session.
///
/// Mutators lock the working copy only for the duration of the call, never
/// across an await.
pub struct WriteSession {
    state: Arc<Mutex<SessionState>>,
    dispatch: Arc<LlmDispatch>,
    execution: ExecutionInfo,
}

impl WriteSession {
    pub fn with<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&lock(&self.state))
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut lock(&self.state))
    }

    pub fn prompt(&self) -> Prompt {
        self.with(|s| s.prompt.clone())
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.with(|s| s.prompt.messages.clone())
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.with(|s| s.tools.clone())
    }

    pub fn model(&self) -> LlmModel {
        self.with(|s| s.model.clone())
    }

    pub fn snapshot(&self) -> SessionState {
        self.with(|s| s.clone())
    }

    pub fn update_prompt(&self, f: impl FnOnce(&mut Prompt)) {
        self.with_mut(|s| f(&mut s.prompt));
    }

    pub fn append(&self, message: ChatMessage) {
        self.with_mut(|s| s.prompt.push(message));
    }

    pub fn append_user(&self, text: impl Into<String>) {
        self.append(ChatMessage::user(text));
    }

    pub fn set_prompt(&self, prompt: Prompt) {
        self.with_mut(|s| s.prompt = prompt);
    }

    pub fn set_tools(&self, tools: Vec<ToolDescriptor>) {
        self.with_mut(|s| s.tools = tools);
    }

    pub fn set_model(&self, model: LlmModel) {
        self.with_mut(|s| s.model = model);
    }

    /// Persistently change the tool-choice constraint of the prompt.
    pub fn set_tool_choice(&self, choice: Option<ToolChoice>) {
        self.with_mut(|s| s.prompt.params.tool_choice = choice);
    }

    fn meta(&self) -> EventMeta {
        EventMeta::now(
            self.dispatch.run_id.clone(),
            self.dispatch.agent_id.clone(),
            self.execution.clone(),
        )
    }

    /// Prepare the outgoing request: transformed prompt, model and tool list.
    fn outgoing(&self, choice: Option<ToolChoice>, with_tools: bool) -> (Prompt, LlmModel, Vec<ToolDescriptor>) {
        let (mut prompt, model, tools) = self.with(|s| {
            let tools = if with_tools { s.tools.clone() } else { Vec::new() };
            (s.prompt.clone(), s.model.clone(), tools)
        });
        if let Some(choice) = choice {
            prompt.params.tool_choice = Some(choice);
        }
        let prompt = self.dispatch.pipeline.transform(&self.meta(), prompt);
        (prompt, model, tools)
    }

    async fn send(&self, choice: Option<ToolChoice>, with_tools: bool) -> Result<Vec<ChatMessage>> {
        let (prompt, model, tools) = self.outgoing(choice, with_tools);
        let pipeline = &self.dispatch.pipeline;

        pipeline.emit(
            self.meta(),
            LlmCallStarting {
                prompt: prompt.clone(),
                model: model.clone(),
                tools: tools.clone(),
            },
        );
        debug!(model = %model, tools = tools.len(), messages = prompt.messages.len(), "LLM request");

        let responses = self
            .dispatch
            .cancellable(
                self.dispatch
                    .executor
                    .execute(prompt.clone(), model.clone(), tools.clone()),
            )
            .await?;

        pipeline.emit(
            self.meta(),
            LlmCallCompleted {
                prompt,
                model,
                tools,
                responses: responses.clone(),
            },
        );

        self.with_mut(|s| {
            for response in &responses {
                s.prompt.push(response.clone());
            }
        });
        Ok(responses)
    }

    fn first(responses: Vec<ChatMessage>) -> Result<ChatMessage> {
        responses
            .into_iter()
            .next()
            .ok_or_else(|| WaypointError::LlmRequest("Backend returned no messages".into()))
    }

    /// Send the history with the active tools; append and return the reply.
    pub async fn request_llm(&self) -> Result<ChatMessage> {
        Self::first(self.send(None, true).await?)
    }

    /// Send the history with no tools offered.
    pub async fn request_llm_without_tools(&self) -> Result<ChatMessage> {
        Self::first(self.send(None, false).await?)
    }

    /// Send the history requiring the model to call some tool.
    pub async fn request_llm_only_calling_tools(&self) -> Result<ChatMessage> {
        Self::first(self.send(Some(ToolChoice::Required), true).await?)
    }

    /// Send the history requiring the model to call `tool`.
    pub async fn request_llm_force_one_tool(&self, tool: &str) -> Result<ChatMessage> {
        if !self.with(|s| s.tools.iter().any(|t| t.name == tool)) {
            return Err(WaypointError::ToolNotFound(tool.to_string()));
        }
        Self::first(
            self.send(Some(ToolChoice::Named(tool.to_string())), true)
                .await?,
        )
    }

    /// Like [`request_llm`](Self::request_llm) but returns every message.
    pub async fn request_llm_multiple(&self) -> Result<Vec<ChatMessage>> {
        self.send(None, true).await
    }

    /// Stream a reply, report each frame and append the assembled message.
    ///
    /// `LlmStreamingCompleted` fires once the attempt is over, after
    /// `LlmStreamingFailed` on the error path.
    pub async fn request_llm_streaming(
        &self,
        on_frame: Option<&(dyn Fn(&StreamFrame) + Send + Sync)>,
    ) -> Result<ChatMessage> {
        let (prompt, model, tools) = self.outgoing(None, true);
        let pipeline = &self.dispatch.pipeline;

        pipeline.emit(
            self.meta(),
            LlmStreamingStarting {
                prompt: prompt.clone(),
                model: model.clone(),
                tools: tools.clone(),
            },
        );

        let collected: Result<Vec<StreamFrame>> = async {
            let dispatch = &self.dispatch;
            let mut stream = dispatch
                .cancellable(
                    dispatch
                        .executor
                        .execute_streaming(prompt.clone(), model.clone(), tools),
                )
                .await?;
            let mut frames = Vec::new();
            loop {
                let next = dispatch
                    .cancellable(async { Ok::<_, WaypointError>(stream.next().await) })
                    .await?;
                let Some(frame) = next else { break };
                let frame = frame?;
                pipeline.emit(self.meta(), LlmStreamingFrameReceived { frame: frame.clone() });
                if let Some(callback) = on_frame {
                    callback(&frame);
                }
                let done = matches!(frame, StreamFrame::End { .. });
                frames.push(frame);
                if done {
                    break;
                }
            }
            Ok(frames)
        }
        .await;

        match collected {
            Ok(frames) => {
                pipeline.emit(self.meta(), LlmStreamingCompleted { prompt, model });
                let message = assemble_frames(&frames);
                self.append(message.clone());
                Ok(message)
            }
            Err(e) => {
                warn!(model = %model, error = %e, "LLM stream failed");
                pipeline.emit(self.meta(), LlmStreamingFailed { error: e.to_string() });
                pipeline.emit(self.meta(), LlmStreamingCompleted { prompt, model });
                Err(e)
            }
        }
    }

    /// Run the backend's moderation check on the current prompt.
    pub async fn moderate(&self) -> Result<ModerationResult> {
        let (prompt, model, _) = self.outgoing(None, false);
        self.dispatch
            .cancellable(self.dispatch.executor.moderate(prompt, model))
            .await
    }
}

/// Fold streamed frames into one assistant message: text first, then calls.
pub fn assemble_frames(frames: &[StreamFrame]) -> ChatMessage {
    let mut text = String::new();
    let mut calls = Vec::new();
    for frame in frames {
        match frame {
            StreamFrame::Append { text: chunk } => text.push_str(chunk),
            StreamFrame::ToolCall {
                id,
                name,
                arguments,
            } => calls.push(ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            }),
            StreamFrame::End { .. } => {}
        }
    }

    let mut content = Vec::with_capacity(calls.len() + 1);
    if !text.is_empty() || calls.is_empty() {
        content.push(ContentBlock::Text { text });
    }
    content.extend(calls);
    ChatMessage {
        role: Role::Assistant,
        content,
        timestamp: Some(chrono::Utc::now()),
    }
}
