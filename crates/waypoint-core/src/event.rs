//! Lifecycle event pipeline.
//!
//! Every major operation (agent run, strategy run, node, subgraph, LLM call,
//! streaming frame, tool call) emits a typed record before and after it runs.
//! Handlers are registered per event kind and fire synchronously, in
//! registration order, before the producing operation moves on. Handlers
//! observe; they cannot veto or rewrite an event. The one bidirectional hook is
//! the prompt transformer chain, applied to every outgoing prompt.
//!
//! Async consumers may additionally [`subscribe`](EventPipeline::subscribe) to
//! a broadcast tap that carries the same events after the handlers ran.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::ExecutionInfo;
use crate::payload::Payload;
use crate::types::{ChatMessage, LlmModel, Prompt, StreamFrame, ToolCall, ToolDescriptor};

/// Correlation data attached to every emitted event.
#[derive(Debug, Clone)]
pub struct EventMeta {
    pub run_id: String,
    pub agent_id: String,
    pub execution: ExecutionInfo,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn now(run_id: impl Into<String>, agent_id: impl Into<String>, execution: ExecutionInfo) -> Self {
        Self {
            run_id: run_id.into(),
            agent_id: agent_id.into(),
            execution,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentStarting {
    pub strategy: String,
    pub input: Payload,
}

#[derive(Debug, Clone)]
pub struct AgentCompleted {
    pub strategy: String,
    pub result: Payload,
}

#[derive(Debug, Clone)]
pub struct AgentFailed {
    pub strategy: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct AgentClosing;

#[derive(Debug, Clone)]
pub struct StrategyStarting {
    pub strategy: String,
}

#[derive(Debug, Clone)]
pub struct StrategyCompleted {
    pub strategy: String,
    pub result: Payload,
}

#[derive(Debug, Clone)]
pub struct NodeStarting {
    pub node: String,
    pub input: Payload,
}

#[derive(Debug, Clone)]
pub struct NodeCompleted {
    pub node: String,
    pub input: Payload,
    pub output: Payload,
}

#[derive(Debug, Clone)]
pub struct NodeFailed {
    pub node: String,
    pub input: Payload,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct SubgraphStarting {
    pub subgraph: String,
    pub input: Payload,
}

#[derive(Debug, Clone)]
pub struct SubgraphCompleted {
    pub subgraph: String,
    pub input: Payload,
    pub output: Payload,
}

#[derive(Debug, Clone)]
pub struct SubgraphFailed {
    pub subgraph: String,
    pub input: Payload,
    pub error: String,
}

/// Carries the prompt exactly as it is sent, after all transformers ran.
#[derive(Debug, Clone)]
pub struct LlmCallStarting {
    pub prompt: Prompt,
    pub model: LlmModel,
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Clone)]
pub struct LlmCallCompleted {
    pub prompt: Prompt,
    pub model: LlmModel,
    pub tools: Vec<ToolDescriptor>,
    pub responses: Vec<ChatMessage>,
}

#[derive(Debug, Clone)]
pub struct LlmStreamingStarting {
    pub prompt: Prompt,
    pub model: LlmModel,
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Clone)]
pub struct LlmStreamingFrameReceived {
    pub frame: StreamFrame,
}

#[derive(Debug, Clone)]
pub struct LlmStreamingFailed {
    pub error: String,
}

/// The streaming attempt is over. Fires after [`LlmStreamingFailed`] too.
#[derive(Debug, Clone)]
pub struct LlmStreamingCompleted {
    pub prompt: Prompt,
    pub model: LlmModel,
}

#[derive(Debug, Clone)]
pub struct ToolCallStarting {
    pub call: ToolCall,
}

#[derive(Debug, Clone)]
pub struct ToolCallCompleted {
    pub call: ToolCall,
    pub result: String,
}

#[derive(Debug, Clone)]
pub struct ToolCallFailed {
    pub call: ToolCall,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ToolValidationFailed {
    pub call: ToolCall,
    pub error: String,
}

/// A record type that can be extracted from a [`LifecycleEvent`].
pub trait EventRecord: Sized + Send + Sync + 'static {
    const KIND: EventKind;

    fn extract(event: &LifecycleEvent) -> Option<&Self>;
}

macro_rules! lifecycle_events {
    ($($name:ident),* $(,)?) => {
        /// One variant per event kind, each carrying its record.
        #[derive(Debug, Clone)]
        pub enum LifecycleEvent {
            $($name($name)),*
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum EventKind {
            $($name),*
        }

        impl LifecycleEvent {
            pub fn kind(&self) -> EventKind {
                match self {
                    $(Self::$name(_) => EventKind::$name),*
                }
            }
        }

        $(
            impl EventRecord for $name {
                const KIND: EventKind = EventKind::$name;

                fn extract(event: &LifecycleEvent) -> Option<&Self> {
                    match event {
                        LifecycleEvent::$name(e) => Some(e),
                        _ => None,
                    }
                }
            }

            impl From<$name> for LifecycleEvent {
                fn from(e: $name) -> Self {
                    Self::$name(e)
                }
            }
        )*
    };
}

lifecycle_events!(
    AgentStarting,
    AgentCompleted,
    AgentFailed,
    AgentClosing,
    StrategyStarting,
    StrategyCompleted,
    NodeStarting,
    NodeCompleted,
    NodeFailed,
    SubgraphStarting,
    SubgraphCompleted,
    SubgraphFailed,
    LlmCallStarting,
    LlmCallCompleted,
    LlmStreamingStarting,
    LlmStreamingFrameReceived,
    LlmStreamingFailed,
    LlmStreamingCompleted,
    ToolCallStarting,
    ToolCallCompleted,
    ToolCallFailed,
    ToolValidationFailed,
);

/// An emitted event together with its correlation data.
#[derive(Debug, Clone)]
pub struct Event {
    pub meta: EventMeta,
    pub event: LifecycleEvent,
}

type Handler = Arc<dyn Fn(&EventMeta, &LifecycleEvent) + Send + Sync>;
type Filter = Arc<dyn Fn(&EventMeta, &LifecycleEvent) -> bool + Send + Sync>;
type PromptTransformer = Arc<dyn Fn(&EventMeta, Prompt) -> Prompt + Send + Sync>;

/// Ordered multi-subscriber dispatch table for lifecycle events.
///
/// Registration takes `&mut self`; once built, the pipeline is shared behind an
/// `Arc` and never changes for the duration of a run.
pub struct EventPipeline {
    handlers: Vec<(Option<EventKind>, Handler)>,
    filter: Option<Filter>,
    transformers: Vec<PromptTransformer>,
    tx: tokio::sync::broadcast::Sender<Arc<Event>>,
}

impl EventPipeline {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self {
            handlers: Vec::new(),
            filter: None,
            transformers: Vec::new(),
            tx,
        }
    }

    /// Register a handler for one event kind.
    pub fn on<T, F>(&mut self, handler: F) -> &mut Self
    where
        T: EventRecord,
        F: Fn(&EventMeta, &T) + Send + Sync + 'static,
    {
        let wrapped: Handler = Arc::new(move |meta, event| {
            if let Some(record) = T::extract(event) {
                handler(meta, record);
            }
        });
        self.handlers.push((Some(T::KIND), wrapped));
        self
    }

    /// Register a handler that sees every event.
    pub fn on_any<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&EventMeta, &LifecycleEvent) + Send + Sync + 'static,
    {
        self.handlers.push((None, Arc::new(handler)));
        self
    }

    /// Install a filter; events it rejects are not delivered to anyone.
    pub fn set_filter<F>(&mut self, filter: F) -> &mut Self
    where
        F: Fn(&EventMeta, &LifecycleEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Append a prompt transformer to the chain.
    pub fn transform_prompt<F>(&mut self, transformer: F) -> &mut Self
    where
        F: Fn(&EventMeta, Prompt) -> Prompt + Send + Sync + 'static,
    {
        self.transformers.push(Arc::new(transformer));
        self
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Deliver an event to all matching handlers, then to broadcast subscribers.
    pub fn emit(&self, meta: EventMeta, event: impl Into<LifecycleEvent>) {
        let event = event.into();

        if let Some(filter) = &self.filter {
            if !filter(&meta, &event) {
                tracing::trace!(kind = ?event.kind(), "Event filtered out");
                return;
            }
        }

        let kind = event.kind();
        for (wanted, handler) in &self.handlers {
            if wanted.map_or(true, |k| k == kind) {
                handler(&meta, &event);
            }
        }

        if self.tx.receiver_count() > 0 {
            // Ignore error if all receivers dropped in between
            let _ = self.tx.send(Arc::new(Event { meta, event }));
        }
    }

    /// Run the prompt through every transformer in registration order.
    pub fn transform(&self, meta: &EventMeta, prompt: Prompt) -> Prompt {
        self.transformers
            .iter()
            .fold(prompt, |prompt, transformer| transformer(meta, prompt))
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Arc<Event>> {
        self.tx.subscribe()
    }
}

/// A pluggable observer that registers handlers on an agent's pipeline.
pub trait Feature: Send + Sync {
    fn name(&self) -> &str;

    fn install(&self, pipeline: &mut EventPipeline);
}

impl Default for EventPipeline {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPipeline")
            .field("handlers", &self.handlers.len())
            .field("filter", &self.filter.is_some())
            .field("transformers", &self.transformers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn meta() -> EventMeta {
        EventMeta::now("run", "agent", ExecutionInfo::root("agent"))
    }

    fn node_starting(name: &str) -> NodeStarting {
        NodeStarting {
            node: name.into(),
            input: Payload::Empty,
        }
    }

    #[test]
    fn handlers_fire_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = EventPipeline::default();
        for i in 0..3 {
            let log = log.clone();
            pipeline.on::<NodeStarting, _>(move |_, e| {
                log.lock().unwrap().push(format!("{}:{}", i, e.node));
            });
        }

        pipeline.emit(meta(), node_starting("a"));
        assert_eq!(*log.lock().unwrap(), vec!["0:a", "1:a", "2:a"]);
    }

    #[test]
    fn typed_handlers_only_see_their_kind() {
        let count = Arc::new(Mutex::new(0));
        let mut pipeline = EventPipeline::default();
        let c = count.clone();
        pipeline.on::<NodeCompleted, _>(move |_, _| *c.lock().unwrap() += 1);

        pipeline.emit(meta(), node_starting("a"));
        assert_eq!(*count.lock().unwrap(), 0);
        pipeline.emit(
            meta(),
            NodeCompleted {
                node: "a".into(),
                input: Payload::Empty,
                output: Payload::Empty,
            },
        );
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn filter_suppresses_whole_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = EventPipeline::default();
        let s = seen.clone();
        pipeline.on_any(move |_, e| s.lock().unwrap().push(e.kind()));
        pipeline.set_filter(|_, e| e.kind() != EventKind::NodeStarting);

        pipeline.emit(meta(), node_starting("a"));
        pipeline.emit(meta(), StrategyStarting { strategy: "s".into() });
        assert_eq!(*seen.lock().unwrap(), vec![EventKind::StrategyStarting]);
    }

    #[test]
    fn transformers_chain_in_order() {
        let mut pipeline = EventPipeline::default();
        pipeline.transform_prompt(|_, p| p.system("first"));
        pipeline.transform_prompt(|_, p| {
            assert_eq!(p.messages.len(), 1);
            p.user("second")
        });

        let out = pipeline.transform(&meta(), Prompt::new("p"));
        let texts: Vec<_> = out.messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn broadcast_tap_receives_events() {
        let pipeline = EventPipeline::new(8);
        let mut rx = pipeline.subscribe();
        pipeline.emit(meta(), node_starting("tap"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event.kind(), EventKind::NodeStarting);
        assert_eq!(event.meta.run_id, "run");
    }
}
