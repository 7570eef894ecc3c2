//! Built-in features: typed lifecycle callbacks and a tracing logger.

use std::sync::Arc;

use tracing::{debug, info, warn};

use waypoint_core::event::*;
use waypoint_core::types::Prompt;

type Registration = Box<dyn Fn(&mut EventPipeline) + Send + Sync>;

/// Collects typed `on_*` callbacks and prompt transformers and installs them
/// on an agent's pipeline.
#[derive(Default)]
pub struct EventHandler {
    registrations: Vec<Registration>,
}

macro_rules! on_methods {
    ($($method:ident => $record:ident),* $(,)?) => {
        $(
            pub fn $method<F>(self, f: F) -> Self
            where
                F: Fn(&EventMeta, &$record) + Send + Sync + 'static,
            {
                self.on::<$record, F>(f)
            }
        )*
    };
}

impl EventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for any record type.
    pub fn on<T, F>(mut self, f: F) -> Self
    where
        T: EventRecord,
        F: Fn(&EventMeta, &T) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.registrations.push(Box::new(move |pipeline| {
            let f = f.clone();
            pipeline.on::<T, _>(move |meta, record| f(meta, record));
        }));
        self
    }

    on_methods!(
        on_agent_starting => AgentStarting,
        on_agent_completed => AgentCompleted,
        on_agent_failed => AgentFailed,
        on_agent_closing => AgentClosing,
        on_strategy_starting => StrategyStarting,
        on_strategy_completed => StrategyCompleted,
        on_node_starting => NodeStarting,
        on_node_completed => NodeCompleted,
        on_node_failed => NodeFailed,
        on_subgraph_starting => SubgraphStarting,
        on_subgraph_completed => SubgraphCompleted,
        on_subgraph_failed => SubgraphFailed,
        on_llm_call_starting => LlmCallStarting,
        on_llm_call_completed => LlmCallCompleted,
        on_llm_streaming_starting => LlmStreamingStarting,
        on_llm_streaming_frame => LlmStreamingFrameReceived,
        on_llm_streaming_failed => LlmStreamingFailed,
        on_llm_streaming_completed => LlmStreamingCompleted,
        on_tool_call_starting => ToolCallStarting,
        on_tool_call_completed => ToolCallCompleted,
        on_tool_call_failed => ToolCallFailed,
        on_tool_validation_failed => ToolValidationFailed,
    );

    /// Rewrite every outgoing prompt. Runs after transformers registered
    /// earlier.
    pub fn transform_prompt<F>(mut self, f: F) -> Self
    where
        F: Fn(&EventMeta, Prompt) -> Prompt + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.registrations.push(Box::new(move |pipeline| {
            let f = f.clone();
            pipeline.transform_prompt(move |meta, prompt| f(meta, prompt));
        }));
        self
    }
}

impl Feature for EventHandler {
    fn name(&self) -> &str {
        "event-handler"
    }

    fn install(&self, pipeline: &mut EventPipeline) {
        for register in &self.registrations {
            register(pipeline);
        }
    }
}

/// Mirrors the lifecycle into `tracing` at info/debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventLogger;

impl Feature for EventLogger {
    fn name(&self) -> &str {
        "event-logger"
    }

    fn install(&self, pipeline: &mut EventPipeline) {
        pipeline.on_any(|meta, event| match event {
            LifecycleEvent::AgentStarting(e) => {
                info!(run_id = %meta.run_id, strategy = %e.strategy, "Agent starting")
            }
            LifecycleEvent::AgentCompleted(e) => {
                info!(run_id = %meta.run_id, strategy = %e.strategy, "Agent completed")
            }
            LifecycleEvent::AgentFailed(e) => {
                warn!(run_id = %meta.run_id, strategy = %e.strategy, error = %e.error, "Agent failed")
            }
            LifecycleEvent::NodeFailed(e) => {
                warn!(run_id = %meta.run_id, path = %meta.execution.path, node = %e.node, error = %e.error, "Node failed")
            }
            LifecycleEvent::ToolCallFailed(e) => {
                warn!(run_id = %meta.run_id, tool = %e.call.tool, error = %e.error, "Tool call failed")
            }
            other => debug!(run_id = %meta.run_id, path = %meta.execution.path, kind = ?other.kind(), "Lifecycle event"),
        });
    }
}
