//! Waypoint: build LLM agents as strategy graphs.
//!
//! An [`Agent`] walks a [`StrategyGraph`] of async nodes. Nodes talk to the
//! model through arbitrated read/write sessions, dispatch tool calls through a
//! shared [`ToolRegistry`], and every step is reported on a typed lifecycle
//! event pipeline that [`Feature`]s subscribe to.
//!
//! ```ignore
//! let agent = Agent::builder()
//!     .executor(my_backend)
//!     .model(LlmModel::new("openai", "gpt-4o"))
//!     .tools(ToolRegistry::new().with(my_tool)?)
//!     .strategy(single_run_strategy(false)?)
//!     .install(EventLogger)
//!     .build()?;
//! let answer = agent.run("What is 2 + 2?").await?;
//! ```

pub use waypoint_agent as agent;
pub use waypoint_core as core;
pub use waypoint_llm as llm;
pub use waypoint_tools as tools;

pub use waypoint_agent::graph::{self, prebuilt};
pub use waypoint_agent::{
    single_run_strategy, tool_loop_strategy, Agent, AgentBuilder, AgentCheckpoint, AgentContext,
    AgentState, AgentStrategy, Edge, EdgeCondition, EdgeSpec, EventHandler, EventLogger,
    LlmSession, Node, ReadSession, StrategyBuilder, StrategyGraph, Subtask, ToolCallMode,
    ToolEnvironment, WriteSession,
};
pub use waypoint_core::config::{AgentConfig, AppConfig, ModelConfig, RetryConfig};
pub use waypoint_core::event::{EventKind, EventMeta, EventPipeline, Feature, LifecycleEvent};
pub use waypoint_core::traits::{LlmExecutor, Tool};
pub use waypoint_core::{ExecutionInfo, Payload, Result, WaypointError};
pub use waypoint_llm::{with_retries, RetryingExecutor};
pub use waypoint_tools::{schema_of, validate_against_schema, FnTool, ToolRegistry};
