pub mod agent;
pub mod checkpoint;
pub mod context;
pub mod environment;
pub mod feature;
pub mod graph;
pub mod session;
pub mod strategy;
pub mod subtask;

pub use agent::{Agent, AgentBuilder, AgentState};
pub use checkpoint::AgentCheckpoint;
pub use context::AgentContext;
pub use environment::ToolEnvironment;
pub use feature::{EventHandler, EventLogger};
pub use graph::{
    single_run_strategy, tool_loop_strategy, Edge, EdgeCondition, EdgeSpec, Node, NodeKind,
    StrategyBuilder, StrategyGraph, ToolCallMode,
};
pub use session::{assemble_frames, LlmSession, ReadSession, SessionState, WriteSession};
pub use strategy::AgentStrategy;
pub use subtask::Subtask;
