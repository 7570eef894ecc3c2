//! Strategy graphs: the control flow of an agent as plain data.
//!
//! A strategy is a directed graph of named [`Node`]s joined by [`Edge`]s.
//! Node bodies are async closures over the run's [`AgentContext`]; edges carry
//! a guard and an optional output transform. The executor walks the graph from
//! `__start__`, taking the first matching outgoing edge of every node, until a
//! finish node returns.
//!
//! [`AgentContext`]: crate::context::AgentContext

pub mod edge;
pub mod executor;
pub mod node;
pub mod prebuilt;
pub mod strategy;

pub use edge::{evaluate_condition, Edge, EdgeCondition, EdgeSpec};
pub use node::{node_fn, Node, NodeFn, NodeKind, Subgraph};
pub use prebuilt::{single_run_strategy, tool_loop_strategy, ToolCallMode};
pub use strategy::{StrategyBuilder, StrategyGraph};
