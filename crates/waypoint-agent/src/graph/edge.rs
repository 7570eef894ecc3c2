use std::sync::Arc;

use serde::{Deserialize, Serialize};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::payload::Payload;

pub type EdgePredicate = Arc<dyn Fn(&Payload) -> Result<bool> + Send + Sync>;
pub type EdgeTransform = Arc<dyn Fn(Payload) -> Payload + Send + Sync>;

/// Declarative condition for traversing an edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Always traverse this edge.
    #[default]
    Always,
    /// The output requests at least one tool call.
    OnToolCall,
    /// The output requests a call to this specific tool.
    OnToolCallNamed { tool: String },
    /// The output is a plain assistant reply.
    OnAssistantMessage,
    /// The output is a tool result (or batch) with no failures.
    OnToolSuccess,
    /// The output is a tool result (or batch) with at least one failure.
    OnToolFailure,
    /// A text expression over the output.
    /// Supported: `contains "x"`, `== "x"`, `!= "x"`, optionally prefixed
    /// with `output`.
    Expr { expr: String },
}

impl EdgeCondition {
    pub fn evaluate(&self, payload: &Payload) -> Result<bool> {
        Ok(match self {
            Self::Always => true,
            Self::OnToolCall => payload.is_tool_call(),
            Self::OnToolCallNamed { tool } => payload.tool_calls().iter().any(|c| &c.tool == tool),
            Self::OnAssistantMessage => payload.is_assistant_message(),
            Self::OnToolSuccess => match payload {
                Payload::ToolResult(r) => r.is_success(),
                Payload::ToolResults(rs) => rs.iter().all(|r| r.is_success()),
                _ => false,
            },
            Self::OnToolFailure => match payload {
                Payload::ToolResult(r) => !r.is_success(),
                Payload::ToolResults(rs) => rs.iter().any(|r| !r.is_success()),
                _ => false,
            },
            Self::Expr { expr } => evaluate_condition(expr, &payload.text_content())?,
        })
    }
}

#[derive(Clone)]
pub enum Guard {
    Condition(EdgeCondition),
    Predicate(EdgePredicate),
}

/// A directed connection between two nodes.
///
/// Outgoing edges of a node are tried in declaration order; the first whose
/// guard accepts the node's output is taken.
#[derive(Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub guard: Guard,
    pub transform: Option<EdgeTransform>,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::when(from, to, EdgeCondition::Always)
    }

    /// Create an edge guarded by a declarative condition.
    pub fn when(from: impl Into<String>, to: impl Into<String>, condition: EdgeCondition) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: Guard::Condition(condition),
            transform: None,
        }
    }

    /// Create an edge guarded by a closure.
    pub fn when_fn<F>(from: impl Into<String>, to: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Payload) -> bool + Send + Sync + 'static,
    {
        Self::try_when(from, to, move |p| Ok(predicate(p)))
    }

    /// Create an edge guarded by a fallible closure. An error fails the
    /// source node.
    pub fn try_when<F>(from: impl Into<String>, to: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Payload) -> Result<bool> + Send + Sync + 'static,
    {
        Self {
            from: from.into(),
            to: to.into(),
            guard: Guard::Predicate(Arc::new(predicate)),
            transform: None,
        }
    }

    /// Rewrite the output before it becomes the next node's input.
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Payload) -> Payload + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Tool-call edge that forwards the first requested call.
    pub fn on_tool_call(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::when(from, to, EdgeCondition::OnToolCall).with_transform(|p| match p.tool_call() {
            Some(call) => Payload::ToolCall(call),
            None => p,
        })
    }

    /// Tool-call edge that forwards every requested call.
    pub fn on_tool_calls(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::when(from, to, EdgeCondition::OnToolCall)
            .with_transform(|p| Payload::ToolCalls(p.tool_calls()))
    }

    /// Edge taken when the model calls `tool`; forwards that call.
    pub fn on_tool_call_named(
        from: impl Into<String>,
        to: impl Into<String>,
        tool: impl Into<String>,
    ) -> Self {
        let tool = tool.into();
        let wanted = tool.clone();
        Self::when(from, to, EdgeCondition::OnToolCallNamed { tool }).with_transform(move |p| {
            match p.tool_calls().into_iter().find(|c| c.tool == wanted) {
                Some(call) => Payload::ToolCall(call),
                None => p,
            }
        })
    }

    /// Assistant-reply edge that forwards the reply text.
    pub fn on_assistant_message(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::when(from, to, EdgeCondition::OnAssistantMessage)
            .with_transform(|p| Payload::Text(p.text_content()))
    }

    pub fn on_tool_success(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::when(from, to, EdgeCondition::OnToolSuccess)
    }

    pub fn on_tool_failure(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::when(from, to, EdgeCondition::OnToolFailure)
    }

    /// Create an edge guarded by a text expression.
    pub fn on_condition(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self::when(from, to, EdgeCondition::Expr { expr: expr.into() })
    }

    /// Whether this edge accepts `output`.
    pub fn matches(&self, output: &Payload) -> Result<bool> {
        match &self.guard {
            Guard::Predicate(predicate) => predicate(output),
            Guard::Condition(condition) => {
                condition
                    .evaluate(output)
                    .map_err(|e| WaypointError::EdgePredicate {
                        from: self.from.clone(),
                        to: self.to.clone(),
                        message: e.to_string(),
                    })
            }
        }
    }

    /// Produce the next node's input.
    pub fn apply(&self, output: Payload) -> Payload {
        match &self.transform {
            Some(transform) => transform(output),
            None => output,
        }
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = match &self.guard {
            Guard::Condition(c) => format!("{:?}", c),
            Guard::Predicate(_) => "<predicate>".to_string(),
        };
        f.debug_struct("Edge")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("guard", &guard)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

/// Serializable edge description, as produced by a declarative graph format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: EdgeCondition,
}

impl From<EdgeSpec> for Edge {
    fn from(spec: EdgeSpec) -> Self {
        Edge::when(spec.from, spec.to, spec.condition)
    }
}

/// Evaluate a text expression against `text`.
///
/// Supported expressions:
/// - `contains "substr"`: substring match
/// - `!= "value"`: not equal
/// - `== "value"`: exact match
///
/// The left-hand side may be empty or `output`. The operand must be a
/// double-quoted string and is taken verbatim, so operator words inside the
/// quotes have no effect. Anything else is an error.
pub fn evaluate_condition(expr: &str, text: &str) -> Result<bool> {
    let trimmed = expr.trim();
    let rest = trimmed.strip_prefix("output").unwrap_or(trimmed).trim_start();

    let unparseable = || {
        WaypointError::NodeFailure(format!("Unparseable edge condition: {}", trimmed))
    };
    let (op, operand) = leading_operator(rest).ok_or_else(unparseable)?;
    let value = quoted(operand).ok_or_else(unparseable)?;

    Ok(match op {
        Operator::Contains => text.contains(value),
        Operator::NotEquals => text != value,
        Operator::Equals => text == value,
    })
}

#[derive(Clone, Copy)]
enum Operator {
    Contains,
    NotEquals,
    Equals,
}

/// Split an operator off the start of `rest`.
fn leading_operator(rest: &str) -> Option<(Operator, &str)> {
    [
        ("contains", Operator::Contains),
        ("!=", Operator::NotEquals),
        ("==", Operator::Equals),
    ]
    .into_iter()
    .find_map(|(token, op)| rest.strip_prefix(token).map(|operand| (op, operand)))
}

/// The inside of a `"..."` literal, or `None` if `operand` is not one.
fn quoted(operand: &str) -> Option<&str> {
    operand
        .trim()
        .strip_prefix('"')?
        .strip_suffix('"')
}
