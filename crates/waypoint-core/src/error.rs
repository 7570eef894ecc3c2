use thiserror::Error;

#[derive(Debug, Error)]
pub enum WaypointError {
    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM moderation failed: {0}")]
    Moderation(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    #[error("Structured output rejected: {0}")]
    StructuredOutput(String),

    // Graph errors
    #[error("Node failed: {0}")]
    NodeFailure(String),

    #[error("No matching edge out of node '{node}' for output {output}")]
    NoMatchingEdge { node: String, output: String },

    #[error("Node '{0}' not found in graph")]
    NodeNotFound(String),

    #[error("Invalid strategy graph '{graph}': {reason}")]
    InvalidGraph { graph: String, reason: String },

    #[error("Edge predicate failed on '{from}' -> '{to}': {message}")]
    EdgePredicate {
        from: String,
        to: String,
        message: String,
    },

    // Agent errors
    #[error("Cannot open a write session from inside a read session on the same state")]
    SessionUpgrade,

    #[error("Agent exceeded max iterations ({0})")]
    MaxIterationsExceeded(usize),

    #[error("Agent cancelled")]
    Cancelled,

    #[error("Agent {0} is already running")]
    AlreadyRunning(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WaypointError {
    /// Whether a tool dispatch should fold this error into a failure result
    /// instead of propagating it to the graph.
    pub fn is_tool_failure(&self) -> bool {
        matches!(
            self,
            Self::ToolNotFound(_)
                | Self::ToolExecution { .. }
                | Self::ToolTimeout { .. }
                | Self::ToolValidation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WaypointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_failures_are_classified() {
        assert!(WaypointError::ToolNotFound("x".into()).is_tool_failure());
        assert!(WaypointError::ToolValidation("bad".into()).is_tool_failure());
        assert!(!WaypointError::Cancelled.is_tool_failure());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert!(!WaypointError::from(io).is_tool_failure());
    }

    #[test]
    fn no_matching_edge_names_the_node() {
        let err = WaypointError::NoMatchingEdge {
            node: "classify".into(),
            output: "Text(\"?\")".into(),
        };
        assert!(err.to_string().contains("'classify'"));
    }
}
