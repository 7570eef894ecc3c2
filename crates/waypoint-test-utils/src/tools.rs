use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::Tool;
use waypoint_core::types::{ToolContext, ToolResult};

/// Integer calculator: `{"op": "add"|"sub"|"mul"|"div", "a": i64, "b": i64}`.
///
/// An optional delay makes completion order differ from call order.
pub struct CalculatorTool {
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl CalculatorTool {
    pub fn new() -> Self {
        Self {
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared counter of executions.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Default for CalculatorTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Apply an arithmetic operation to two integers"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "op": {"type": "string"},
                "a": {"type": "integer"},
                "b": {"type": "integer"},
                "delay_ms": {"type": "integer"}
            },
            "required": ["op", "a", "b"]
        })
    }

    fn execute(
        &self,
        args: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let per_call = args["delay_ms"].as_u64().map(Duration::from_millis);
            if let Some(delay) = per_call.or(self.delay) {
                tokio::time::sleep(delay).await;
            }

            let a = args["a"].as_i64().unwrap_or_default();
            let b = args["b"].as_i64().unwrap_or_default();
            let value = match args["op"].as_str().unwrap_or_default() {
                "add" => a + b,
                "sub" => a - b,
                "mul" => a * b,
                "div" if b == 0 => return Ok(ToolResult::error("division by zero")),
                "div" => a / b,
                other => {
                    return Err(WaypointError::ToolValidation(format!(
                        "unknown op '{}'",
                        other
                    )))
                }
            };
            Ok(ToolResult::success(value.to_string()))
        })
    }
}

/// Returns its `text` argument unchanged.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    fn execute(
        &self,
        args: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            Ok(ToolResult::success(
                args["text"].as_str().unwrap_or_default().to_string(),
            ))
        })
    }
}

/// Always fails with a tool execution error.
pub struct FailingTool;

impl Tool for FailingTool {
    fn name(&self) -> &str {
        "failing"
    }

    fn description(&self) -> &str {
        "A tool that always fails"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({"type": "object"})
    }

    fn execute(
        &self,
        _args: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async {
            Err(WaypointError::ToolExecution {
                tool: "failing".into(),
                message: "backend unavailable".into(),
            })
        })
    }
}

/// Fails with an error that is not a tool failure, to exercise propagation.
pub struct CrashingTool;

impl Tool for CrashingTool {
    fn name(&self) -> &str {
        "crashing"
    }

    fn description(&self) -> &str {
        "A tool whose failure aborts the run"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({"type": "object"})
    }

    fn execute(
        &self,
        _args: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async { Err(WaypointError::NodeFailure("tool crashed".into())) })
    }
}
