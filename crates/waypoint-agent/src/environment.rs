//! Tool dispatch: resolve, decode, execute and classify tool calls.
//!
//! Lookup failures, argument decode errors and tool-body failures become
//! [`ToolResultKind::Failure`](waypoint_core::types::ToolResultKind) results
//! that are reported back to the model. Only unexpected errors propagate and
//! fail the calling node.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::{ToolCallCompleted, ToolCallFailed, ToolCallStarting, ToolValidationFailed};
use waypoint_core::types::{ReceivedToolResult, ToolCall, ToolContext};
use waypoint_tools::{decode_arguments, ToolRegistry};

use crate::context::AgentContext;

/// Executes tool calls against an immutable registry.
#[derive(Clone, Debug)]
pub struct ToolEnvironment {
    registry: Arc<ToolRegistry>,
}

impl ToolEnvironment {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute one call. Emits `ToolCallStarting` and exactly one terminal
    /// event.
    pub async fn execute(&self, ctx: &AgentContext, call: ToolCall) -> Result<ReceivedToolResult> {
        ctx.emit(ToolCallStarting { call: call.clone() });

        let Some(tool) = self.registry.get(&call.tool) else {
            let error = WaypointError::ToolNotFound(call.tool.clone()).to_string();
            warn!(tool = %call.tool, "Model requested an unknown tool");
            ctx.emit(ToolCallFailed {
                call: call.clone(),
                error: error.clone(),
            });
            return Ok(ReceivedToolResult::failure(&call, error));
        };

        let args = match decode_arguments(&call, &tool.input_schema()) {
            Ok(args) => args,
            Err(e) => return Ok(validation_failure(ctx, &call, e)),
        };

        let tool_ctx = ToolContext {
            run_id: ctx.run_id().to_string(),
            agent_id: ctx.agent_id().to_string(),
            tool_call_id: call.id.clone(),
            execution: ctx.execution().clone(),
        };

        let cancel = ctx.cancel_token();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WaypointError::Cancelled),
            result = self.registry.execute(&call.tool, args, tool_ctx) => result,
        };

        match outcome {
            Ok(result) if !result.is_error => {
                debug!(tool = %call.tool, "Tool call completed");
                ctx.emit(ToolCallCompleted {
                    call: call.clone(),
                    result: result.content.clone(),
                });
                Ok(ReceivedToolResult::success(&call, result.content))
            }
            Ok(result) => {
                ctx.emit(ToolCallFailed {
                    call: call.clone(),
                    error: result.content.clone(),
                });
                Ok(ReceivedToolResult::failure(&call, result.content))
            }
            Err(e @ WaypointError::ToolValidation(_)) => Ok(validation_failure(ctx, &call, e)),
            Err(e) if e.is_tool_failure() => {
                warn!(tool = %call.tool, error = %e, "Tool call failed");
                ctx.emit(ToolCallFailed {
                    call: call.clone(),
                    error: e.to_string(),
                });
                Ok(ReceivedToolResult::failure(&call, e.to_string()))
            }
            Err(e) => {
                warn!(tool = %call.tool, error = %e, "Tool call aborted");
                ctx.emit(ToolCallFailed {
                    call,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Execute a batch. Results come back in request order whether or not the
    /// calls ran concurrently.
    pub async fn execute_all(
        &self,
        ctx: &AgentContext,
        calls: Vec<ToolCall>,
        parallel: bool,
    ) -> Result<Vec<ReceivedToolResult>> {
        if !parallel {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(self.execute(ctx, call).await?);
            }
            return Ok(results);
        }

        debug!(count = calls.len(), "Executing tool calls in parallel");
        // join_all keeps input order and runs in this task, so session
        // markers stay visible to the calls
        join_all(calls.into_iter().map(|call| self.execute(ctx, call)))
            .await
            .into_iter()
            .collect()
    }
}

fn validation_failure(ctx: &AgentContext, call: &ToolCall, error: WaypointError) -> ReceivedToolResult {
    warn!(tool = %call.tool, error = %error, "Tool arguments rejected");
    ctx.emit(ToolValidationFailed {
        call: call.clone(),
        error: error.to_string(),
    });
    ReceivedToolResult::failure(call, error.to_string())
}
