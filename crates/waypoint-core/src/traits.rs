use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::*;

/// LLM backend: the opaque capability the engine sends prompts to.
pub trait LlmExecutor: Send + Sync + 'static {
    /// Send a prompt and receive the complete response message(s).
    fn execute(
        &self,
        prompt: Prompt,
        model: LlmModel,
        tools: Vec<ToolDescriptor>,
    ) -> BoxFuture<'_, Result<Vec<ChatMessage>>>;

    /// Send a prompt and receive a lazy stream of frames.
    fn execute_streaming(
        &self,
        prompt: Prompt,
        model: LlmModel,
        tools: Vec<ToolDescriptor>,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<StreamFrame>>>>;

    /// Classify a prompt for harmful content.
    fn moderate(&self, prompt: Prompt, model: LlmModel) -> BoxFuture<'_, Result<ModerationResult>> {
        let _ = (prompt, model);
        Box::pin(async { Ok(ModerationResult::default()) })
    }
}

/// A named capability the model may request to invoke.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in LLM tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with decoded arguments.
    ///
    /// Return `Err(WaypointError::ToolValidation)` when the arguments do not
    /// fit the tool; other tool errors are reported to the model as failures.
    fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}
