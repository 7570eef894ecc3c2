use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::ExecutionInfo;

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    /// A tool call requested by the model. `arguments` is the raw JSON
    /// payload exactly as the model produced it; it may be malformed.
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        arguments: String,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        tool: String,
        content: String,
        is_error: bool,
    },

    #[serde(rename = "thinking")]
    Thinking { thinking: String },
}

/// A chat message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    fn with_blocks(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_blocks(Role::System, vec![ContentBlock::Text { text: text.into() }])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_blocks(Role::User, vec![ContentBlock::Text { text: text.into() }])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::with_blocks(Role::Assistant, vec![ContentBlock::Text { text: text.into() }])
    }

    /// An assistant message carrying a single tool call.
    pub fn tool_call(
        id: Option<String>,
        tool: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::with_blocks(
            Role::Assistant,
            vec![ContentBlock::ToolUse {
                id,
                name: tool.into(),
                arguments: arguments.into(),
            }],
        )
    }

    /// The history entry that reports a tool result back to the model.
    pub fn tool_result(result: &ReceivedToolResult) -> Self {
        Self::with_blocks(
            Role::Tool,
            vec![ContentBlock::ToolResult {
                tool_use_id: result.tool_call_id.clone(),
                tool: result.tool.clone(),
                content: result.content.clone(),
                is_error: result.kind == ToolResultKind::Failure,
            }],
        )
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Extract all tool calls from this message, in block order.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse {
                    id,
                    name,
                    arguments,
                } => Some(ToolCall {
                    id: id.clone(),
                    tool: name.clone(),
                    content: arguments.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// The first tool call in this message, if any.
    pub fn first_tool_call(&self) -> Option<ToolCall> {
        self.tool_calls().into_iter().next()
    }

    pub fn is_tool_call(&self) -> bool {
        self.role == Role::Assistant
            && self
                .content
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    /// An assistant reply with no tool calls.
    pub fn is_assistant_text(&self) -> bool {
        self.role == Role::Assistant && !self.is_tool_call()
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: Option<String>,
    pub tool: String,
    /// Raw JSON arguments.
    pub content: String,
}

impl ToolCall {
    pub fn new(id: Option<String>, tool: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id,
            tool: tool.into(),
            content: content.into(),
        }
    }

    /// The assistant message that carries this call in history.
    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::tool_call(self.id.clone(), self.tool.clone(), self.content.clone())
    }
}

/// Constraint on whether and which tools the model may call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", content = "tool", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Named(String),
}

/// Sampling parameters sent with a prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LlmParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

/// Ordered message history plus the parameters it is sent with.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Prompt {
    pub id: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub params: LlmParams,
}

impl Prompt {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn system(mut self, text: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::system(text));
        self
    }

    pub fn user(mut self, text: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::user(text));
        self
    }

    pub fn assistant(mut self, text: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::assistant_text(text));
        self
    }

    pub fn with_params(mut self, params: LlmParams) -> Self {
        self.params = params;
        self
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// The same history with the tool-choice constraint replaced.
    pub fn with_tool_choice(&self, choice: ToolChoice) -> Self {
        let mut prompt = self.clone();
        prompt.params.tool_choice = Some(choice);
        prompt
    }
}

/// The model a prompt is sent to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmModel {
    pub provider: String,
    pub id: String,
    #[serde(default = "default_context_length")]
    pub context_length: u64,
    #[serde(default = "default_supports_tools")]
    pub supports_tools: bool,
}

fn default_context_length() -> u64 {
    128_000
}

fn default_supports_tools() -> bool {
    true
}

impl LlmModel {
    pub fn new(provider: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            id: id.into(),
            context_length: default_context_length(),
            supports_tools: default_supports_tools(),
        }
    }
}

impl std::fmt::Display for LlmModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.id)
    }
}

/// Tool descriptor exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A frame received from a streaming LLM response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// A chunk of assistant text.
    Append { text: String },
    /// A complete tool call.
    ToolCall {
        id: Option<String>,
        name: String,
        arguments: String,
    },
    /// The response is complete.
    End { finish_reason: Option<String> },
}

/// Result of a moderation check.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModerationResult {
    pub is_harmful: bool,
    #[serde(default)]
    pub categories: Vec<String>,
}

/// Raw result returned by a tool body.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolResultKind {
    Success,
    Failure,
}

/// Outcome of dispatching one tool call, ready to be sent back to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceivedToolResult {
    pub tool_call_id: Option<String>,
    pub tool: String,
    /// Raw arguments the call was made with.
    pub args: String,
    pub kind: ToolResultKind,
    /// Encoded result (or error description) as sent to the model.
    pub content: String,
}

impl ReceivedToolResult {
    pub fn success(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool: call.tool.clone(),
            args: call.content.clone(),
            kind: ToolResultKind::Success,
            content: content.into(),
        }
    }

    pub fn failure(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool: call.tool.clone(),
            args: call.content.clone(),
            kind: ToolResultKind::Failure,
            content: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == ToolResultKind::Success
    }
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run_id: String,
    pub agent_id: String,
    pub tool_call_id: Option<String>,
    pub execution: ExecutionInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_message_is_detected() {
        let msg = ChatMessage::tool_call(Some("c1".into()), "add", r#"{"a":1}"#);
        assert!(msg.is_tool_call());
        assert!(!msg.is_assistant_text());

        let call = msg.first_tool_call().unwrap();
        assert_eq!(call.id.as_deref(), Some("c1"));
        assert_eq!(call.tool, "add");
        assert_eq!(call.content, r#"{"a":1}"#);
    }

    #[test]
    fn assistant_text_has_no_calls() {
        let msg = ChatMessage::assistant_text("Done");
        assert!(msg.is_assistant_text());
        assert!(msg.tool_calls().is_empty());
        assert_eq!(msg.text(), "Done");
    }

    #[test]
    fn tool_result_message_marks_failures() {
        let call = ToolCall::new(None, "lookup", "{}");
        let msg = ChatMessage::tool_result(&ReceivedToolResult::failure(&call, "not found"));
        assert_eq!(msg.role, Role::Tool);
        assert!(matches!(
            &msg.content[0],
            ContentBlock::ToolResult { is_error: true, tool, .. } if tool == "lookup"
        ));
    }

    #[test]
    fn with_tool_choice_leaves_original_untouched() {
        let prompt = Prompt::new("p").user("hi");
        let forced = prompt.with_tool_choice(ToolChoice::Named("add".into()));
        assert_eq!(forced.params.tool_choice, Some(ToolChoice::Named("add".into())));
        assert_eq!(prompt.params.tool_choice, None);
        assert_eq!(forced.messages, prompt.messages);
    }
}
