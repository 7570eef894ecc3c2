use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, ReceivedToolResult, ToolCall};

/// The value passed between strategy graph nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Empty,
    Text(String),
    Json(serde_json::Value),
    Message(ChatMessage),
    Messages(Vec<ChatMessage>),
    ToolCall(ToolCall),
    ToolCalls(Vec<ToolCall>),
    ToolResult(ReceivedToolResult),
    ToolResults(Vec<ReceivedToolResult>),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&ChatMessage> {
        match self {
            Self::Message(m) => Some(m),
            _ => None,
        }
    }

    /// The tool call carried by this payload, directly or inside a message.
    pub fn tool_call(&self) -> Option<ToolCall> {
        match self {
            Self::ToolCall(c) => Some(c.clone()),
            Self::Message(m) => m.first_tool_call(),
            _ => None,
        }
    }

    /// All tool calls carried by this payload.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        match self {
            Self::ToolCall(c) => vec![c.clone()],
            Self::ToolCalls(cs) => cs.clone(),
            Self::Message(m) => m.tool_calls(),
            Self::Messages(ms) => ms.iter().flat_map(|m| m.tool_calls()).collect(),
            _ => vec![],
        }
    }

    pub fn is_tool_call(&self) -> bool {
        match self {
            Self::ToolCall(_) => true,
            Self::ToolCalls(cs) => !cs.is_empty(),
            Self::Message(m) => m.is_tool_call(),
            Self::Messages(ms) => ms.iter().any(|m| m.is_tool_call()),
            _ => false,
        }
    }

    pub fn is_assistant_message(&self) -> bool {
        match self {
            Self::Message(m) => m.is_assistant_text(),
            Self::Messages(ms) => !ms.is_empty() && ms.iter().all(|m| m.is_assistant_text()),
            _ => false,
        }
    }

    /// Best-effort text view used by text predicates and logs.
    pub fn text_content(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text(s) => s.clone(),
            Self::Json(v) => match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            Self::Message(m) => m.text(),
            Self::Messages(ms) => ms.iter().map(|m| m.text()).collect::<Vec<_>>().join("\n"),
            Self::ToolCall(c) => c.content.clone(),
            Self::ToolCalls(cs) => cs
                .iter()
                .map(|c| c.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            Self::ToolResult(r) => r.content.clone(),
            Self::ToolResults(rs) => rs
                .iter()
                .map(|r| r.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Short label for logs and error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Text(_) => "text",
            Self::Json(_) => "json",
            Self::Message(_) => "message",
            Self::Messages(_) => "messages",
            Self::ToolCall(_) => "tool_call",
            Self::ToolCalls(_) => "tool_calls",
            Self::ToolResult(_) => "tool_result",
            Self::ToolResults(_) => "tool_results",
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<ChatMessage> for Payload {
    fn from(m: ChatMessage) -> Self {
        Self::Message(m)
    }
}

impl From<ReceivedToolResult> for Payload {
    fn from(r: ReceivedToolResult) -> Self {
        Self::ToolResult(r)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}
