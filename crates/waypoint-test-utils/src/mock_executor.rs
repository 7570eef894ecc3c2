use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::LlmExecutor;
use waypoint_core::types::*;

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Messages(Vec<ChatMessage>),
    Error(String),
    /// Never resolves; a streaming call yields no frames.
    Hang,
}

/// A scripted stream.
#[derive(Debug, Clone)]
pub struct MockStream {
    pub frames: Vec<StreamFrame>,
    /// Error yielded after all frames.
    pub fail_with: Option<String>,
}

/// What the backend saw on one call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub prompt: Prompt,
    pub model: LlmModel,
    pub tools: Vec<ToolDescriptor>,
    pub streaming: bool,
}

/// Scripted LLM backend.
///
/// Answers are resolved in this order: the queue of scripted responses, then
/// the first rule whose needle occurs in the last message of the prompt, then
/// the default response.
pub struct MockExecutor {
    queue: Mutex<VecDeque<MockResponse>>,
    rules: Vec<(String, MockResponse)>,
    default: MockResponse,
    streams: Mutex<VecDeque<MockStream>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            rules: Vec::new(),
            default: MockResponse::Messages(vec![ChatMessage::assistant_text("OK")]),
            streams: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.then(MockResponse::Messages(vec![ChatMessage::assistant_text(text)]))
    }

    pub fn then_tool_call(self, tool: &str, args: serde_json::Value) -> Self {
        let id = format!("call_{}", self.queue.lock().unwrap().len());
        self.then(MockResponse::Messages(vec![ChatMessage::tool_call(
            Some(id),
            tool,
            args.to_string(),
        )]))
    }

    /// One assistant message carrying several tool calls.
    pub fn then_tool_calls(self, calls: Vec<(&str, serde_json::Value)>) -> Self {
        let content = calls
            .into_iter()
            .enumerate()
            .map(|(i, (tool, args))| ContentBlock::ToolUse {
                id: Some(format!("call_{}", i)),
                name: tool.to_string(),
                arguments: args.to_string(),
            })
            .collect();
        self.then(MockResponse::Messages(vec![ChatMessage {
            role: Role::Assistant,
            content,
            timestamp: None,
        }]))
    }

    pub fn then_messages(self, messages: Vec<ChatMessage>) -> Self {
        self.then(MockResponse::Messages(messages))
    }

    pub fn then_error(self, message: impl Into<String>) -> Self {
        self.then(MockResponse::Error(message.into()))
    }

    pub fn then_hang(self) -> Self {
        self.then(MockResponse::Hang)
    }

    pub fn then(self, response: MockResponse) -> Self {
        self.queue.lock().unwrap().push_back(response);
        self
    }

    /// Answer `text` whenever the last message contains `needle`.
    pub fn when_contains(mut self, needle: impl Into<String>, text: impl Into<String>) -> Self {
        self.rules.push((
            needle.into(),
            MockResponse::Messages(vec![ChatMessage::assistant_text(text)]),
        ));
        self
    }

    /// Call `tool` whenever the last message contains `needle`.
    pub fn when_contains_call(
        mut self,
        needle: impl Into<String>,
        tool: &str,
        args: serde_json::Value,
    ) -> Self {
        self.rules.push((
            needle.into(),
            MockResponse::Messages(vec![ChatMessage::tool_call(
                Some(format!("call_{}", tool)),
                tool,
                args.to_string(),
            )]),
        ));
        self
    }

    pub fn default_text(mut self, text: impl Into<String>) -> Self {
        self.default = MockResponse::Messages(vec![ChatMessage::assistant_text(text)]);
        self
    }

    /// Script the next streaming response.
    pub fn then_stream(self, frames: Vec<StreamFrame>) -> Self {
        self.streams.lock().unwrap().push_back(MockStream {
            frames,
            fail_with: None,
        });
        self
    }

    /// Script a stream that yields `frames` and then an error.
    pub fn then_failing_stream(self, frames: Vec<StreamFrame>, error: impl Into<String>) -> Self {
        self.streams.lock().unwrap().push_back(MockStream {
            frames,
            fail_with: Some(error.into()),
        });
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, prompt: &Prompt, model: &LlmModel, tools: &[ToolDescriptor], streaming: bool) {
        self.calls.lock().unwrap().push(RecordedCall {
            prompt: prompt.clone(),
            model: model.clone(),
            tools: tools.to_vec(),
            streaming,
        });
    }

    fn resolve(&self, prompt: &Prompt) -> MockResponse {
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            return next;
        }
        let last = prompt.messages.last().map(|m| m.text()).unwrap_or_default();
        self.rules
            .iter()
            .find(|(needle, _)| last.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| self.default.clone())
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Frames equivalent to a complete response.
fn frames_for(messages: &[ChatMessage]) -> Vec<StreamFrame> {
    let mut frames = Vec::new();
    for msg in messages {
        for block in &msg.content {
            match block {
                ContentBlock::Text { text } => frames.push(StreamFrame::Append { text: text.clone() }),
                ContentBlock::ToolUse {
                    id,
                    name,
                    arguments,
                } => frames.push(StreamFrame::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                _ => {}
            }
        }
    }
    frames.push(StreamFrame::End {
        finish_reason: Some("stop".into()),
    });
    frames
}

impl LlmExecutor for MockExecutor {
    fn execute(
        &self,
        prompt: Prompt,
        model: LlmModel,
        tools: Vec<ToolDescriptor>,
    ) -> BoxFuture<'_, Result<Vec<ChatMessage>>> {
        Box::pin(async move {
            self.record(&prompt, &model, &tools, false);
            match self.resolve(&prompt) {
                MockResponse::Messages(messages) => Ok(messages),
                MockResponse::Error(e) => Err(WaypointError::LlmRequest(e)),
                MockResponse::Hang => futures::future::pending().await,
            }
        })
    }

    fn execute_streaming(
        &self,
        prompt: Prompt,
        model: LlmModel,
        tools: Vec<ToolDescriptor>,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<StreamFrame>>>> {
        Box::pin(async move {
            self.record(&prompt, &model, &tools, true);
            let scripted = self.streams.lock().unwrap().pop_front();
            let script = match scripted {
                Some(script) => script,
                None => match self.resolve(&prompt) {
                    MockResponse::Messages(messages) => MockStream {
                        frames: frames_for(&messages),
                        fail_with: None,
                    },
                    MockResponse::Error(e) => return Err(WaypointError::LlmRequest(e)),
                    MockResponse::Hang => {
                        let silent: BoxStream<'static, Result<StreamFrame>> =
                            Box::pin(stream::pending());
                        return Ok(silent);
                    }
                },
            };

            let mut items: Vec<Result<StreamFrame>> = script.frames.into_iter().map(Ok).collect();
            if let Some(e) = script.fail_with {
                items.push(Err(WaypointError::LlmStream(e)));
            }
            let frames: BoxStream<'static, Result<StreamFrame>> = Box::pin(stream::iter(items));
            Ok(frames)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn model() -> LlmModel {
        LlmModel::new("mock", "mock-1")
    }

    #[tokio::test]
    async fn queue_then_rules_then_default() {
        let mock = MockExecutor::new()
            .then_text("first")
            .when_contains("weather", "sunny")
            .default_text("fallback");

        let p = Prompt::new("p").user("what is the weather");
        let a = mock.execute(p.clone(), model(), vec![]).await.unwrap();
        let b = mock.execute(p, model(), vec![]).await.unwrap();
        let c = mock
            .execute(Prompt::new("p").user("hi"), model(), vec![])
            .await
            .unwrap();

        assert_eq!(a[0].text(), "first");
        assert_eq!(b[0].text(), "sunny");
        assert_eq!(c[0].text(), "fallback");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn streaming_derives_frames_from_responses() {
        let mock = MockExecutor::new().then_text("hello");
        let stream = mock
            .execute_streaming(Prompt::new("p"), model(), vec![])
            .await
            .unwrap();
        let frames: Vec<_> = stream.collect().await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], Ok(StreamFrame::Append { text }) if text == "hello"));
    }

    #[tokio::test]
    async fn failing_stream_ends_with_error() {
        let mock = MockExecutor::new()
            .then_failing_stream(vec![StreamFrame::Append { text: "par".into() }], "reset");
        let frames: Vec<_> = mock
            .execute_streaming(Prompt::new("p"), model(), vec![])
            .await
            .unwrap()
            .collect()
            .await;
        assert!(frames[0].is_ok());
        assert!(matches!(&frames[1], Err(WaypointError::LlmStream(e)) if e == "reset"));
    }
}
