//! In-memory test doubles (`InMemoryEventEmitter`/`NoOpEventEmitter`) for
//! examples and unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use crate::error::{CoreError, Result};
use crate::traits::{
    LlmCallConfig, LlmCompletionMetadata, LlmMessage, LlmProvider, LlmResponseStream,
    LlmStreamEvent,
};

/// Deterministic `LlmProvider` double. Replays a fixed queue of scripted
/// responses, or always errors (`failing()`), without making any network
/// call. Useful for agent-loop and compaction tests.
pub struct FakeLlmProvider {
    responses: Mutex<VecDeque<FakeResponse>>,
    /// Served once the queue is drained, instead of falling back to an
    /// empty text response. Lets a test drive an agent loop through many
    /// iterations without scripting one entry per step.
    repeat: Option<FakeResponse>,
    always_fail: bool,
}

#[derive(Clone)]
enum FakeResponse {
    Text(String),
    ToolCalls(Vec<polos_contracts::ToolCall>),
}

impl FakeLlmProvider {
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from([FakeResponse::Text(text.into())])),
            repeat: None,
            always_fail: false,
        }
    }

    pub fn with_script(texts: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(
                texts
                    .into_iter()
                    .map(|t| FakeResponse::Text(t.to_string()))
                    .collect(),
            ),
            repeat: None,
            always_fail: false,
        }
    }

    pub fn with_tool_call_then_text(call: polos_contracts::ToolCall, text: &str) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from([
                FakeResponse::ToolCalls(vec![call]),
                FakeResponse::Text(text.to_string()),
            ])),
            repeat: None,
            always_fail: false,
        }
    }

    /// Always responds with the same tool call, every turn, forever. For
    /// driving an agent loop through a fixed number of iterations under a
    /// `max_steps` stop condition (spec.md §4.4 scenario D).
    pub fn with_repeating_tool_call(call: polos_contracts::ToolCall) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            repeat: Some(FakeResponse::ToolCalls(vec![call])),
            always_fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            repeat: None,
            always_fail: true,
        }
    }
}

#[async_trait]
impl LlmProvider for FakeLlmProvider {
    async fn chat_completion_stream(
        &self,
        _messages: Vec<LlmMessage>,
        _config: &LlmCallConfig,
    ) -> Result<LlmResponseStream> {
        if self.always_fail {
            return Err(CoreError::Internal(anyhow::anyhow!("fake provider configured to fail")));
        }
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeat.clone())
            .unwrap_or(FakeResponse::Text(String::new()));

        let events = match next {
            FakeResponse::Text(text) => vec![
                Ok(LlmStreamEvent::TextDelta(text)),
                Ok(LlmStreamEvent::Done(LlmCompletionMetadata {
                    total_tokens: Some(1),
                    ..Default::default()
                })),
            ],
            FakeResponse::ToolCalls(calls) => vec![
                Ok(LlmStreamEvent::ToolCalls(calls)),
                Ok(LlmStreamEvent::Done(LlmCompletionMetadata::default())),
            ],
        };
        Ok(Box::pin(stream::iter(events)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::LlmMessageRole;

    #[tokio::test]
    async fn fake_provider_replays_scripted_text() {
        let provider = FakeLlmProvider::with_text("hello");
        let response = provider
            .chat_completion(
                vec![LlmMessage::text(LlmMessageRole::User, "hi")],
                &LlmCallConfig {
                    model: "fake".into(),
                    temperature: None,
                    max_tokens: None,
                    tools: vec![],
                },
            )
            .await
            .unwrap();
        assert_eq!(response.text, "hello");
    }

    #[tokio::test]
    async fn failing_provider_errors() {
        let provider = FakeLlmProvider::failing();
        let result = provider
            .chat_completion(
                vec![],
                &LlmCallConfig {
                    model: "fake".into(),
                    temperature: None,
                    max_tokens: None,
                    tools: vec![],
                },
            )
            .await;
        assert!(result.is_err());
    }
}
