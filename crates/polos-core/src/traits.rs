//! Provider-agnostic LLM seam (spec.md §4.4): `polos-openai` and
//! `polos-anthropic` each implement `LlmProvider` against this shape so the
//! agent loop never depends on a specific vendor API.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use polos_contracts::{ConversationMessage, MessageRole, ToolCall, ToolDefinition};

use crate::error::Result;

pub type LlmResponseStream = Pin<Box<dyn Stream<Item = Result<LlmStreamEvent>> + Send>>;

#[derive(Debug, Clone)]
pub enum LlmStreamEvent {
    TextDelta(String),
    ToolCalls(Vec<ToolCall>),
    Done(LlmCompletionMetadata),
    Error(String),
}

#[derive(Debug, Clone, Default)]
pub struct LlmCompletionMetadata {
    pub total_tokens: Option<u32>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub model: Option<String>,
    pub finish_reason: Option<String>,
}

/// Implemented once per model vendor. The agent loop only ever talks to
/// this trait, never a concrete provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat_completion_stream(
        &self,
        messages: Vec<LlmMessage>,
        config: &LlmCallConfig,
    ) -> Result<LlmResponseStream>;

    /// Drains the stream into a single response. Providers get this for
    /// free; only `chat_completion_stream` needs implementing.
    async fn chat_completion(
        &self,
        messages: Vec<LlmMessage>,
        config: &LlmCallConfig,
    ) -> Result<LlmResponse> {
        use futures::StreamExt;

        let mut stream = self.chat_completion_stream(messages, config).await?;
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut metadata = LlmCompletionMetadata::default();

        while let Some(event) = stream.next().await {
            match event? {
                LlmStreamEvent::TextDelta(delta) => text.push_str(&delta),
                LlmStreamEvent::ToolCalls(calls) => tool_calls = calls,
                LlmStreamEvent::Done(meta) => metadata = meta,
                LlmStreamEvent::Error(err) => {
                    return Err(crate::error::CoreError::Internal(anyhow::anyhow!(err)))
                }
            }
        }

        Ok(LlmResponse {
            text,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            metadata,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LlmMessage {
    pub role: LlmMessageRole,
    pub content: LlmMessageContent,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
}

impl LlmMessage {
    pub fn text(role: LlmMessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: LlmMessageContent::Text(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn parts(role: LlmMessageRole, parts: Vec<LlmContentPart>) -> Self {
        Self {
            role,
            content: LlmMessageContent::Parts(parts),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn content_as_text(&self) -> String {
        self.content.to_text()
    }
}

#[derive(Debug, Clone)]
pub enum LlmMessageContent {
    Text(String),
    Parts(Vec<LlmContentPart>),
}

impl LlmMessageContent {
    pub fn to_text(&self) -> String {
        match self {
            LlmMessageContent::Text(s) => s.clone(),
            LlmMessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    LlmContentPart::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, LlmMessageContent::Text(_))
    }
}

impl From<String> for LlmMessageContent {
    fn from(s: String) -> Self {
        LlmMessageContent::Text(s)
    }
}

impl From<&str> for LlmMessageContent {
    fn from(s: &str) -> Self {
        LlmMessageContent::Text(s.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum LlmContentPart {
    Text { text: String },
    Image { url: String },
    Audio { url: String },
}

impl LlmContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        LlmContentPart::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        LlmContentPart::Image { url: url.into() }
    }

    pub fn audio(url: impl Into<String>) -> Self {
        LlmContentPart::Audio { url: url.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmMessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone)]
pub struct LlmCallConfig {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub metadata: LlmCompletionMetadata,
}

impl From<&ConversationMessage> for LlmMessage {
    fn from(msg: &ConversationMessage) -> Self {
        let role = match msg.role {
            MessageRole::System => LlmMessageRole::System,
            MessageRole::User => LlmMessageRole::User,
            MessageRole::Assistant => LlmMessageRole::Assistant,
            MessageRole::Tool => LlmMessageRole::Tool,
        };

        LlmMessage {
            role,
            content: LlmMessageContent::Text(msg.content.to_llm_string()),
            tool_calls: match &msg.content {
                polos_contracts::MessageContent::ToolCalls(calls) => Some(calls.clone()),
                _ => None,
            },
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_to_text_joins_text_parts_and_skips_media() {
        let content = LlmMessageContent::Parts(vec![
            LlmContentPart::text("a"),
            LlmContentPart::image("http://x/y.png"),
            LlmContentPart::text("b"),
        ]);
        assert_eq!(content.to_text(), "ab");
    }

    #[test]
    fn conversation_message_conversion_preserves_tool_call_id() {
        let msg = ConversationMessage::tool_result("call_1", Some(serde_json::json!(1)), None);
        let llm: LlmMessage = (&msg).into();
        assert_eq!(llm.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(llm.role, LlmMessageRole::Tool);
    }
}
