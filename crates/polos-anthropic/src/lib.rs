//! Anthropic `LlmProvider` implementation (spec.md §4.4 supplement): the
//! Messages API's request shape and its streaming event vocabulary
//! (`message_start`/`content_block_start`/`content_block_delta`/
//! `message_delta`/`message_stop`), trimmed to the events this SDK's
//! `LlmStreamEvent` seam needs (text deltas, completed tool calls,
//! done/usage). Request/response plumbing follows the same pattern as
//! the sibling `polos-openai` crate (see DESIGN.md for provenance).

use std::collections::HashMap;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use polos_contracts::{ToolCall, ToolDefinition};
use polos_core::error::{CoreError, Result};
use polos_core::traits::{
    LlmCallConfig, LlmCompletionMetadata, LlmMessage, LlmMessageContent, LlmMessageRole,
    LlmProvider, LlmResponseStream, LlmStreamEvent,
};

const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            api_url: DEFAULT_API_URL.to_string(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| CoreError::Internal(anyhow::anyhow!("ANTHROPIC_API_KEY not set")))?;
        Ok(Self::new(api_key))
    }

    pub fn with_base_url(api_key: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            api_url: api_url.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat_completion_stream(
        &self,
        messages: Vec<LlmMessage>,
        config: &LlmCallConfig,
    ) -> Result<LlmResponseStream> {
        let (system, messages) = convert_messages(&messages);

        let request = AnthropicRequest {
            model: config.model.clone(),
            max_tokens: config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system,
            temperature: config.temperature,
            stream: true,
            tools: convert_tools(&config.tools),
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Internal(anyhow::anyhow!(
                "anthropic request failed ({status}): {body}"
            )));
        }

        let model = config.model.clone();
        let mut tool_calls: HashMap<usize, AccumulatingToolCall> = HashMap::new();
        let mut total_tokens: u32 = 0;

        let stream = response.bytes_stream().eventsource().flat_map(move |event| {
            let mut out = Vec::new();

            match event {
                Err(e) => out.push(Ok(LlmStreamEvent::Error(e.to_string()))),
                Ok(event) => match serde_json::from_str::<AnthropicStreamEvent>(&event.data) {
                    Err(_) => {
                        // Comment/keepalive lines and malformed fragments are
                        // skipped rather than surfaced as errors.
                    }
                    Ok(parsed) => match parsed.event_type.as_str() {
                        "message_start" => {
                            if let Some(usage) = parsed.message.as_ref().and_then(|m| m.usage.as_ref()) {
                                total_tokens += usage.input_tokens.unwrap_or(0);
                            }
                        }
                        "content_block_start" => {
                            if let Some(block) = parsed.content_block {
                                if block.block_type.as_deref() == Some("tool_use") {
                                    let index = parsed.index.unwrap_or(0);
                                    tool_calls.insert(
                                        index,
                                        AccumulatingToolCall {
                                            id: block.id.unwrap_or_default(),
                                            name: block.name.unwrap_or_default(),
                                            arguments: String::new(),
                                        },
                                    );
                                }
                            }
                        }
                        "content_block_delta" => {
                            if let Some(delta) = parsed.delta {
                                match delta.delta_type.as_deref() {
                                    Some("text_delta") => {
                                        if let Some(text) = delta.text {
                                            if !text.is_empty() {
                                                out.push(Ok(LlmStreamEvent::TextDelta(text)));
                                            }
                                        }
                                    }
                                    Some("input_json_delta") => {
                                        if let (Some(index), Some(partial)) =
                                            (parsed.index, delta.partial_json)
                                        {
                                            if let Some(entry) = tool_calls.get_mut(&index) {
                                                entry.arguments.push_str(&partial);
                                            }
                                        }
                                    }
                                    _ => {}
                                }
                            }
                        }
                        "message_delta" => {
                            if let Some(usage) = parsed.usage {
                                total_tokens += usage.output_tokens.unwrap_or(0);
                            }
                            if let Some(delta) = parsed.delta {
                                if delta.stop_reason.is_some() {
                                    let finished = drain_tool_calls(&mut tool_calls);
                                    if !finished.is_empty() {
                                        out.push(Ok(LlmStreamEvent::ToolCalls(finished)));
                                    }
                                    out.push(Ok(LlmStreamEvent::Done(LlmCompletionMetadata {
                                        total_tokens: Some(total_tokens),
                                        prompt_tokens: None,
                                        completion_tokens: None,
                                        model: Some(model.clone()),
                                        finish_reason: delta.stop_reason,
                                    })));
                                }
                            }
                        }
                        "error" => {
                            let message = parsed
                                .error
                                .and_then(|e| e.get("message").and_then(|m| m.as_str()).map(String::from))
                                .unwrap_or_else(|| "anthropic streaming error".to_string());
                            out.push(Ok(LlmStreamEvent::Error(message)));
                        }
                        _ => {}
                    },
                },
            }

            futures::stream::iter(out)
        });

        Ok(Box::pin(stream))
    }
}

#[derive(Default)]
struct AccumulatingToolCall {
    id: String,
    name: String,
    arguments: String,
}

fn drain_tool_calls(tool_calls: &mut HashMap<usize, AccumulatingToolCall>) -> Vec<ToolCall> {
    let mut indices: Vec<usize> = tool_calls.keys().copied().collect();
    indices.sort_unstable();
    indices
        .into_iter()
        .filter_map(|i| tool_calls.remove(&i))
        .map(|call| ToolCall {
            id: call.id,
            name: call.name,
            arguments: serde_json::from_str(&call.arguments).unwrap_or(Value::Null),
        })
        .collect()
}

/// Splits system messages out of the sequence (Anthropic takes `system` as
/// a top-level request field, not a message role) and folds tool results
/// into user-role `tool_result` content blocks.
fn convert_messages(messages: &[LlmMessage]) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system = String::new();
    let mut out = Vec::new();

    for message in messages {
        match message.role {
            LlmMessageRole::System => {
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(&message.content_as_text());
            }
            LlmMessageRole::User => {
                out.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: vec![AnthropicContentBlock::Text {
                        text: message.content_as_text(),
                    }],
                });
            }
            LlmMessageRole::Assistant => {
                let mut blocks = Vec::new();
                let text = message.content_as_text();
                if !text.is_empty() {
                    blocks.push(AnthropicContentBlock::Text { text });
                }
                if let Some(calls) = &message.tool_calls {
                    for call in calls {
                        blocks.push(AnthropicContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.arguments.clone(),
                        });
                    }
                }
                out.push(AnthropicMessage {
                    role: "assistant".to_string(),
                    content: blocks,
                });
            }
            LlmMessageRole::Tool => {
                let content = match &message.content {
                    LlmMessageContent::Text(text) => text.clone(),
                    _ => message.content_as_text(),
                };
                out.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: vec![AnthropicContentBlock::ToolResult {
                        tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                        content,
                    }],
                });
            }
        }
    }

    (if system.is_empty() { None } else { Some(system) }, out)
}

fn convert_tools(tools: &[ToolDefinition]) -> Option<Vec<AnthropicTool>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.parameters().clone(),
            })
            .collect(),
    )
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    message: Option<AnthropicStreamMessage>,
    #[serde(default)]
    content_block: Option<AnthropicStreamContentBlock>,
    #[serde(default)]
    delta: Option<AnthropicStreamDelta>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamMessage {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamContentBlock {
    #[serde(rename = "type", default)]
    block_type: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamDelta {
    #[serde(rename = "type", default)]
    delta_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_messages_splits_system_and_folds_tool_result() {
        let messages = vec![
            LlmMessage::text(LlmMessageRole::System, "be terse"),
            LlmMessage::text(LlmMessageRole::User, "hi"),
            LlmMessage {
                role: LlmMessageRole::Tool,
                content: LlmMessageContent::Text("42".to_string()),
                tool_calls: None,
                tool_call_id: Some("call_1".to_string()),
            },
        ];
        let (system, converted) = convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("be terse"));
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[1].role, "user");
    }

    #[test]
    fn convert_tools_returns_none_for_empty_slice() {
        assert!(convert_tools(&[]).is_none());
    }
}
