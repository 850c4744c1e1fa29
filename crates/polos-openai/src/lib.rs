//! OpenAI `LlmProvider` implementation (spec.md §4.4 supplement): chat
//! completions wire shapes and SSE tool-call-delta accumulation, built
//! against `polos-core`'s provider-agnostic `LlmProvider` seam.

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

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            api_url: DEFAULT_API_URL.to_string(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| CoreError::Internal(anyhow::anyhow!("OPENAI_API_KEY not set")))?;
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
impl LlmProvider for OpenAiProvider {
    async fn chat_completion_stream(
        &self,
        messages: Vec<LlmMessage>,
        config: &LlmCallConfig,
    ) -> Result<LlmResponseStream> {
        let request = OpenAiRequest {
            model: config.model.clone(),
            messages: messages.iter().map(convert_message).collect(),
            stream: true,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            tools: convert_tools(&config.tools),
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Internal(anyhow::anyhow!(
                "openai request failed ({status}): {body}"
            )));
        }

        let model = config.model.clone();
        let mut tool_calls: HashMap<usize, AccumulatingToolCall> = HashMap::new();
        let mut total_tokens = 0u32;

        // Each input SSE event maps to zero or more output stream events
        // (a text delta, a batch of completed tool calls, a terminal Done),
        // so the eventsource stream is flattened rather than mapped 1:1.
        let stream = response.bytes_stream().eventsource().flat_map(move |event| {
            let mut out = Vec::new();

            match event {
                Err(e) => out.push(Ok(LlmStreamEvent::Error(e.to_string()))),
                Ok(event) if event.data == "[DONE]" => {
                    let finished = drain_tool_calls(&mut tool_calls);
                    if !finished.is_empty() {
                        out.push(Ok(LlmStreamEvent::ToolCalls(finished)));
                    }
                    out.push(Ok(LlmStreamEvent::Done(LlmCompletionMetadata {
                        total_tokens: Some(total_tokens),
                        prompt_tokens: None,
                        completion_tokens: None,
                        model: Some(model.clone()),
                        finish_reason: None,
                    })));
                }
                Ok(event) => match serde_json::from_str::<OpenAiStreamChunk>(&event.data) {
                    Err(e) => out.push(Ok(LlmStreamEvent::Error(format!(
                        "malformed stream chunk: {e}"
                    )))),
                    Ok(chunk) => {
                        if let Some(choice) = chunk.choices.into_iter().next() {
                            total_tokens += 1;

                            if let Some(content) = choice.delta.content {
                                if !content.is_empty() {
                                    out.push(Ok(LlmStreamEvent::TextDelta(content)));
                                }
                            }

                            if let Some(deltas) = choice.delta.tool_calls {
                                for delta in deltas {
                                    let entry = tool_calls.entry(delta.index).or_default();
                                    if let Some(id) = delta.id {
                                        entry.id = id;
                                    }
                                    if let Some(function) = delta.function {
                                        if let Some(name) = function.name {
                                            entry.name = name;
                                        }
                                        if let Some(arguments) = function.arguments {
                                            entry.arguments.push_str(&arguments);
                                        }
                                    }
                                }
                            }

                            if choice.finish_reason.as_deref() == Some("tool_calls") {
                                let finished = drain_tool_calls(&mut tool_calls);
                                if !finished.is_empty() {
                                    out.push(Ok(LlmStreamEvent::ToolCalls(finished)));
                                }
                            }
                        }
                    }
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

fn convert_message(message: &LlmMessage) -> OpenAiMessage {
    OpenAiMessage {
        role: match message.role {
            LlmMessageRole::System => "system",
            LlmMessageRole::User => "user",
            LlmMessageRole::Assistant => "assistant",
            LlmMessageRole::Tool => "tool",
        }
        .to_string(),
        content: Some(match &message.content {
            LlmMessageContent::Text(text) => OpenAiContent::Text(text.clone()),
            LlmMessageContent::Parts(_) => OpenAiContent::Text(message.content_as_text()),
        }),
        tool_calls: message.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|c| OpenAiToolCall {
                    id: c.id.clone(),
                    r#type: "function".to_string(),
                    function: OpenAiFunctionCall {
                        name: c.name.clone(),
                        arguments: c.arguments.to_string(),
                    },
                })
                .collect()
        }),
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn convert_tools(tools: &[ToolDefinition]) -> Option<Vec<OpenAiTool>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|t| OpenAiTool {
                r#type: "function".to_string(),
                function: OpenAiFunction {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters: t.parameters().clone(),
                },
            })
            .collect(),
    )
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<OpenAiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAiContent {
    Text(String),
}

#[derive(Debug, Serialize)]
struct OpenAiToolCall {
    id: String,
    r#type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamToolCall {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_tools_returns_none_for_empty_slice() {
        assert!(convert_tools(&[]).is_none());
    }

    #[test]
    fn convert_message_maps_tool_role() {
        let msg = LlmMessage {
            role: LlmMessageRole::Tool,
            content: LlmMessageContent::Text("result".to_string()),
            tool_calls: None,
            tool_call_id: Some("call_1".to_string()),
        };
        let converted = convert_message(&msg);
        assert_eq!(converted.role, "tool");
        assert_eq!(converted.tool_call_id.as_deref(), Some("call_1"));
    }
}
