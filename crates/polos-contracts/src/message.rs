// Conversation message types shared between the agent loop and the
// orchestrator's conversation-history endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tools::ToolCall;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// Message content: either plain text or structured tool data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    ToolCalls(Vec<ToolCall>),
    ToolResult {
        tool_call_id: String,
        result: Option<serde_json::Value>,
        error: Option<String>,
    },
}

impl MessageContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Flattens structured content (tool calls/results) to a string for the
    /// token estimator and for providers that only accept plain text.
    pub fn to_llm_string(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::ToolCalls(calls) => {
                serde_json::to_string(calls).unwrap_or_default()
            }
            MessageContent::ToolResult { result, error, .. } => serde_json::to_string(
                &serde_json::json!({ "result": result, "error": error }),
            )
            .unwrap_or_default(),
        }
    }
}

/// A single message in a conversation, as stored/transported by the
/// orchestrator's conversation-history endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role_text(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role_text(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role_text(MessageRole::System, content)
    }

    fn with_role_text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            role,
            content: MessageContent::Text(content.into()),
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            id: Uuid::now_v7(),
            role: MessageRole::Assistant,
            content: MessageContent::ToolCalls(calls),
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Self {
        let tool_call_id = tool_call_id.into();
        Self {
            id: Uuid::now_v7(),
            role: MessageRole::Tool,
            content: MessageContent::ToolResult {
                tool_call_id: tool_call_id.clone(),
                result,
                error,
            },
            tool_call_id: Some(tool_call_id),
            created_at: Utc::now(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.content.as_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_round_trips_text() {
        let m = ConversationMessage::user("hello");
        assert_eq!(m.role, MessageRole::User);
        assert_eq!(m.text(), Some("hello"));
    }

    #[test]
    fn tool_result_carries_call_id() {
        let m = ConversationMessage::tool_result("call_1", Some(serde_json::json!(42)), None);
        assert_eq!(m.tool_call_id.as_deref(), Some("call_1"));
    }
}
