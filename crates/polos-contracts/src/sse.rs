// Server-sent event envelope, as emitted by the orchestrator's event bus
// and consumed by polos-client's SSE parser.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One parsed `data: <json>` line from the orchestrator's SSE stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseEnvelope {
    pub id: Uuid,
    pub sequence_id: u64,
    pub topic: String,
    pub event_type: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SseEnvelope {
    /// The `_metadata.execution_id` field most finish/start events carry,
    /// used to disambiguate nested agents on a shared topic.
    pub fn metadata_execution_id(&self) -> Option<Uuid> {
        self.data
            .get("_metadata")
            .and_then(|m| m.get("execution_id"))
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// Well-known event type strings used by the core (spec.md §6).
pub mod event_type {
    pub const WORKFLOW_START: &str = "workflow_start";
    pub const WORKFLOW_FINISH: &str = "workflow_finish";
    pub const AGENT_START: &str = "agent_start";
    pub const AGENT_FINISH: &str = "agent_finish";
    pub const TOOL_START: &str = "tool_start";
    pub const TOOL_FINISH: &str = "tool_finish";
    pub const STEP_START: &str = "step_start";
    pub const STEP_FINISH: &str = "step_finish";
    pub const TEXT_DELTA: &str = "text_delta";
    pub const TOOL_CALL: &str = "tool_call";

    pub fn suspend(key: &str) -> String {
        format!("suspend_{key}")
    }

    pub fn resume(key: &str) -> String {
        format!("resume_{key}")
    }
}

/// Builds the canonical per-run topic: `workflow/<root_workflow_id>/<root_execution_id>`.
pub fn workflow_topic(root_workflow_id: &str, root_execution_id: Uuid) -> String {
    format!("workflow/{root_workflow_id}/{root_execution_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_format() {
        let id = Uuid::nil();
        assert_eq!(workflow_topic("wf", id), format!("workflow/wf/{id}"));
    }

    #[test]
    fn metadata_execution_id_extracts_nested_field() {
        let env = SseEnvelope {
            id: Uuid::now_v7(),
            sequence_id: 1,
            topic: "t".into(),
            event_type: "agent_finish".into(),
            data: serde_json::json!({ "_metadata": { "execution_id": Uuid::nil().to_string() } }),
            created_at: Utc::now(),
        };
        assert_eq!(env.metadata_execution_id(), Some(Uuid::nil()));
    }
}
