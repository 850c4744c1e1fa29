// Execution-scoped wire types: ExecutionContext, StepOutput, and the
// workflow/agent/run configuration options exchanged with the
// orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Workflow kind, as registered with the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Workflow,
    Agent,
    Tool,
}

/// The kind of wait the step helper asked the orchestrator to track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    Time,
    Event,
    Suspend,
}

/// Per-invocation, immutable execution context. Handed to the executor by
/// the worker and threaded through every step call via `ExecutionHandle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub deployment_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<Uuid>,
    pub root_execution_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_trace_context: Option<String>,
}

impl ExecutionContext {
    /// A fresh top-level execution: `root_execution_id == execution_id`,
    /// per the Data Model invariant.
    pub fn new_root(deployment_id: impl Into<String>) -> Self {
        let execution_id = Uuid::now_v7();
        Self {
            execution_id,
            deployment_id: deployment_id.into(),
            parent_execution_id: None,
            root_execution_id: execution_id,
            session_id: None,
            user_id: None,
            retry_count: 0,
            created_at: Utc::now(),
            initial_state: None,
            inbound_trace_context: None,
        }
    }

    /// A descendant execution: carries the ancestor's root unchanged.
    pub fn new_child(&self, deployment_id: impl Into<String>) -> Self {
        Self {
            execution_id: Uuid::now_v7(),
            deployment_id: deployment_id.into(),
            parent_execution_id: Some(self.execution_id),
            root_execution_id: self.root_execution_id,
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            retry_count: 0,
            created_at: Utc::now(),
            initial_state: None,
            inbound_trace_context: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.root_execution_id == self.execution_id
    }
}

/// Outcome persisted by the orchestrator for a single step, and cached
/// locally by the step helper for the lifetime of one dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub step_key: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub completed_at: DateTime<Utc>,
    /// For sub-workflow results: which execution actually produced the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema_tag: Option<String>,
}

impl StepOutput {
    pub fn success(step_key: impl Into<String>, outputs: serde_json::Value) -> Self {
        Self {
            step_key: step_key.into(),
            success: true,
            outputs: Some(outputs),
            error: None,
            completed_at: Utc::now(),
            source_execution_id: None,
            output_schema_tag: None,
        }
    }

    pub fn failure(step_key: impl Into<String>, error: StepError) -> Self {
        Self {
            step_key: step_key.into(),
            success: false,
            outputs: None,
            error: Some(error),
            completed_at: Utc::now(),
            source_execution_id: None,
            output_schema_tag: None,
        }
    }
}

/// Wire-serializable error payload; the `stack` field is always `None` when
/// produced by this SDK (see DESIGN.md) but is accepted when deserializing
/// errors surfaced by the orchestrator or by other-language workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// The resolved, per-item outcome of `batchInvokeAndWait` (Open Question
/// #1 in DESIGN.md: the structured form, not a raw-results union).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub workflow_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A rehydratable reference to a sub-workflow invocation, as returned by
/// `invoke`. Stored flat in step outputs, rehydrated on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowHandle {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub created_at: DateTime<Utc>,
    pub parent_execution_id: Option<Uuid>,
    pub root_execution_id: Uuid,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

/// Workflow registration metadata, as declared once at worker startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOptions {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub workflow_type: WorkflowKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_schema: Option<serde_json::Value>,
}

impl Default for WorkflowKind {
    fn default() -> Self {
        WorkflowKind::Workflow
    }
}

/// Options layered on top of `WorkflowOptions` for agent definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOptions {
    pub workflow: WorkflowOptions,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<crate::tools::ToolDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    #[serde(default = "default_guardrail_max_retries")]
    pub guardrail_max_retries: u32,
    #[serde(default = "default_conversation_history")]
    pub conversation_history: u32,
}

fn default_guardrail_max_retries() -> u32 {
    2
}

fn default_conversation_history() -> u32 {
    10
}

/// Per-invocation run options, supplied by the caller of `invoke`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_context: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_concurrency_limit: Option<u32>,
}

/// Free-form worker-local state map threaded through a single execution.
pub type StateMap = HashMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_context_has_matching_ids() {
        let ctx = ExecutionContext::new_root("dep-1");
        assert!(ctx.is_root());
        assert_eq!(ctx.execution_id, ctx.root_execution_id);
    }

    #[test]
    fn child_context_carries_root_unchanged() {
        let root = ExecutionContext::new_root("dep-1");
        let child = root.new_child("dep-1");
        assert_eq!(child.root_execution_id, root.root_execution_id);
        assert_eq!(child.parent_execution_id, Some(root.execution_id));
        assert!(!child.is_root());
    }
}
