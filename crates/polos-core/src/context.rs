//! `ExecutionHandle`, `WorkflowContext`, and `AgentContext` (spec.md §3,
//! §9 Design Notes: an explicit handle threaded through every call instead
//! of ambient task-local storage).

use std::sync::Arc;

use polos_contracts::{sse::workflow_topic, ExecutionContext, StateMap, ToolDefinition};

use crate::step::StepHelper;

/// Identifies which execution a step/agent call belongs to, and which
/// topic its events publish to. Cheap to clone; passed explicitly rather
/// than resolved from thread-local state.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    pub execution: ExecutionContext,
    pub workflow_id: String,
    pub root_workflow_id: String,
}

impl ExecutionHandle {
    pub fn new(execution: ExecutionContext, workflow_id: impl Into<String>) -> Self {
        let workflow_id = workflow_id.into();
        Self {
            root_workflow_id: workflow_id.clone(),
            workflow_id,
            execution,
        }
    }

    pub fn topic(&self) -> String {
        workflow_topic(&self.root_workflow_id, self.execution.root_execution_id)
    }
}

/// Handed to every workflow handler. Owned by the executor for the
/// duration of one run; the handler borrows it.
pub struct WorkflowContext {
    pub handle: ExecutionHandle,
    pub state: StateMap,
    pub step: Arc<StepHelper>,
}

impl WorkflowContext {
    pub fn execution_id(&self) -> uuid::Uuid {
        self.handle.execution.execution_id
    }
}

/// `WorkflowContext` plus the fields an agent handler additionally needs.
pub struct AgentContext {
    pub workflow: WorkflowContext,
    pub agent_id: String,
    pub model: String,
    pub provider: String,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    /// JSON schema the final text must parse against (spec.md §4.4 step
    /// 4d). `None` skips the schema-validated-parse/guardrail-retry path
    /// entirely.
    pub output_schema: Option<serde_json::Value>,
    pub conversation_id: String,
}

impl std::ops::Deref for AgentContext {
    type Target = WorkflowContext;
    fn deref(&self) -> &Self::Target {
        &self.workflow
    }
}

impl std::ops::DerefMut for AgentContext {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.workflow
    }
}
