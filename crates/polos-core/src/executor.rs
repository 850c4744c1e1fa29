//! The executor (spec.md §4.3): runs one workflow/agent/tool invocation
//! through the eleven ordered stages (replay load, state init, payload
//! validation, context assembly, tracing, start event, onStart hooks,
//! handler invocation, state capture, onEnd hooks, finish event),
//! generalized from a fixed setup → llm → tool → finalize pipeline into
//! an open-ended handler dispatch.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use polos_client::OrchestratorClient;
use polos_contracts::sse::event_type;
use polos_contracts::{ExecutionContext, StateMap, StepError, WorkflowKind, WorkflowOptions};

use crate::context::{ExecutionHandle, WorkflowContext};
use crate::error::{CoreError, Result};
use crate::step::StepHelper;

/// Implemented by every registered workflow/agent/tool handler. The
/// executor owns `ctx` for the duration of one dispatch; handlers borrow
/// it mutably to read/write state and reach the step helper.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn handle(&self, ctx: &mut WorkflowContext, payload: Value) -> Result<Value>;
}

/// A hook run before (`onStart`) or after (`onEnd`) the handler. `onStart`
/// may rewrite the payload or abort with a failure; `onEnd` may rewrite
/// the output.
#[async_trait]
pub trait StartHook: Send + Sync {
    async fn run(&self, ctx: &WorkflowContext, payload: Value) -> Result<Value>;
}

#[async_trait]
pub trait EndHook: Send + Sync {
    async fn run(&self, ctx: &WorkflowContext, output: Value) -> Result<Value>;
}

pub struct WorkflowDefinition {
    pub options: WorkflowOptions,
    pub handler: Arc<dyn WorkflowHandler>,
    pub on_start: Vec<Arc<dyn StartHook>>,
    pub on_end: Vec<Arc<dyn EndHook>>,
}

impl WorkflowDefinition {
    pub fn new(options: WorkflowOptions, handler: Arc<dyn WorkflowHandler>) -> Self {
        Self {
            options,
            handler,
            on_start: Vec::new(),
            on_end: Vec::new(),
        }
    }

    pub fn is_tool(&self) -> bool {
        self.options.workflow_type == WorkflowKind::Tool
    }
}

/// The outcome of one `Executor::execute` call, mapped 1:1 onto spec.md
/// §4.3's `{success, result|error, finalState, waiting?, retryable?}`.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<StepError>,
    pub final_state: Value,
    pub waiting: bool,
    pub retryable: bool,
}

pub struct Executor {
    client: Arc<OrchestratorClient>,
}

impl Executor {
    pub fn new(client: Arc<OrchestratorClient>) -> Self {
        Self { client }
    }

    /// Runs one invocation through all eleven stages.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        payload: Value,
        execution: ExecutionContext,
        cancelled: Arc<AtomicBool>,
    ) -> ExecutionOutcome {
        match self.execute_inner(definition, payload, execution, cancelled).await {
            Ok(outcome) => outcome,
            Err(err) => classify(&err, definition.is_tool(), Value::Null),
        }
    }

    async fn execute_inner(
        &self,
        definition: &WorkflowDefinition,
        payload: Value,
        execution: ExecutionContext,
        cancelled: Arc<AtomicBool>,
    ) -> Result<ExecutionOutcome> {
        // 1. Replay load.
        let handle = ExecutionHandle::new(execution.clone(), definition.options.id.clone());
        let step = Arc::new(
            StepHelper::with_cancellation_flag(handle.clone(), Arc::clone(&self.client), cancelled)
                .await?,
        );

        // 2. State init.
        let state: StateMap = match &execution.initial_state {
            Some(Value::Object(map)) => map.clone().into_iter().collect(),
            _ => StateMap::new(),
        };

        // 3. Payload validation.
        if let Some(schema) = &definition.options.payload_schema {
            validate_against_schema(schema, &payload)
                .map_err(CoreError::Validation)?;
        }

        // 4. Context assembly.
        let mut ctx = WorkflowContext {
            handle: handle.clone(),
            state,
            step: Arc::clone(&step),
        };

        // 5. Tracing.
        let span_name = format!(
            "{}.{}",
            workflow_type_label(definition.options.workflow_type),
            definition.options.id
        );
        let trace_id = execution
            .inbound_trace_context
            .clone()
            .unwrap_or_else(|| deterministic_trace_id(execution.root_execution_id));
        let span = tracing::info_span!("workflow", name = %span_name, trace_id = %trace_id);
        let _entered = span.enter();

        // 6. Start event.
        let topic = handle.topic();
        let start_event = format!("{}_start", workflow_type_label(definition.options.workflow_type));
        self.client
            .publish_event(
                &topic,
                &start_event,
                serde_json::json!({
                    "payload": payload,
                    "_metadata": { "execution_id": execution.execution_id },
                }),
            )
            .await
            .ok();

        // 7. onStart hooks.
        let mut effective_payload = payload;
        for hook in &definition.on_start {
            effective_payload = hook.run(&ctx, effective_payload).await?;
        }

        // 8. Handler invocation.
        let handler_result = definition.handler.handle(&mut ctx, effective_payload).await;

        // 9. State capture.
        let final_state = serde_json::to_value(&ctx.state).unwrap_or(Value::Null);

        match handler_result {
            Ok(mut output) => {
                // 10. onEnd hooks.
                for hook in &definition.on_end {
                    output = hook.run(&ctx, output).await?;
                }

                // 11. Finish event.
                let finish_event =
                    format!("{}_finish", workflow_type_label(definition.options.workflow_type));
                self.client
                    .publish_event(
                        &topic,
                        &finish_event,
                        serde_json::json!({
                            "result": output,
                            "_metadata": { "execution_id": execution.execution_id },
                        }),
                    )
                    .await
                    .ok();
                self.client
                    .complete(execution.execution_id, output.clone(), final_state.clone())
                    .await
                    .ok();

                Ok(ExecutionOutcome {
                    success: true,
                    result: Some(output),
                    error: None,
                    final_state,
                    waiting: false,
                    retryable: false,
                })
            }
            Err(err) => Ok(classify(&err, definition.is_tool(), final_state)),
        }
    }
}

fn classify(err: &CoreError, is_tool: bool, final_state: Value) -> ExecutionOutcome {
    if err.is_wait() {
        return ExecutionOutcome {
            success: false,
            result: None,
            error: None,
            final_state,
            waiting: true,
            retryable: false,
        };
    }

    let retryable = err.is_retryable(is_tool);
    ExecutionOutcome {
        success: false,
        result: None,
        error: Some(StepError::new(err.to_string())),
        final_state,
        waiting: false,
        retryable,
    }
}

fn workflow_type_label(kind: WorkflowKind) -> &'static str {
    match kind {
        WorkflowKind::Workflow => "workflow",
        WorkflowKind::Agent => "agent",
        WorkflowKind::Tool => "tool",
    }
}

/// Reinterprets the root execution id's bytes as an OTel-shaped 128-bit
/// trace identifier so every run under the same root shares one trace.
fn deterministic_trace_id(root_execution_id: Uuid) -> String {
    root_execution_id
        .as_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Minimal structural validator: checks `required` keys are present when
/// `schema.type == "object"`. No corpus repo pulls in a JSON Schema crate
/// for this; a hand-rolled subset check is adequate for the shapes
/// `WorkflowOptions::payload_schema` actually carries (see DESIGN.md).
pub(crate) fn validate_against_schema(schema: &Value, payload: &Value) -> std::result::Result<(), String> {
    let Some(obj) = schema.as_object() else {
        return Ok(());
    };
    if obj.get("type").and_then(Value::as_str) == Some("object") {
        let Some(payload_obj) = payload.as_object() else {
            return Err("payload schema requires an object payload".to_string());
        };
        if let Some(required) = obj.get("required").and_then(Value::as_array) {
            for key in required {
                let key = key.as_str().unwrap_or_default();
                if !payload_obj.contains_key(key) {
                    return Err(format!("payload missing required field '{key}'"));
                }
            }
        }
    }
    Ok(())
}
