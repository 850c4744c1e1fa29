//! Agent loop driver (spec.md §4.4): a fixed iteration over LLM calls,
//! tool calls, and stop-condition evaluation, built atop the step helper
//! so every LLM/tool call is replay-safe.

use std::sync::Arc;

use futures::StreamExt;
use polos_contracts::sse::event_type;
use polos_contracts::{AgentOptions, ConversationMessage, RunOptions, ToolCall, ToolPolicy};

use crate::compaction::{self, CompactionOptions};
use crate::context::{AgentContext, WorkflowContext};
use crate::error::{CoreError, Result};
use crate::executor::{validate_against_schema, WorkflowHandler};
use crate::step::RunStepOptions;
use crate::traits::{LlmCallConfig, LlmMessage, LlmProvider, LlmStreamEvent};

pub mod stop_conditions;
pub use stop_conditions::{AgentStepHistory, StopCondition};

/// Outcome of an ordered guardrail validator over the agent's final text
/// (spec.md §4.4.1, resolved shape; no corpus precedent — named but
/// unspecified by the distilled spec).
#[derive(Debug, Clone)]
pub enum GuardrailOutcome {
    Pass,
    Retry { feedback: String },
    Reject { reason: String },
}

pub type Guardrail = Arc<dyn Fn(&AgentStepHistory, &str) -> GuardrailOutcome + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AgentFinish {
    pub text: String,
    pub tool_calls_executed: Vec<String>,
    pub total_tokens: u64,
    pub steps: u32,
    pub conversation_id: String,
    pub guardrail_failed: bool,
}

/// Drives one agent turn to completion. Takes ownership of `ctx` for the
/// duration of the run (mirrors the executor handing a fresh context to
/// each dispatch).
pub async fn run_agent(
    ctx: &mut AgentContext,
    provider: Arc<dyn LlmProvider>,
    input: &str,
    stop_conditions: &[StopCondition],
    guardrails: &[Guardrail],
    guardrail_max_retries: u32,
    conversation_history_limit: u32,
) -> Result<AgentFinish> {
    // 1. Load conversation history.
    let mut messages = ctx
        .step
        .conversation_get(&ctx.conversation_id, conversation_history_limit)
        .await?;

    // 2. Compaction, if the loaded history exceeds budget.
    let compaction_opts = CompactionOptions {
        compaction_model: ctx.model.clone(),
        ..CompactionOptions::default()
    };
    let compacted = compaction::compact_if_needed(messages, &compaction_opts, &*provider).await?;
    messages = compacted.messages;

    // 3. Prepend the system prompt (not persisted; it's per-definition,
    // not part of the stored conversation); append the new input.
    if let Some(prompt) = &ctx.system_prompt {
        messages.insert(0, ConversationMessage::system(prompt.clone()));
    }

    let user_message = ConversationMessage::user(input);
    ctx.step
        .conversation_add(&ctx.conversation_id, &user_message)
        .await?;
    messages.push(user_message);

    let topic = ctx.handle.topic();
    let mut history = AgentStepHistory::default();
    let mut final_text = String::new();
    let mut guardrail_retries = 0u32;
    let mut guardrail_failed = false;

    loop {
        run_llm_turn(ctx, &provider, &topic, &mut messages, &mut history, &mut final_text).await?;

        if stop_conditions.iter().any(|c| c.evaluate(&history)) {
            break;
        }
    }

    // 4d. Schema-validated parse, gated on an `output_schema` being
    // configured; on failure, feed the parse error back to the model and
    // retry up to `guardrail_max_retries` times before giving up.
    if let Some(schema) = ctx.output_schema.clone() {
        loop {
            let outcome = serde_json::from_str::<serde_json::Value>(&final_text)
                .map_err(|e| e.to_string())
                .and_then(|parsed| validate_against_schema(&schema, &parsed));

            match outcome {
                Ok(()) => break,
                Err(reason) => {
                    if guardrail_retries >= guardrail_max_retries {
                        guardrail_failed = true;
                        break;
                    }
                    guardrail_retries += 1;
                    messages.push(ConversationMessage::user(format!(
                        "Your previous response did not match the required output schema ({reason}). Respond again with only JSON matching the schema."
                    )));
                    final_text.clear();
                    run_llm_turn(ctx, &provider, &topic, &mut messages, &mut history, &mut final_text).await?;
                }
            }
        }
    }

    if !guardrail_failed {
        for guardrail in guardrails {
            loop {
                match guardrail(&history, &final_text) {
                    GuardrailOutcome::Pass => break,
                    GuardrailOutcome::Retry { feedback } => {
                        if guardrail_retries >= guardrail_max_retries {
                            guardrail_failed = true;
                            break;
                        }
                        guardrail_retries += 1;
                        messages.push(ConversationMessage::user(feedback));
                        continue;
                    }
                    GuardrailOutcome::Reject { reason } => {
                        guardrail_failed = true;
                        return Err(CoreError::GuardrailFailure(reason));
                    }
                }
            }
            if guardrail_failed {
                break;
            }
        }
    }

    ctx.step
        .publish_event(
            &format!("finish_{}", ctx.workflow.execution_id()),
            &topic,
            event_type::AGENT_FINISH,
            serde_json::json!({
                "text": final_text,
                "total_tokens": history.total_tokens,
                "steps": history.steps,
                "conversation_id": ctx.conversation_id,
                "_metadata": { "execution_id": ctx.workflow.execution_id() },
            }),
        )
        .await?;

    Ok(AgentFinish {
        text: final_text,
        tool_calls_executed: history.executed_tools.clone(),
        total_tokens: history.total_tokens,
        steps: history.steps,
        conversation_id: ctx.conversation_id.clone(),
        guardrail_failed,
    })
}

/// One loop iteration (spec.md §4.4 step 4a-b): an LLM call plus, if the
/// response carries tool calls, a batched dispatch-and-wait. Appends every
/// produced message to `messages`/the persisted conversation and updates
/// `history`/`final_text` in place. Called once per main-loop pass and
/// again, with fresh feedback appended, for each schema-validation retry.
async fn run_llm_turn(
    ctx: &mut AgentContext,
    provider: &Arc<dyn LlmProvider>,
    topic: &str,
    messages: &mut Vec<ConversationMessage>,
    history: &mut AgentStepHistory,
    final_text: &mut String,
) -> Result<()> {
    let llm_key = format!("llm_{}", history.steps);
    let llm_messages: Vec<LlmMessage> = messages.iter().map(LlmMessage::from).collect();
    let call_config = LlmCallConfig {
        model: ctx.model.clone(),
        temperature: ctx.temperature,
        max_tokens: ctx.max_output_tokens,
        tools: ctx.tools.clone(),
    };

    let provider = Arc::clone(provider);
    let topic_for_step = topic.to_string();
    let client = ctx.step.clone();
    let llm_result: LlmStepResult = ctx
        .step
        .run(&llm_key, RunStepOptions::default(), move || {
            let provider = Arc::clone(&provider);
            let messages = llm_messages.clone();
            let config = call_config.clone();
            let topic = topic_for_step.clone();
            let client = Arc::clone(&client);
            async move { run_llm_call(&*provider, messages, &config, &topic, &*client).await }
        })
        .await?;

    history.steps += 1;
    history.total_tokens += llm_result.total_tokens;
    if !llm_result.text.is_empty() {
        final_text.push_str(&llm_result.text);
        history.assistant_text.push_str(&llm_result.text);
        let assistant_msg = ConversationMessage::assistant(llm_result.text.clone());
        ctx.step
            .conversation_add(&ctx.conversation_id, &assistant_msg)
            .await?;
        messages.push(assistant_msg);
    }

    if !llm_result.tool_calls.is_empty() {
        let assistant_calls = ConversationMessage::assistant_tool_calls(llm_result.tool_calls.clone());
        ctx.step
            .conversation_add(&ctx.conversation_id, &assistant_calls)
            .await?;
        messages.push(assistant_calls);

        for call in &llm_result.tool_calls {
            let tool_def = ctx.tools.iter().find(|t| t.name() == call.name);
            if matches!(tool_def.map(|t| t.policy()), Some(ToolPolicy::RequiresApproval)) {
                let approval_key = format!("tool_approval_{}", call.id);
                ctx.step
                    .suspend(&approval_key, serde_json::json!({ "tool_call": call }), None)
                    .await?;
            }
        }

        let key = format!("tool_batch_{}", history.steps);
        let items: Vec<(String, serde_json::Value, RunOptions)> = llm_result
            .tool_calls
            .iter()
            .map(|c| (format!("tool::{}", c.name), c.arguments.clone(), RunOptions::default()))
            .collect();
        let results = ctx.step.batch_invoke_and_wait(&key, items).await?;

        for (call, result) in llm_result.tool_calls.iter().zip(results.iter()) {
            history.executed_tools.push(call.name.clone());
            let tool_msg = if result.success {
                ConversationMessage::tool_result(call.id.clone(), result.result.clone(), None)
            } else {
                ConversationMessage::tool_result(call.id.clone(), None, result.error.clone())
            };
            ctx.step
                .conversation_add(&ctx.conversation_id, &tool_msg)
                .await?;
            messages.push(tool_msg);
        }
    }

    Ok(())
}

#[derive(serde::Serialize, serde::Deserialize)]
struct LlmStepResult {
    text: String,
    tool_calls: Vec<ToolCall>,
    total_tokens: u64,
}

/// Streams one LLM call, publishing a `text_delta` event per delta and
/// returning the aggregated text/tool calls/token usage.
async fn run_llm_call(
    provider: &dyn LlmProvider,
    messages: Vec<LlmMessage>,
    config: &LlmCallConfig,
    topic: &str,
    client: &crate::step::StepHelper,
) -> std::result::Result<LlmStepResult, String> {
    let mut stream = provider
        .chat_completion_stream(messages, config)
        .await
        .map_err(|e| e.to_string())?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut total_tokens = 0u64;

    while let Some(event) = stream.next().await {
        match event.map_err(|e| e.to_string())? {
            LlmStreamEvent::TextDelta(delta) => {
                let _ = client
                    .publish_event(
                        &format!("delta_{}", uuid::Uuid::now_v7()),
                        topic,
                        event_type::TEXT_DELTA,
                        serde_json::json!({ "content": delta }),
                    )
                    .await;
                text.push_str(&delta);
            }
            LlmStreamEvent::ToolCalls(calls) => {
                for call in &calls {
                    let _ = client
                        .publish_event(
                            &format!("toolcall_{}", call.id),
                            topic,
                            event_type::TOOL_CALL,
                            serde_json::to_value(call).unwrap_or_default(),
                        )
                        .await;
                }
                tool_calls = calls;
            }
            LlmStreamEvent::Done(meta) => {
                total_tokens = meta.total_tokens.unwrap_or(0) as u64;
            }
            LlmStreamEvent::Error(err) => return Err(err),
        }
    }

    Ok(LlmStepResult { text, tool_calls, total_tokens })
}

/// Adapts a registered `AgentOptions` definition to the executor's
/// `WorkflowHandler` seam: one dispatch becomes one `run_agent` call
/// (spec.md §4.4: "the agent handler is a single fixed driver invoked
/// like any workflow"). Built by `Registry::register_agent`; this is the
/// only production call site that constructs an `AgentContext`.
pub struct AgentHandler {
    options: AgentOptions,
    provider_name: String,
    provider: Arc<dyn LlmProvider>,
    stop_conditions: Vec<StopCondition>,
    guardrails: Vec<Guardrail>,
}

impl AgentHandler {
    pub fn new(
        options: AgentOptions,
        provider_name: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
        stop_conditions: Vec<StopCondition>,
        guardrails: Vec<Guardrail>,
    ) -> Self {
        Self {
            options,
            provider_name: provider_name.into(),
            provider,
            stop_conditions,
            guardrails,
        }
    }
}

#[async_trait::async_trait]
impl WorkflowHandler for AgentHandler {
    async fn handle(&self, ctx: &mut WorkflowContext, payload: serde_json::Value) -> Result<serde_json::Value> {
        let input = payload
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string());

        // Conversations persist across turns of the same session; a
        // session-less invocation falls back to its own execution id so
        // at least the run is internally coherent.
        let conversation_id = ctx
            .handle
            .execution
            .session_id
            .clone()
            .unwrap_or_else(|| ctx.execution_id().to_string());

        let mut agent_ctx = AgentContext {
            workflow: WorkflowContext {
                handle: ctx.handle.clone(),
                state: std::mem::take(&mut ctx.state),
                step: Arc::clone(&ctx.step),
            },
            agent_id: self.options.workflow.id.clone(),
            model: self.options.model.clone(),
            provider: self.provider_name.clone(),
            system_prompt: self.options.system_prompt.clone(),
            tools: self.options.tools.clone().unwrap_or_default(),
            temperature: self.options.temperature,
            max_output_tokens: self.options.max_output_tokens,
            output_schema: self.options.output_schema.clone(),
            conversation_id,
        };

        let finish = run_agent(
            &mut agent_ctx,
            Arc::clone(&self.provider),
            &input,
            &self.stop_conditions,
            &self.guardrails,
            self.options.guardrail_max_retries,
            self.options.conversation_history,
        )
        .await?;

        ctx.state = agent_ctx.workflow.state;

        Ok(serde_json::json!({
            "text": finish.text,
            "tool_calls_executed": finish.tool_calls_executed,
            "total_tokens": finish.total_tokens,
            "steps": finish.steps,
            "conversation_id": finish.conversation_id,
            "guardrail_failed": finish.guardrail_failed,
        }))
    }
}
