//! Explicit workflow registry (spec.md §9 Design Notes: "Explicit
//! `Registry` object instead of a process-global registry").

use std::collections::HashMap;
use std::sync::Arc;

use polos_contracts::{AgentOptions, WorkflowOptions};

use crate::agent::{AgentHandler, Guardrail, StopCondition};
use crate::executor::WorkflowDefinition;
use crate::traits::LlmProvider;

/// Holds every workflow/agent/tool definition a worker process knows
/// about. Built once at startup and handed to the executor/worker rather
/// than resolved through global/static state.
#[derive(Default)]
pub struct Registry {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: WorkflowDefinition) {
        self.definitions
            .insert(definition.options.id.clone(), Arc::new(definition));
    }

    /// Registers an agent definition (spec.md §4.4) by wrapping
    /// `agent::run_agent` in a `WorkflowHandler`, so the executor dispatches
    /// to it exactly like any other workflow.
    pub fn register_agent(
        &mut self,
        options: AgentOptions,
        provider_name: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
        stop_conditions: Vec<StopCondition>,
        guardrails: Vec<Guardrail>,
    ) {
        let workflow_options = options.workflow.clone();
        let handler = AgentHandler::new(options, provider_name, provider, stop_conditions, guardrails);
        self.register(WorkflowDefinition::new(workflow_options, Arc::new(handler)));
    }

    pub fn get(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(workflow_id).cloned()
    }

    pub fn options(&self) -> Vec<WorkflowOptions> {
        self.definitions.values().map(|d| d.options.clone()).collect()
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkflowContext;
    use crate::error::Result;
    use async_trait::async_trait;
    use polos_contracts::WorkflowKind;

    struct NoopHandler;

    #[async_trait]
    impl crate::executor::WorkflowHandler for NoopHandler {
        async fn handle(&self, _ctx: &mut WorkflowContext, payload: serde_json::Value) -> Result<serde_json::Value> {
            Ok(payload)
        }
    }

    fn options(id: &str) -> WorkflowOptions {
        WorkflowOptions {
            id: id.to_string(),
            description: None,
            workflow_type: WorkflowKind::Workflow,
            queue: None,
            payload_schema: None,
            state_schema: None,
        }
    }

    #[test]
    fn register_and_lookup_round_trips() {
        let mut registry = Registry::new();
        registry.register(WorkflowDefinition::new(options("wf_a"), Arc::new(NoopHandler)));
        assert!(registry.get("wf_a").is_some());
        assert!(registry.get("wf_b").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn options_lists_every_registered_definition() {
        let mut registry = Registry::new();
        registry.register(WorkflowDefinition::new(options("wf_a"), Arc::new(NoopHandler)));
        registry.register(WorkflowDefinition::new(options("wf_b"), Arc::new(NoopHandler)));
        assert_eq!(registry.options().len(), 2);
    }

    /// `register_agent` is the one production call site that turns a
    /// registered `AgentOptions` into a dispatchable `WorkflowHandler`
    /// driving `agent::run_agent` — not just something agent.rs's own
    /// tests construct.
    #[tokio::test]
    async fn register_agent_builds_a_handler_that_drives_run_agent() {
        use polos_client::{ClientConfig, OrchestratorClient};
        use polos_contracts::{AgentOptions, ExecutionContext};
        use wiremock::matchers::{method, path_regex};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        use crate::context::ExecutionHandle;
        use crate::step::StepHelper;
        use crate::testing::FakeLlmProvider;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/internal/executions/.*/steps$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/internal/conversation/.*/add$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/api/v1/conversation/.*/get$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/api/v1/events/publish$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": uuid::Uuid::now_v7(),
                "sequence_id": 1,
                "topic": "workflow/greeter/run",
                "event_type": "agent_finish",
                "data": {},
                "created_at": chrono::Utc::now(),
            })))
            .mount(&server)
            .await;

        let client = Arc::new(OrchestratorClient::new(ClientConfig {
            api_url: server.uri(),
            api_key: "k".into(),
            project_id: "p".into(),
            deployment_id: "d".into(),
        }));

        let mut registry = Registry::new();
        registry.register_agent(
            AgentOptions {
                workflow: WorkflowOptions {
                    workflow_type: polos_contracts::WorkflowKind::Agent,
                    ..options("greeter")
                },
                model: "fake-model".to_string(),
                system_prompt: None,
                tools: None,
                temperature: None,
                max_output_tokens: None,
                output_schema: None,
                guardrail_max_retries: 2,
                conversation_history: 10,
            },
            "fake",
            Arc::new(FakeLlmProvider::with_text("hi there")),
            vec![crate::agent::StopCondition::has_text(vec!["hi".to_string()])],
            Vec::new(),
        );

        let definition = registry.get("greeter").expect("agent should be registered");
        let handle = ExecutionHandle::new(ExecutionContext::new_root("d"), "greeter");
        let step = Arc::new(StepHelper::new(handle.clone(), client).await.unwrap());
        let mut ctx = WorkflowContext {
            handle,
            state: HashMap::new(),
            step,
        };

        let output = definition
            .handler
            .handle(&mut ctx, serde_json::json!("hello"))
            .await
            .unwrap();

        assert_eq!(output["text"], "hi there");
    }
}
