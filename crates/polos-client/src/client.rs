//! Typed facade over the orchestrator's HTTP/SSE API (spec.md §4.1, §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use polos_contracts::{
    ConversationMessage, RunOptions, StepError, StepOutput, WaitKind, WorkflowOptions,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::retry::RetryPolicy;
use crate::sse::{self, EnvelopeStream, RunEventStream};

/// Response to a single `invoke`/`batch_invoke` item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchInvokeItem {
    pub workflow_id: String,
    pub payload: Value,
    #[serde(default)]
    pub options: RunOptions,
}

/// Client for the orchestrator's HTTP/SSE API. One instance is built per
/// process and shared (the underlying `reqwest::Client` pools connections;
/// individual calls are independent, per spec.md §5).
#[derive(Clone)]
pub struct OrchestratorClient {
    http: reqwest::Client,
    config: ClientConfig,
    retry: RetryPolicy,
}

impl OrchestratorClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_retry_policy(config, RetryPolicy::exponential())
    }

    pub fn with_retry_policy(config: ClientConfig, retry: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            retry,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("X-Project-ID", &self.config.project_id)
    }

    /// Executes one logical call, retrying per `self.retry` on 5xx/429 and
    /// transport failures. 4xx (except 429) is terminal immediately.
    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    ) -> Result<T> {
        let mut attempt = 1;
        loop {
            let request = self.authed(build(&self.http));
            let outcome = request.send().await;

            let err = match outcome {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json::<T>()
                            .await
                            .map_err(|e| ClientError::Decode(e.to_string()));
                    }
                    let message = resp.text().await.unwrap_or_default();
                    ClientError::ApiError {
                        status: status.as_u16(),
                        message,
                    }
                }
                Err(e) if e.is_timeout() => {
                    ClientError::Timeout(std::time::Duration::from_secs(0))
                }
                Err(e) => ClientError::NetworkError(e.to_string()),
            };

            if !err.is_retryable() || !self.retry.has_attempts_remaining(attempt) {
                return Err(err);
            }
            tracing::warn!(attempt, error = %err, "retrying orchestrator request");
            tokio::time::sleep(self.retry.delay_for_attempt(attempt + 1)).await;
            attempt += 1;
        }
    }

    // -- Workflow invocation ------------------------------------------------

    pub async fn invoke(
        &self,
        workflow_id: &str,
        payload: Value,
        options: RunOptions,
    ) -> Result<InvokeResponse> {
        let path = format!("/api/v1/workflows/{workflow_id}/run");
        let body = serde_json::json!({ "payload": payload, "options": options });
        self.send(|c| c.post(self.url(&path)).json(&body)).await
    }

    pub async fn batch_invoke(&self, items: Vec<BatchInvokeItem>) -> Result<Vec<InvokeResponse>> {
        self.send(|c| {
            c.post(self.url("/api/v1/workflows/batch_run"))
                .json(&items)
        })
        .await
    }

    // -- Step persistence -----------------------------------------------

    pub async fn store_step_output(&self, execution_id: Uuid, output: &StepOutput) -> Result<()> {
        let path = format!("/internal/executions/{execution_id}/steps");
        self.send::<serde_json::Value>(|c| c.post(self.url(&path)).json(output))
            .await?;
        Ok(())
    }

    pub async fn get_step_output(
        &self,
        execution_id: Uuid,
        step_key: &str,
    ) -> Result<Option<StepOutput>> {
        let all = self.get_all_step_outputs(execution_id).await?;
        Ok(all.into_iter().find(|s| s.step_key == step_key))
    }

    pub async fn get_all_step_outputs(&self, execution_id: Uuid) -> Result<Vec<StepOutput>> {
        let path = format!("/internal/executions/{execution_id}/steps");
        self.send(|c| c.get(self.url(&path))).await
    }

    // -- Execution lifecycle ------------------------------------------------

    pub async fn complete(
        &self,
        execution_id: Uuid,
        result: Value,
        final_state: Value,
    ) -> Result<()> {
        let path = format!("/internal/executions/{execution_id}/complete");
        let body = serde_json::json!({ "result": result, "final_state": final_state });
        self.send::<serde_json::Value>(|c| c.post(self.url(&path)).json(&body))
            .await?;
        Ok(())
    }

    pub async fn fail(
        &self,
        execution_id: Uuid,
        error: StepError,
        retryable: bool,
        final_state: Value,
    ) -> Result<()> {
        let path = format!("/internal/executions/{execution_id}/fail");
        let body =
            serde_json::json!({ "error": error, "retryable": retryable, "final_state": final_state });
        self.send::<serde_json::Value>(|c| c.post(self.url(&path)).json(&body))
            .await?;
        Ok(())
    }

    pub async fn confirm_cancellation(&self, execution_id: Uuid) -> Result<()> {
        let path = format!("/api/v1/executions/{execution_id}/cancel");
        self.send::<serde_json::Value>(|c| c.post(self.url(&path)))
            .await?;
        Ok(())
    }

    pub async fn set_waiting(
        &self,
        execution_id: Uuid,
        kind: WaitKind,
        wait_until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let path = format!("/internal/executions/{execution_id}/wait");
        let body = serde_json::json!({ "type": kind, "wait_until": wait_until });
        self.send::<serde_json::Value>(|c| c.post(self.url(&path)).json(&body))
            .await?;
        Ok(())
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<Value> {
        let path = format!("/api/v1/executions/{execution_id}");
        self.send(|c| c.get(self.url(&path))).await
    }

    // -- Event bus ------------------------------------------------------

    pub async fn publish_event(
        &self,
        topic: &str,
        event_type: &str,
        data: Value,
    ) -> Result<polos_contracts::SseEnvelope> {
        let body = serde_json::json!({ "topic": topic, "event_type": event_type, "data": data });
        self.send(|c| c.post(self.url("/api/v1/events/publish")).json(&body))
            .await
    }

    /// Opens the SSE stream for a topic, starting from `from_sequence`
    /// (restartable cursor). If `run_execution_id` is given, iteration
    /// halts right after the matching finish event (spec.md §6).
    pub async fn stream_events(
        &self,
        topic: &str,
        from_sequence: u64,
        run_execution_id: Option<Uuid>,
    ) -> Result<EnvelopeStream> {
        let response = self
            .authed(self.http.get(self.url("/api/v1/events/stream")).query(&[
                ("topic", topic.to_string()),
                ("from_sequence", from_sequence.to_string()),
            ]))
            .send()
            .await
            .map_err(|e| ClientError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::ApiError { status, message });
        }

        let envelopes = sse::parse(response.bytes_stream());
        Ok(match run_execution_id {
            Some(id) => Box::pin(RunEventStream::new(envelopes, id)),
            None => envelopes,
        })
    }

    // -- Worker lifecycle -------------------------------------------------

    pub async fn register_worker(&self, worker: &WorkerRegistration) -> Result<()> {
        self.send::<serde_json::Value>(|c| {
            c.post(self.url("/api/v1/workers/register")).json(worker)
        })
        .await?;
        Ok(())
    }

    pub async fn register_deployment(&self, name: &str) -> Result<()> {
        let body = serde_json::json!({ "deployment_id": self.config.deployment_id, "name": name });
        self.send::<serde_json::Value>(|c| {
            c.post(self.url("/api/v1/workers/register")).json(&body)
        })
        .await?;
        Ok(())
    }

    pub async fn register_workflows(&self, workflows: &[WorkflowOptions]) -> Result<()> {
        self.send::<serde_json::Value>(|c| {
            c.post(self.url("/api/v1/workflows/register")).json(workflows)
        })
        .await?;
        Ok(())
    }

    pub async fn mark_online(&self, worker_id: &str) -> Result<()> {
        let path = format!("/api/v1/workers/{worker_id}/online");
        self.send::<serde_json::Value>(|c| c.post(self.url(&path)))
            .await?;
        Ok(())
    }

    pub async fn heartbeat(&self, worker_id: &str, load: u32) -> Result<()> {
        let path = format!("/api/v1/workers/{worker_id}/heartbeat");
        let body = serde_json::json!({ "load": load });
        self.send::<serde_json::Value>(|c| {
            c.post(self.url(&path))
                .header("X-Worker-ID", worker_id)
                .json(&body)
        })
        .await?;
        Ok(())
    }

    /// Tells the orchestrator this worker is shutting down and should be
    /// dropped from dispatch/liveness consideration (spec.md §4.7's drain
    /// step). Called once, after the in-flight drain completes.
    pub async fn deregister_worker(&self, worker_id: &str) -> Result<()> {
        let path = format!("/api/v1/workers/{worker_id}/deregister");
        self.send::<serde_json::Value>(|c| c.post(self.url(&path)).header("X-Worker-ID", worker_id))
            .await?;
        Ok(())
    }

    /// Lists worker identifiers the orchestrator currently considers
    /// active (registered and heartbeating within its own TTL). Used by
    /// the sandbox manager's orphan sweep (spec.md §4.6 phase 2) to decide
    /// whether a labeled container's owning worker is still alive.
    pub async fn list_active_workers(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct WorkerSummary {
            worker_id: String,
        }
        let workers: Vec<WorkerSummary> = self
            .send(|c| c.get(self.url("/api/v1/workers")))
            .await?;
        Ok(workers.into_iter().map(|w| w.worker_id).collect())
    }

    // -- Conversation history ---------------------------------------------

    pub async fn conversation_add(
        &self,
        conversation_id: &str,
        message: &ConversationMessage,
    ) -> Result<()> {
        let path = format!("/internal/conversation/{conversation_id}/add");
        self.send::<serde_json::Value>(|c| c.post(self.url(&path)).json(message))
            .await?;
        Ok(())
    }

    pub async fn conversation_get(
        &self,
        conversation_id: &str,
        limit: u32,
    ) -> Result<Vec<ConversationMessage>> {
        let path = format!("/api/v1/conversation/{conversation_id}/get");
        self.send(|c| c.get(self.url(&path)).query(&[("limit", limit)]))
            .await
    }

    // -- Schedules --------------------------------------------------------

    pub async fn create_schedule(&self, schedule: &Value) -> Result<Value> {
        self.send(|c| c.post(self.url("/api/v1/schedules")).json(schedule))
            .await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub runtime: String,
    pub agent_ids: Vec<String>,
    pub tool_ids: Vec<String>,
    pub workflow_ids: Vec<String>,
    pub push_endpoint_url: Option<String>,
}
