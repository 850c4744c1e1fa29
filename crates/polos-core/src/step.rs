//! The step helper: durability primitive exposed to handlers (spec.md
//! §4.2). Every operation is keyed by a caller-supplied string unique
//! within the execution; replaying the same key returns the previously
//! recorded outcome without re-running the side effect (testable
//! property 1).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::Instrument;
use uuid::Uuid;

use polos_client::OrchestratorClient;
use polos_contracts::{
    BatchResult, ConversationMessage, RunOptions, SseEnvelope, StepError, StepOutput, WaitKind,
    WorkflowHandle,
};

use crate::context::ExecutionHandle;
use crate::error::{CoreError, Result};

/// The reason a step suspended the execution. Carried by `CoreError::Wait`
/// so the executor can report `waiting=true` without treating it as a
/// failure (spec.md §4.3 outcome classification).
#[derive(Debug, Clone)]
pub enum WaitReason {
    Time {
        wait_until: DateTime<Utc>,
    },
    Event {
        topic: String,
        timeout: Option<Duration>,
    },
    Suspend {
        key: String,
        timeout: Option<Duration>,
    },
    SubWorkflow {
        execution_id: Uuid,
    },
}

/// Options for `StepHelper::run`'s internal retry loop.
#[derive(Debug, Clone)]
pub struct RunStepOptions {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RunStepOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

fn default_wait_threshold() -> Duration {
    std::env::var("POLOS_WAIT_THRESHOLD_SECONDS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(10))
}

fn decode<T: DeserializeOwned>(output: &StepOutput) -> Result<T> {
    if output.success {
        serde_json::from_value(output.outputs.clone().unwrap_or(Value::Null))
            .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))
    } else {
        Err(CoreError::StepExecution(
            output
                .error
                .clone()
                .map(|e| e.message)
                .unwrap_or_else(|| "step failed".to_string()),
        ))
    }
}

/// Bound to one execution. Loads all recorded step outputs on
/// construction (the "replay load" stage of the executor) and keeps them
/// in a local cache for the lifetime of this dispatch.
pub struct StepHelper {
    handle: ExecutionHandle,
    client: Arc<OrchestratorClient>,
    cache: Mutex<HashMap<String, StepOutput>>,
    cancelled: Arc<AtomicBool>,
    wait_threshold: Duration,
}

impl StepHelper {
    pub async fn new(handle: ExecutionHandle, client: Arc<OrchestratorClient>) -> Result<Self> {
        Self::with_cancellation_flag(handle, client, Arc::new(AtomicBool::new(false))).await
    }

    pub async fn with_cancellation_flag(
        handle: ExecutionHandle,
        client: Arc<OrchestratorClient>,
        cancelled: Arc<AtomicBool>,
    ) -> Result<Self> {
        let outputs = client
            .get_all_step_outputs(handle.execution.execution_id)
            .await?;
        let cache = outputs
            .into_iter()
            .map(|o| (o.step_key.clone(), o))
            .collect();
        Ok(Self {
            handle,
            client,
            cache: Mutex::new(cache),
            cancelled,
            wait_threshold: default_wait_threshold(),
        })
    }

    pub fn execution_id(&self) -> Uuid {
        self.handle.execution.execution_id
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(CoreError::Cancellation);
        }
        Ok(())
    }

    fn cached(&self, key: &str) -> Option<StepOutput> {
        self.cache.lock().unwrap().get(key).cloned()
    }

    async fn record(&self, output: StepOutput) -> Result<()> {
        self.client
            .store_step_output(self.handle.execution.execution_id, &output)
            .await?;
        self.cache
            .lock()
            .unwrap()
            .insert(output.step_key.clone(), output);
        Ok(())
    }

    /// Execute `f`, retrying transient failures with capped exponential
    /// backoff, and persist the outcome. On replay with a cached outcome
    /// for `key`, `f` is never invoked.
    pub async fn run<T, F, Fut>(&self, key: &str, opts: RunStepOptions, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, String>>,
    {
        self.check_cancelled()?;
        if let Some(cached) = self.cached(key) {
            return decode(&cached);
        }

        let mut attempt = 1u32;
        loop {
            match f().await {
                Ok(value) => {
                    let json =
                        serde_json::to_value(&value).map_err(|e| CoreError::Internal(e.into()))?;
                    self.record(StepOutput::success(key, json)).await?;
                    return Ok(value);
                }
                Err(message) => {
                    if attempt > opts.max_retries {
                        let error = StepError::new(message);
                        self.record(StepOutput::failure(key, error.clone())).await?;
                        return Err(CoreError::StepExecution(error.message));
                    }
                    let delay = (opts.base_delay * 2u32.pow(attempt - 1)).min(opts.max_delay);
                    tracing::debug!(step = key, attempt, ?delay, "retrying step");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn deterministic<T, G>(&self, key: &str, generate: G) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        G: FnOnce() -> T,
    {
        self.check_cancelled()?;
        if let Some(cached) = self.cached(key) {
            return decode(&cached);
        }
        let value = generate();
        let json = serde_json::to_value(&value).map_err(|e| CoreError::Internal(e.into()))?;
        self.record(StepOutput::success(key, json)).await?;
        Ok(value)
    }

    /// Deterministic, replay-stable UUID (testable property 2).
    pub async fn uuid(&self, key: &str) -> Result<Uuid> {
        self.deterministic(key, Uuid::now_v7).await
    }

    /// Deterministic, replay-stable timestamp.
    pub async fn now(&self, key: &str) -> Result<DateTime<Utc>> {
        self.deterministic(key, Utc::now).await
    }

    /// Deterministic, replay-stable random value in `[0, 1)`.
    pub async fn random(&self, key: &str) -> Result<f64> {
        self.deterministic(key, || rand_f64()).await
    }

    fn child_run_options(&self, opts: RunOptions) -> RunOptions {
        RunOptions {
            parent_execution_id: Some(self.handle.execution.execution_id),
            root_execution_id: Some(self.handle.execution.root_execution_id),
            session_id: opts
                .session_id
                .or_else(|| self.handle.execution.session_id.clone()),
            user_id: opts
                .user_id
                .or_else(|| self.handle.execution.user_id.clone()),
            ..opts
        }
    }

    /// Start a sub-workflow and cache a rehydratable handle to it.
    pub async fn invoke(
        &self,
        key: &str,
        workflow_id: &str,
        payload: Value,
        opts: RunOptions,
    ) -> Result<WorkflowHandle> {
        self.check_cancelled()?;
        if let Some(cached) = self.cached(key) {
            return decode(&cached);
        }
        let resp = self
            .client
            .invoke(workflow_id, payload, self.child_run_options(opts))
            .await?;
        let wh = WorkflowHandle {
            execution_id: resp.execution_id,
            workflow_id: resp.workflow_id,
            created_at: resp.created_at,
            parent_execution_id: Some(self.handle.execution.execution_id),
            root_execution_id: self.handle.execution.root_execution_id,
            session_id: self.handle.execution.session_id.clone(),
            user_id: self.handle.execution.user_id.clone(),
        };
        self.record(StepOutput::success(
            key,
            serde_json::to_value(&wh).map_err(|e| CoreError::Internal(e.into()))?,
        ))
        .await?;
        Ok(wh)
    }

    /// Start a sub-workflow and suspend until it resolves; on resume the
    /// cached outcome IS the sub-workflow's result.
    pub async fn invoke_and_wait(
        &self,
        key: &str,
        workflow_id: &str,
        payload: Value,
        opts: RunOptions,
    ) -> Result<Value> {
        self.check_cancelled()?;
        if let Some(cached) = self.cached(key) {
            return decode(&cached);
        }
        let resp = self
            .client
            .invoke(workflow_id, payload, self.child_run_options(opts))
            .await?;
        self.client
            .set_waiting(self.handle.execution.execution_id, WaitKind::Suspend, None)
            .await?;
        Err(CoreError::Wait(WaitReason::SubWorkflow {
            execution_id: resp.execution_id,
        }))
    }

    /// Fan out `items` (each `(workflow_id, payload, opts)`), caching a
    /// handle per item.
    pub async fn batch_invoke(
        &self,
        key: &str,
        items: Vec<(String, Value, RunOptions)>,
    ) -> Result<Vec<WorkflowHandle>> {
        self.check_cancelled()?;
        if let Some(cached) = self.cached(key) {
            return decode(&cached);
        }
        let mut handles = Vec::with_capacity(items.len());
        for (workflow_id, payload, opts) in items {
            let resp = self
                .client
                .invoke(&workflow_id, payload, self.child_run_options(opts))
                .await?;
            handles.push(WorkflowHandle {
                execution_id: resp.execution_id,
                workflow_id: resp.workflow_id,
                created_at: resp.created_at,
                parent_execution_id: Some(self.handle.execution.execution_id),
                root_execution_id: self.handle.execution.root_execution_id,
                session_id: self.handle.execution.session_id.clone(),
                user_id: self.handle.execution.user_id.clone(),
            });
        }
        self.record(StepOutput::success(
            key,
            serde_json::to_value(&handles).map_err(|e| CoreError::Internal(e.into()))?,
        ))
        .await?;
        Ok(handles)
    }

    /// Fan out and suspend; on resume, the cached outcome is a
    /// `Vec<BatchResult>` preserving per-item success/error (spec.md §9
    /// Open Question #1, resolved to the structured form; testable
    /// scenario F).
    pub async fn batch_invoke_and_wait(
        &self,
        key: &str,
        items: Vec<(String, Value, RunOptions)>,
    ) -> Result<Vec<BatchResult>> {
        self.check_cancelled()?;
        if let Some(cached) = self.cached(key) {
            return decode(&cached);
        }
        for (workflow_id, payload, opts) in items {
            self.client
                .invoke(&workflow_id, payload, self.child_run_options(opts))
                .await?;
        }
        self.client
            .set_waiting(self.handle.execution.execution_id, WaitKind::Suspend, None)
            .await?;
        Err(CoreError::Wait(WaitReason::Suspend {
            key: key.to_string(),
            timeout: None,
        }))
    }

    /// Sleep. Short waits (<= `POLOS_WAIT_THRESHOLD_SECONDS`, default 10s)
    /// happen locally; longer waits suspend via the orchestrator.
    pub async fn wait_for(&self, key: &str, duration: Duration) -> Result<()> {
        self.check_cancelled()?;
        if self.cached(key).is_some() {
            return Ok(());
        }
        if duration <= self.wait_threshold {
            tokio::time::sleep(duration).await;
            self.record(StepOutput::success(key, Value::Null)).await?;
            Ok(())
        } else {
            let wait_until = Utc::now()
                + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
            self.client
                .set_waiting(
                    self.handle.execution.execution_id,
                    WaitKind::Time,
                    Some(wait_until),
                )
                .await?;
            Err(CoreError::Wait(WaitReason::Time { wait_until }))
        }
    }

    pub async fn wait_until(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let now = Utc::now();
        let duration = (at - now).to_std().unwrap_or(Duration::ZERO);
        self.wait_for(key, duration).await
    }

    /// Pause until an event on `topic` arrives (or `timeout` elapses).
    pub async fn wait_for_event(
        &self,
        key: &str,
        topic: &str,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.check_cancelled()?;
        if let Some(cached) = self.cached(key) {
            return decode(&cached);
        }
        self.client
            .set_waiting(self.handle.execution.execution_id, WaitKind::Event, None)
            .await?;
        Err(CoreError::Wait(WaitReason::Event {
            topic: topic.to_string(),
            timeout,
        }))
    }

    pub async fn publish_event(
        &self,
        key: &str,
        topic: &str,
        event_type: &str,
        data: Value,
    ) -> Result<SseEnvelope> {
        self.check_cancelled()?;
        if let Some(cached) = self.cached(key) {
            return decode(&cached);
        }
        let envelope = self.client.publish_event(topic, event_type, data).await?;
        self.record(StepOutput::success(
            key,
            serde_json::to_value(&envelope).map_err(|e| CoreError::Internal(e.into()))?,
        ))
        .await?;
        Ok(envelope)
    }

    /// Publish `suspend_<key>` and pause for a matching `resume_<key>`.
    pub async fn suspend(
        &self,
        key: &str,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.check_cancelled()?;
        if let Some(cached) = self.cached(key) {
            return decode(&cached);
        }
        self.client
            .publish_event(
                &self.handle.topic(),
                &polos_contracts::sse::event_type::suspend(key),
                data,
            )
            .await?;
        self.client
            .set_waiting(self.handle.execution.execution_id, WaitKind::Suspend, None)
            .await?;
        Err(CoreError::Wait(WaitReason::Suspend {
            key: key.to_string(),
            timeout,
        }))
    }

    /// Emit the `resume_<step_key>` event targeting another execution's
    /// suspended step.
    pub async fn resume(
        &self,
        target_workflow_id: &str,
        target_execution_id: Uuid,
        target_step_key: &str,
        data: Value,
    ) -> Result<()> {
        self.check_cancelled()?;
        let topic = polos_contracts::sse::workflow_topic(target_workflow_id, target_execution_id);
        self.client
            .publish_event(
                &topic,
                &polos_contracts::sse::event_type::resume(target_step_key),
                data,
            )
            .await?;
        Ok(())
    }

    /// Open a span around `f`. Not a durable step: never checked against
    /// or written to the cache.
    pub async fn trace<T, F, Fut>(&self, name: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let span = tracing::info_span!("trace", name = %name);
        f().instrument(span).await
    }

    pub async fn conversation_add(
        &self,
        conversation_id: &str,
        message: &ConversationMessage,
    ) -> Result<()> {
        self.client
            .conversation_add(conversation_id, message)
            .await?;
        Ok(())
    }

    pub async fn conversation_get(
        &self,
        conversation_id: &str,
        limit: u32,
    ) -> Result<Vec<ConversationMessage>> {
        Ok(self.client.conversation_get(conversation_id, limit).await?)
    }
}

fn rand_f64() -> f64 {
    use rand::Rng;
    rand::thread_rng().gen_range(0.0..1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use polos_client::ClientConfig;
    use polos_contracts::ExecutionContext;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn helper_against(server: &MockServer) -> StepHelper {
        Mock::given(method("GET"))
            .and(path_regex(r"^/internal/executions/.*/steps$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/internal/executions/.*/steps$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(server)
            .await;

        let client = Arc::new(OrchestratorClient::new(ClientConfig {
            api_url: server.uri(),
            api_key: "k".into(),
            project_id: "p".into(),
            deployment_id: "d".into(),
        }));
        let handle = ExecutionHandle::new(ExecutionContext::new_root("d"), "wf");
        StepHelper::new(handle, client).await.unwrap()
    }

    #[tokio::test]
    async fn run_invokes_fn_at_most_once_across_replays() {
        let server = MockServer::start().await;
        let helper = helper_against(&server).await;
        let calls = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&calls);
        let first: i64 = helper
            .run("step-1", RunStepOptions::default(), || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(first, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Simulate replay: same key is already in the local cache.
        let c = Arc::clone(&calls);
        let second: i64 = helper
            .run("step-1", RunStepOptions::default(), || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(0)
                }
            })
            .await
            .unwrap();
        assert_eq!(second, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "fn must not run again");
    }

    #[tokio::test]
    async fn uuid_is_stable_across_calls_with_same_key() {
        let server = MockServer::start().await;
        let helper = helper_against(&server).await;
        let a = helper.uuid("gen-id").await.unwrap();
        let b = helper.uuid("gen-id").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn run_retries_then_persists_step_execution_error() {
        let server = MockServer::start().await;
        let helper = helper_against(&server).await;
        let attempts = Arc::new(AtomicU32::new(0));
        let a = Arc::clone(&attempts);

        let opts = RunStepOptions {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let result: Result<i64> = helper
            .run("always-fails", opts, || {
                let a = Arc::clone(&a);
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err("boom".to_string())
                }
            })
            .await;

        assert!(matches!(result, Err(CoreError::StepExecution(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
