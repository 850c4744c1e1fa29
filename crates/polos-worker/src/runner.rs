//! Concurrency-gated dispatch (spec.md §4.7 execution lifecycle): a
//! semaphore sized to `maxConcurrentWorkflows`, a `watch`-channel shutdown
//! signal, and a ticking heartbeat loop selected against it with
//! `tokio::select!`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use polos_client::OrchestratorClient;
use polos_contracts::ExecutionContext;
use polos_core::executor::Executor;
use polos_core::registry::Registry;
use polos_sandbox::SandboxManager;

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};

struct Inflight {
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Owns the worker's concurrency slot, in-flight executions, and heartbeat
/// loop. One instance per worker process.
pub struct Runner {
    client: Arc<OrchestratorClient>,
    executor: Arc<Executor>,
    registry: Arc<Registry>,
    sandbox_manager: Option<Arc<SandboxManager>>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    inflight: Mutex<HashMap<Uuid, Inflight>>,
    accepting: AtomicBool,
    load: AtomicU32,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    heartbeat_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Runner {
    pub fn new(
        client: Arc<OrchestratorClient>,
        executor: Arc<Executor>,
        registry: Arc<Registry>,
        sandbox_manager: Option<Arc<SandboxManager>>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let max_concurrent = config.max_concurrent_workflows;
        Arc::new(Self {
            client,
            executor,
            registry,
            sandbox_manager,
            config,
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
            inflight: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            load: AtomicU32::new(0),
            shutdown_tx,
            shutdown_rx,
            heartbeat_handle: std::sync::Mutex::new(None),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn current_load(&self) -> u32 {
        self.load.load(Ordering::Relaxed)
    }

    /// Starts the fixed-cadence heartbeat loop (spec.md §4.7 startup
    /// sequence: "begin heartbeats").
    pub fn start_heartbeat(self: &Arc<Self>) {
        let runner = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.config.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let load = runner.current_load();
                        if let Err(e) = runner.client.heartbeat(runner.worker_id(), load).await {
                            tracing::warn!(error = %e, "heartbeat failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        *self.heartbeat_handle.lock().unwrap() = Some(handle);
    }

    /// Acquires a concurrency slot and dispatches to the executor inside a
    /// spawned task (spec.md §4.7 steps 2-5). Returns as soon as the task
    /// is spawned; outcome reporting happens in the background.
    pub async fn dispatch(
        self: &Arc<Self>,
        workflow_id: String,
        execution: ExecutionContext,
        payload: Value,
    ) -> Result<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(WorkerError::ShuttingDown);
        }

        let definition = self
            .registry
            .get(&workflow_id)
            .ok_or_else(|| WorkerError::UnknownWorkflow(workflow_id.clone()))?;

        let permit = Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|_| WorkerError::Saturated(self.config.max_concurrent_workflows))?;

        let execution_id = execution.execution_id;
        let cancelled = Arc::new(AtomicBool::new(false));
        let runner = Arc::clone(self);
        let cancelled_for_task = Arc::clone(&cancelled);

        self.load.fetch_add(1, Ordering::Relaxed);

        let handle = tokio::spawn(async move {
            let _permit = permit;
            let outcome = runner
                .executor
                .execute(&definition, payload, execution, cancelled_for_task.clone())
                .await;

            if outcome.waiting {
                // The step helper already marked the execution as waiting;
                // nothing further to report (spec.md §4.7 step 4).
            } else if outcome.success {
                if let Err(e) = runner
                    .client
                    .complete(
                        execution_id,
                        outcome.result.unwrap_or(Value::Null),
                        outcome.final_state,
                    )
                    .await
                {
                    tracing::warn!(%execution_id, error = %e, "failed to report completion");
                }
            } else if cancelled_for_task.load(Ordering::Relaxed) {
                if let Err(e) = runner.client.confirm_cancellation(execution_id).await {
                    tracing::warn!(%execution_id, error = %e, "failed to confirm cancellation");
                }
            } else if let Err(e) = runner
                .client
                .fail(
                    execution_id,
                    outcome
                        .error
                        .unwrap_or_else(|| polos_contracts::StepError::new("unknown error")),
                    outcome.retryable,
                    outcome.final_state,
                )
                .await
            {
                tracing::warn!(%execution_id, error = %e, "failed to report failure");
            }

            if let Some(sandbox_manager) = &runner.sandbox_manager {
                if let Err(e) = sandbox_manager.on_execution_complete(execution_id).await {
                    tracing::warn!(%execution_id, error = %e, "sandbox cleanup failed");
                }
            }

            runner.load.fetch_sub(1, Ordering::Relaxed);
            runner.inflight.lock().await.remove(&execution_id);
        });

        self.inflight.lock().await.insert(
            execution_id,
            Inflight {
                cancelled,
                handle,
            },
        );

        Ok(())
    }

    /// Sets the execution's cancellation flag; the step helper observes it
    /// at the next operation boundary and raises `CoreError::Cancellation`
    /// (spec.md §4.7 "Cancellation").
    pub async fn cancel(&self, execution_id: Uuid) -> bool {
        let inflight = self.inflight.lock().await;
        match inflight.get(&execution_id) {
            Some(entry) => {
                entry.cancelled.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Stops accepting new dispatches, waits up to `grace_period` for
    /// in-flight executions to drain, then aborts stragglers (spec.md
    /// §4.7 "Shutdown"). Does not touch the sandbox manager; the caller
    /// shuts that down separately once this returns.
    pub async fn shutdown(&self, grace_period: Duration) {
        self.accepting.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.heartbeat_handle.lock().unwrap().take() {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + grace_period;
        loop {
            if self.inflight.lock().await.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let stragglers: Vec<Inflight> = self.inflight.lock().await.drain().map(|(_, v)| v).collect();
        for straggler in stragglers {
            straggler.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use polos_client::ClientConfig;
    use polos_contracts::{WorkflowKind, WorkflowOptions};
    use polos_core::context::WorkflowContext;
    use polos_core::error::Result as CoreResult;
    use polos_core::executor::{WorkflowDefinition, WorkflowHandler};

    struct NoopHandler;

    #[async_trait]
    impl WorkflowHandler for NoopHandler {
        async fn handle(&self, _ctx: &mut WorkflowContext, payload: Value) -> CoreResult<Value> {
            Ok(payload)
        }
    }

    fn test_config(max_concurrent: u32) -> WorkerConfig {
        WorkerConfig {
            worker_id: "test-worker".to_string(),
            runtime: "rust-test".to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            push_endpoint_url: None,
            max_concurrent_workflows: max_concurrent,
            heartbeat_interval: Duration::from_secs(60),
            shutdown_grace_period: Duration::from_millis(10),
        }
    }

    fn test_runner(max_concurrent: u32) -> Arc<Runner> {
        let client_config = ClientConfig {
            api_url: "http://localhost:0".to_string(),
            api_key: "test".to_string(),
            project_id: "test".to_string(),
            deployment_id: "test".to_string(),
        };
        let client = Arc::new(OrchestratorClient::new(client_config));
        let executor = Arc::new(Executor::new(Arc::clone(&client)));

        let mut registry = Registry::new();
        registry.register(WorkflowDefinition::new(
            WorkflowOptions {
                id: "wf_a".to_string(),
                description: None,
                workflow_type: WorkflowKind::Workflow,
                queue: None,
                payload_schema: None,
                state_schema: None,
            },
            Arc::new(NoopHandler),
        ));

        Runner::new(client, executor, Arc::new(registry), None, test_config(max_concurrent))
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_workflow() {
        let runner = test_runner(10);
        let err = runner
            .dispatch("wf_missing".to_string(), ExecutionContext::new_root("dep"), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::UnknownWorkflow(id) if id == "wf_missing"));
    }

    #[tokio::test]
    async fn dispatch_rejects_when_saturated() {
        let runner = test_runner(0);
        let err = runner
            .dispatch("wf_a".to_string(), ExecutionContext::new_root("dep"), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Saturated(0)));
    }

    #[tokio::test]
    async fn dispatch_rejects_after_shutdown() {
        let runner = test_runner(10);
        runner.shutdown(Duration::from_millis(10)).await;
        let err = runner
            .dispatch("wf_a".to_string(), ExecutionContext::new_root("dep"), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::ShuttingDown));
    }

    #[tokio::test]
    async fn cancel_unknown_execution_returns_false() {
        let runner = test_runner(10);
        assert!(!runner.cancel(Uuid::now_v7()).await);
    }
}
