//! Sandbox lifecycle manager (spec.md §4.6): `getOrCreateSandbox` scope
//! rules, detach-on-completion, and the two-phase periodic sweep
//! (semaphore-free, but the same shutdown-watch-channel + ticking-loop
//! shape used elsewhere in this workspace); container operations go
//! through `docker.rs`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use polos_client::OrchestratorClient;
use polos_contracts::sandbox::{Sandbox, SandboxConfig, SandboxRequest, SandboxScope};

use crate::docker::{self, BollardDocker, DockerOps};
use crate::duration::parse_idle_timeout;
use crate::error::{Result, SandboxError};

#[derive(Debug, Clone)]
pub struct SandboxManagerConfig {
    pub default_image: String,
    pub sweep_interval: Duration,
    /// How long an unrecognized labeled container must exist before the
    /// orphan sweep removes it, so a sandbox mid-creation on another worker
    /// isn't reaped out from under it.
    pub orphan_grace_period: Duration,
    /// This worker's identifier, stamped onto every container it creates
    /// (`polos.worker-id` label) so the orphan sweep can tell its own
    /// containers apart from ones left behind by a worker that has since
    /// died.
    pub worker_id: String,
}

impl Default for SandboxManagerConfig {
    fn default() -> Self {
        Self {
            default_image: "polos/sandbox-runtime:latest".to_string(),
            sweep_interval: Duration::from_secs(60),
            orphan_grace_period: Duration::from_secs(300),
            worker_id: Uuid::now_v7().to_string(),
        }
    }
}

pub struct SandboxManager {
    docker: Arc<dyn DockerOps>,
    client: Option<Arc<OrchestratorClient>>,
    config: SandboxManagerConfig,
    sandboxes: RwLock<HashMap<Uuid, Sandbox>>,
    session_index: RwLock<HashMap<String, Uuid>>,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    sweep_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SandboxManager {
    /// Builds a manager with no orchestrator client: the orphan sweep's
    /// phase 2 (cross-checking containers against active workers) is
    /// skipped and only the idle sweep runs. Useful for embedding without
    /// wiring the full worker, and for tests.
    pub async fn new(config: SandboxManagerConfig) -> Result<Arc<Self>> {
        Self::with_client(config, None).await
    }

    pub async fn with_client(
        config: SandboxManagerConfig,
        client: Option<Arc<OrchestratorClient>>,
    ) -> Result<Arc<Self>> {
        let docker = BollardDocker::connect().await?;
        Self::with_docker(config, client, Arc::new(docker)).await
    }

    /// Builds a manager against a given `DockerOps` implementation, skipping
    /// the real `bollard` connect. Only production call site goes through
    /// `with_client`; tests construct one directly with a fake.
    pub async fn with_docker(
        config: SandboxManagerConfig,
        client: Option<Arc<OrchestratorClient>>,
        docker: Arc<dyn DockerOps>,
    ) -> Result<Arc<Self>> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Arc::new(Self {
            docker,
            client,
            config,
            sandboxes: RwLock::new(HashMap::new()),
            session_index: RwLock::new(HashMap::new()),
            session_locks: Mutex::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
            sweep_handle: std::sync::Mutex::new(None),
        }))
    }

    /// Starts the background idle+orphan sweep loop. Idempotent: calling it
    /// twice just replaces the previous handle (the old task keeps running
    /// until the next tick notices the channel was already consumed once,
    /// which in practice never happens since the worker calls this once).
    pub fn start_sweeping(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.config.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = manager.idle_sweep().await {
                            tracing::warn!(error = %e, "idle sweep failed");
                        }
                        if let Err(e) = manager.orphan_sweep().await {
                            tracing::warn!(error = %e, "orphan sweep failed");
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

        *self.sweep_handle.lock().unwrap() = Some(handle);
    }

    /// Scope-aware get-or-create. Session-scoped requests are serialized
    /// per `session_id` so concurrent callers coalesce onto one container
    /// instead of racing to create two.
    pub async fn get_or_create_sandbox(
        &self,
        request: SandboxRequest,
        config: SandboxConfig,
    ) -> Result<Sandbox> {
        match config.scope {
            SandboxScope::Execution => {
                let mut sandbox = self.create_sandbox(&request, &config).await?;
                sandbox.attached_executions.insert(request.execution_id);
                self.sandboxes
                    .write()
                    .await
                    .insert(sandbox.id, sandbox.clone());
                Ok(sandbox)
            }
            SandboxScope::Session => {
                let session_id = request
                    .session_id
                    .clone()
                    .ok_or(SandboxError::MissingSessionId)?;
                let lock = self.session_lock(&session_id).await;
                let _guard = lock.lock().await;

                if let Some(id) = self.session_index.read().await.get(&session_id).copied() {
                    let mut sandboxes = self.sandboxes.write().await;
                    if let Some(sandbox) = sandboxes.get_mut(&id) {
                        if !sandbox.destroyed {
                            sandbox.attached_executions.insert(request.execution_id);
                            sandbox.touch();
                            return Ok(sandbox.clone());
                        }
                    }
                }

                let mut sandbox = self.create_sandbox(&request, &config).await?;
                sandbox.attached_executions.insert(request.execution_id);
                let id = sandbox.id;
                self.sandboxes.write().await.insert(id, sandbox.clone());
                self.session_index
                    .write()
                    .await
                    .insert(session_id, id);
                Ok(sandbox)
            }
        }
    }

    /// Called by the worker once an execution finishes (successfully,
    /// failed, or was cancelled). Execution-scoped sandboxes are destroyed
    /// immediately; session-scoped ones are only detached so later
    /// executions of the same session can reuse them.
    pub async fn on_execution_complete(&self, execution_id: Uuid) -> Result<()> {
        let mut to_destroy = None;
        {
            let mut sandboxes = self.sandboxes.write().await;
            for sandbox in sandboxes.values_mut() {
                if sandbox.attached_executions.remove(&execution_id) {
                    match sandbox.scope {
                        SandboxScope::Execution => to_destroy = Some(sandbox.id),
                        SandboxScope::Session => sandbox.touch(),
                    }
                }
            }
        }
        if let Some(id) = to_destroy {
            self.destroy(id).await?;
        }
        Ok(())
    }

    /// Stops the sweep loop and destroys every sandbox this manager still
    /// tracks, per the worker's graceful-shutdown sequence (spec.md §4.7).
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        let handle = self.sweep_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let ids: Vec<Uuid> = self.sandboxes.read().await.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.destroy(id).await {
                tracing::warn!(sandbox_id = %id, error = %e, "failed to destroy sandbox on shutdown");
            }
        }
        Ok(())
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn create_sandbox(
        &self,
        request: &SandboxRequest,
        config: &SandboxConfig,
    ) -> Result<Sandbox> {
        let idle_destroy_timeout = parse_idle_timeout(&config.idle_destroy_timeout)?;
        let image = config
            .image
            .clone()
            .unwrap_or_else(|| self.config.default_image.clone());
        let id = Uuid::now_v7();
        let container_id = self
            .docker
            .create_and_start(&format!("polos-sandbox-{id}"), &image, &self.config.worker_id)
            .await?;

        tracing::info!(sandbox_id = %id, %container_id, scope = ?config.scope, "sandbox created");

        Ok(Sandbox {
            id,
            scope: config.scope,
            idle_destroy_timeout,
            last_activity_at: Utc::now(),
            attached_executions: Default::default(),
            session_id: request.session_id.clone(),
            destroyed: false,
            container_id,
        })
    }

    async fn destroy(&self, id: Uuid) -> Result<()> {
        let sandbox = {
            let mut sandboxes = self.sandboxes.write().await;
            sandboxes.remove(&id)
        };
        let Some(mut sandbox) = sandbox else {
            return Ok(());
        };

        self.docker.remove(&sandbox.container_id).await?;
        sandbox.destroyed = true;

        if let Some(session_id) = &sandbox.session_id {
            let mut index = self.session_index.write().await;
            if index.get(session_id) == Some(&id) {
                index.remove(session_id);
            }
        }

        tracing::info!(sandbox_id = %id, "sandbox destroyed");
        Ok(())
    }

    /// Destroys sandboxes with no attached executions whose
    /// `idle_destroy_timeout` has elapsed since `last_activity_at`.
    async fn idle_sweep(&self) -> Result<()> {
        let now = Utc::now();
        let idle_ids: Vec<Uuid> = {
            let sandboxes = self.sandboxes.read().await;
            sandboxes
                .values()
                .filter(|s| !s.destroyed && s.attached_executions.is_empty() && s.is_idle(now))
                .map(|s| s.id)
                .collect()
        };
        for id in idle_ids {
            self.destroy(id).await?;
        }
        Ok(())
    }

    /// Removes Docker containers that carry the managed label but whose
    /// owning worker (`polos.worker-id`) is no longer active per the
    /// orchestrator's own worker registry (e.g. left behind by a worker
    /// that crashed before its own `destroy` ran), once they're older than
    /// `orphan_grace_period` so a sandbox another worker just created isn't
    /// reaped mid-creation. Without an orchestrator client wired in, falls
    /// back to "unrecognized by this process" as the liveness signal.
    async fn orphan_sweep(&self) -> Result<()> {
        let known: std::collections::HashSet<String> = self
            .sandboxes
            .read()
            .await
            .values()
            .map(|s| s.container_id.clone())
            .collect();

        let active_workers: Option<std::collections::HashSet<String>> = match &self.client {
            Some(client) => match client.list_active_workers().await {
                Ok(workers) => Some(workers.into_iter().collect()),
                Err(e) => {
                    tracing::warn!(error = %e, "could not list active workers; skipping orphan sweep");
                    return Ok(());
                }
            },
            None => None,
        };

        let containers = self.docker.list_managed().await?;
        let grace = chrono::Duration::from_std(self.config.orphan_grace_period).unwrap_or_default();
        let now = Utc::now();

        for container in containers {
            let Some(container_id) = container.id.clone() else {
                continue;
            };
            if known.contains(&container_id) {
                continue;
            }
            let orphaned = match (&active_workers, docker::worker_id_of(&container)) {
                (Some(active), Some(worker_id)) => !active.contains(worker_id),
                // No worker registry available, or container predates the
                // worker-id label: fall back to "this process doesn't
                // recognize it" as the orphan signal.
                _ => true,
            };
            if !orphaned {
                continue;
            }
            let created_at = container
                .created
                .and_then(|ts| chrono::DateTime::<Utc>::from_timestamp(ts, 0));
            let is_aged = match created_at {
                Some(created_at) => now.signed_duration_since(created_at) > grace,
                // No timestamp reported: treat conservatively as aged rather
                // than leak the container forever.
                None => true,
            };
            if is_aged {
                tracing::warn!(%container_id, "removing orphaned sandbox container");
                self.docker.remove(&container_id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use bollard::models::ContainerSummary;

    #[test]
    fn default_config_has_sane_intervals() {
        let config = SandboxManagerConfig::default();
        assert!(config.sweep_interval >= Duration::from_secs(1));
        assert!(config.orphan_grace_period >= config.sweep_interval);
    }

    /// Records every call instead of touching a Docker daemon, and lets a
    /// test seed `list_managed`'s response to drive the orphan sweep.
    #[derive(Default)]
    struct FakeDockerOps {
        created: StdMutex<Vec<(String, String, String)>>,
        removed: StdMutex<Vec<String>>,
        managed: StdMutex<Vec<ContainerSummary>>,
    }

    impl FakeDockerOps {
        fn set_managed(&self, containers: Vec<ContainerSummary>) {
            *self.managed.lock().unwrap() = containers;
        }
    }

    #[async_trait]
    impl DockerOps for FakeDockerOps {
        async fn create_and_start(&self, name: &str, image: &str, worker_id: &str) -> Result<String> {
            self.created
                .lock()
                .unwrap()
                .push((name.to_string(), image.to_string(), worker_id.to_string()));
            Ok(format!("fake-{name}"))
        }

        async fn remove(&self, container_id: &str) -> Result<()> {
            self.removed.lock().unwrap().push(container_id.to_string());
            Ok(())
        }

        async fn list_managed(&self) -> Result<Vec<ContainerSummary>> {
            Ok(self.managed.lock().unwrap().drain(..).collect())
        }
    }

    fn test_config() -> SandboxManagerConfig {
        SandboxManagerConfig {
            default_image: "polos/sandbox-runtime:test".to_string(),
            sweep_interval: Duration::from_secs(60),
            orphan_grace_period: Duration::from_secs(300),
            worker_id: "worker-1".to_string(),
        }
    }

    async fn test_manager(docker: Arc<FakeDockerOps>) -> (Arc<SandboxManager>, Arc<FakeDockerOps>) {
        let manager = SandboxManager::with_docker(test_config(), None, docker.clone())
            .await
            .unwrap();
        (manager, docker)
    }

    fn sandbox_config(scope: SandboxScope) -> SandboxConfig {
        SandboxConfig {
            scope,
            image: None,
            idle_destroy_timeout: "10m".to_string(),
        }
    }

    fn container_summary(id: &str, worker_id: Option<&str>, created: chrono::DateTime<Utc>) -> ContainerSummary {
        let mut labels = HashMap::new();
        labels.insert(docker::MANAGED_LABEL.to_string(), "true".to_string());
        if let Some(worker_id) = worker_id {
            labels.insert(docker::WORKER_ID_LABEL.to_string(), worker_id.to_string());
        }
        ContainerSummary {
            id: Some(id.to_string()),
            labels: Some(labels),
            created: Some(created.timestamp()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn get_or_create_sandbox_execution_scope_creates_one_container_per_call() {
        let (manager, docker) = test_manager(Arc::new(FakeDockerOps::default())).await;
        let execution_id = Uuid::now_v7();

        let sandbox = manager
            .get_or_create_sandbox(
                SandboxRequest { execution_id, session_id: None },
                sandbox_config(SandboxScope::Execution),
            )
            .await
            .unwrap();

        assert!(sandbox.attached_executions.contains(&execution_id));
        assert_eq!(docker.created.lock().unwrap().len(), 1);
        assert_eq!(manager.sandboxes.read().await.len(), 1);
    }

    #[tokio::test]
    async fn get_or_create_sandbox_session_scope_reuses_existing_container() {
        let (manager, docker) = test_manager(Arc::new(FakeDockerOps::default())).await;
        let session_id = "session-1".to_string();

        let first = manager
            .get_or_create_sandbox(
                SandboxRequest {
                    execution_id: Uuid::now_v7(),
                    session_id: Some(session_id.clone()),
                },
                sandbox_config(SandboxScope::Session),
            )
            .await
            .unwrap();

        let second = manager
            .get_or_create_sandbox(
                SandboxRequest {
                    execution_id: Uuid::now_v7(),
                    session_id: Some(session_id.clone()),
                },
                sandbox_config(SandboxScope::Session),
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(docker.created.lock().unwrap().len(), 1);
        assert_eq!(manager.sandboxes.read().await.get(&first.id).unwrap().attached_executions.len(), 2);
    }

    #[tokio::test]
    async fn get_or_create_sandbox_session_scope_without_session_id_errors() {
        let (manager, _docker) = test_manager(Arc::new(FakeDockerOps::default())).await;
        let result = manager
            .get_or_create_sandbox(
                SandboxRequest { execution_id: Uuid::now_v7(), session_id: None },
                sandbox_config(SandboxScope::Session),
            )
            .await;
        assert!(matches!(result, Err(SandboxError::MissingSessionId)));
    }

    #[tokio::test]
    async fn on_execution_complete_destroys_execution_scoped_sandbox() {
        let (manager, docker) = test_manager(Arc::new(FakeDockerOps::default())).await;
        let execution_id = Uuid::now_v7();
        manager
            .get_or_create_sandbox(
                SandboxRequest { execution_id, session_id: None },
                sandbox_config(SandboxScope::Execution),
            )
            .await
            .unwrap();

        manager.on_execution_complete(execution_id).await.unwrap();

        assert_eq!(docker.removed.lock().unwrap().len(), 1);
        assert!(manager.sandboxes.read().await.is_empty());
    }

    #[tokio::test]
    async fn on_execution_complete_only_detaches_session_scoped_sandbox() {
        let (manager, docker) = test_manager(Arc::new(FakeDockerOps::default())).await;
        let execution_id = Uuid::now_v7();
        let sandbox = manager
            .get_or_create_sandbox(
                SandboxRequest {
                    execution_id,
                    session_id: Some("session-1".to_string()),
                },
                sandbox_config(SandboxScope::Session),
            )
            .await
            .unwrap();

        manager.on_execution_complete(execution_id).await.unwrap();

        assert!(docker.removed.lock().unwrap().is_empty());
        let sandboxes = manager.sandboxes.read().await;
        let tracked = sandboxes.get(&sandbox.id).unwrap();
        assert!(!tracked.destroyed);
        assert!(tracked.attached_executions.is_empty());
    }

    #[tokio::test]
    async fn idle_sweep_destroys_only_unattached_sandboxes_past_timeout() {
        let (manager, docker) = test_manager(Arc::new(FakeDockerOps::default())).await;

        let idle_id = Uuid::now_v7();
        let busy_id = Uuid::now_v7();
        {
            let mut sandboxes = manager.sandboxes.write().await;
            sandboxes.insert(
                idle_id,
                Sandbox {
                    id: idle_id,
                    scope: SandboxScope::Session,
                    idle_destroy_timeout: Duration::from_secs(1),
                    last_activity_at: Utc::now() - chrono::Duration::hours(1),
                    attached_executions: Default::default(),
                    session_id: None,
                    destroyed: false,
                    container_id: "idle-container".to_string(),
                },
            );
            let mut busy_executions = std::collections::HashSet::new();
            busy_executions.insert(Uuid::now_v7());
            sandboxes.insert(
                busy_id,
                Sandbox {
                    id: busy_id,
                    scope: SandboxScope::Session,
                    idle_destroy_timeout: Duration::from_secs(1),
                    last_activity_at: Utc::now() - chrono::Duration::hours(1),
                    attached_executions: busy_executions,
                    session_id: None,
                    destroyed: false,
                    container_id: "busy-container".to_string(),
                },
            );
        }

        manager.idle_sweep().await.unwrap();

        assert_eq!(*docker.removed.lock().unwrap(), vec!["idle-container".to_string()]);
        assert!(manager.sandboxes.read().await.contains_key(&busy_id));
        assert!(!manager.sandboxes.read().await.contains_key(&idle_id));
    }

    #[tokio::test]
    async fn orphan_sweep_skips_containers_this_manager_still_tracks() {
        let (manager, docker) = test_manager(Arc::new(FakeDockerOps::default())).await;
        let sandbox = manager
            .get_or_create_sandbox(
                SandboxRequest {
                    execution_id: Uuid::now_v7(),
                    session_id: Some("session-1".to_string()),
                },
                sandbox_config(SandboxScope::Session),
            )
            .await
            .unwrap();

        docker.set_managed(vec![container_summary(
            &sandbox.container_id,
            Some("some-other-worker"),
            Utc::now() - chrono::Duration::hours(1),
        )]);

        manager.orphan_sweep().await.unwrap();

        assert!(docker.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn orphan_sweep_without_client_removes_unrecognized_aged_containers() {
        let (manager, docker) = test_manager(Arc::new(FakeDockerOps::default())).await;
        docker.set_managed(vec![container_summary(
            "stray-container",
            Some("dead-worker"),
            Utc::now() - chrono::Duration::hours(1),
        )]);

        manager.orphan_sweep().await.unwrap();

        assert_eq!(*docker.removed.lock().unwrap(), vec!["stray-container".to_string()]);
    }

    #[tokio::test]
    async fn orphan_sweep_without_client_spares_unrecognized_containers_within_grace_period() {
        let (manager, docker) = test_manager(Arc::new(FakeDockerOps::default())).await;
        docker.set_managed(vec![container_summary("fresh-container", Some("dead-worker"), Utc::now())]);

        manager.orphan_sweep().await.unwrap();

        assert!(docker.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn orphan_sweep_with_client_spares_containers_of_active_workers() {
        use polos_client::{ClientConfig, OrchestratorClient};
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/workers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "worker_id": "worker-alive" },
            ])))
            .mount(&server)
            .await;

        let client = Arc::new(OrchestratorClient::new(ClientConfig {
            api_url: server.uri(),
            api_key: "k".into(),
            project_id: "p".into(),
            deployment_id: "d".into(),
        }));

        let docker = Arc::new(FakeDockerOps::default());
        let manager = SandboxManager::with_docker(test_config(), Some(client), docker.clone())
            .await
            .unwrap();
        docker.set_managed(vec![container_summary(
            "alive-worker-container",
            Some("worker-alive"),
            Utc::now() - chrono::Duration::hours(1),
        )]);

        manager.orphan_sweep().await.unwrap();

        assert!(docker.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn orphan_sweep_with_client_removes_containers_of_dead_workers() {
        use polos_client::{ClientConfig, OrchestratorClient};
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/workers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "worker_id": "worker-alive" },
            ])))
            .mount(&server)
            .await;

        let client = Arc::new(OrchestratorClient::new(ClientConfig {
            api_url: server.uri(),
            api_key: "k".into(),
            project_id: "p".into(),
            deployment_id: "d".into(),
        }));

        let docker = Arc::new(FakeDockerOps::default());
        let manager = SandboxManager::with_docker(test_config(), Some(client), docker.clone())
            .await
            .unwrap();
        docker.set_managed(vec![container_summary(
            "dead-worker-container",
            Some("worker-dead"),
            Utc::now() - chrono::Duration::hours(1),
        )]);

        manager.orphan_sweep().await.unwrap();

        assert_eq!(*docker.removed.lock().unwrap(), vec!["dead-worker-container".to_string()]);
    }
}
