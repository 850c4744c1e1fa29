//! Thin wrapper over the subset of the Docker Engine API the sandbox
//! manager needs: create+start, remove, and label-filtered listing (for the
//! orphan sweep). Kept separate from `manager.rs` so the lifecycle
//! bookkeeping above it stays backend-agnostic.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::models::ContainerSummary;
use bollard::Docker;

use crate::error::Result;

/// Label applied to every container this manager creates, so the orphan
/// sweep can distinguish managed sandboxes from unrelated containers on the
/// same Docker host.
pub const MANAGED_LABEL: &str = "polos.managed";

/// Label recording which worker created a container, so the orphan sweep
/// can tell a container whose worker has since died from one that's still
/// legitimately in use (spec.md §4.6 phase 2).
pub const WORKER_ID_LABEL: &str = "polos.worker-id";

/// The subset of the Docker Engine API `SandboxManager` needs, behind a
/// trait so its lifecycle bookkeeping (scope rules, sweeps) can be tested
/// without a live Docker daemon. `BollardDocker` is the only real
/// implementation; tests supply their own.
#[async_trait]
pub trait DockerOps: Send + Sync {
    async fn create_and_start(&self, name: &str, image: &str, worker_id: &str) -> Result<String>;
    async fn remove(&self, container_id: &str) -> Result<()>;
    async fn list_managed(&self) -> Result<Vec<ContainerSummary>>;
}

pub struct BollardDocker(Docker);

impl BollardDocker {
    pub async fn connect() -> Result<Self> {
        Ok(Self(Docker::connect_with_local_defaults()?))
    }
}

#[async_trait]
impl DockerOps for BollardDocker {
    async fn create_and_start(&self, name: &str, image: &str, worker_id: &str) -> Result<String> {
        create_and_start(&self.0, name, image, worker_id).await
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        remove(&self.0, container_id).await
    }

    async fn list_managed(&self) -> Result<Vec<ContainerSummary>> {
        list_managed(&self.0).await
    }
}

async fn create_and_start(docker: &Docker, name: &str, image: &str, worker_id: &str) -> Result<String> {
    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(WORKER_ID_LABEL.to_string(), worker_id.to_string());

    let config = Config {
        image: Some(image.to_string()),
        labels: Some(labels),
        tty: Some(true),
        ..Default::default()
    };

    let options = CreateContainerOptions {
        name: name.to_string(),
        platform: None,
    };

    let created = docker.create_container(Some(options), config).await?;
    docker
        .start_container(&created.id, None::<StartContainerOptions<String>>)
        .await?;
    Ok(created.id)
}

async fn remove(docker: &Docker, container_id: &str) -> Result<()> {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    match docker.remove_container(container_id, Some(options)).await {
        Ok(()) => Ok(()),
        // Already gone is not an error from the manager's point of view.
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Lists every container carrying `MANAGED_LABEL`, for the orphan sweep.
async fn list_managed(docker: &Docker) -> Result<Vec<ContainerSummary>> {
    let mut filters = HashMap::new();
    filters.insert("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]);

    let options = ListContainersOptions {
        all: true,
        filters,
        ..Default::default()
    };

    Ok(docker.list_containers(Some(options)).await?)
}

/// Reads the `polos.worker-id` label off a listed container, if present.
pub fn worker_id_of(container: &ContainerSummary) -> Option<&str> {
    container
        .labels
        .as_ref()
        .and_then(|labels| labels.get(WORKER_ID_LABEL))
        .map(String::as_str)
}
