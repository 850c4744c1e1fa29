//! Worker startup sequence (spec.md §4.7): register deployment → register
//! workflows → register the worker's capability set → mark online.
//!
//! Per-queue registration is folded into `register_workflows`: each
//! `WorkflowOptions` already carries its own `queue` field, and the
//! orchestrator client exposes no separate queue-registration endpoint
//! (see DESIGN.md) — there is nothing left for a standalone "register
//! queues" call to do.

use std::sync::Arc;

use polos_client::{OrchestratorClient, WorkerRegistration};
use polos_contracts::WorkflowKind;
use polos_core::registry::Registry;

use crate::config::WorkerConfig;
use crate::error::Result;

pub async fn register(
    client: &Arc<OrchestratorClient>,
    registry: &Registry,
    config: &WorkerConfig,
) -> Result<()> {
    client.register_deployment(&config.worker_id).await?;

    let options = registry.options();
    client.register_workflows(&options).await?;

    let agent_ids = options
        .iter()
        .filter(|o| o.workflow_type == WorkflowKind::Agent)
        .map(|o| o.id.clone())
        .collect();
    let tool_ids = options
        .iter()
        .filter(|o| o.workflow_type == WorkflowKind::Tool)
        .map(|o| o.id.clone())
        .collect();
    let workflow_ids = options
        .iter()
        .filter(|o| o.workflow_type == WorkflowKind::Workflow)
        .map(|o| o.id.clone())
        .collect();

    client
        .register_worker(&WorkerRegistration {
            worker_id: config.worker_id.clone(),
            runtime: config.runtime.clone(),
            agent_ids,
            tool_ids,
            workflow_ids,
            push_endpoint_url: Some(config.effective_push_endpoint_url()),
        })
        .await?;

    client.mark_online(&config.worker_id).await?;

    tracing::info!(
        worker_id = %config.worker_id,
        workflows = registry.len(),
        "worker registered and online"
    );

    Ok(())
}
