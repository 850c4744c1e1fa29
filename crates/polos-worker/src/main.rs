//! Default worker binary. Wires `tracing-subscriber`, loads
//! `ClientConfig`/`WorkerConfig` from the environment, builds the
//! orchestrator client/executor/registry/sandbox manager, runs the
//! dispatch server until `ctrl_c`, then drains and deregisters (spec.md
//! §4.7).
//!
//! This binary ships with an empty registry: real deployments embed
//! `polos-worker`'s library surface in their own binary, registering
//! their actual workflow/agent/tool handlers before calling `run`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use polos_client::{ClientConfig, OrchestratorClient};
use polos_core::executor::Executor;
use polos_core::registry::Registry;
use polos_sandbox::{SandboxManager, SandboxManagerConfig};
use polos_worker::{config::WorkerConfig, runner::Runner, server, startup};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "polos_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("polos-worker starting...");

    let client_config = ClientConfig::from_env().map_err(anyhow::Error::msg)?;
    let worker_config = WorkerConfig::from_env().map_err(anyhow::Error::msg)?;

    let client = Arc::new(OrchestratorClient::new(client_config));
    let executor = Arc::new(Executor::new(Arc::clone(&client)));
    let registry = Arc::new(Registry::new());

    let sandbox_config = SandboxManagerConfig {
        worker_id: worker_config.worker_id.clone(),
        ..SandboxManagerConfig::default()
    };
    let sandbox_manager = match SandboxManager::with_client(sandbox_config, Some(Arc::clone(&client))).await {
        Ok(manager) => {
            manager.start_sweeping();
            Some(manager)
        }
        Err(e) => {
            tracing::warn!(error = %e, "sandbox manager unavailable; session/execution sandboxes disabled");
            None
        }
    };

    startup::register(&client, &registry, &worker_config)
        .await
        .context("worker registration failed")?;

    let runner = Runner::new(
        Arc::clone(&client),
        executor,
        registry,
        sandbox_manager.clone(),
        worker_config.clone(),
    );
    runner.start_heartbeat();

    let app = server::build_router(Arc::clone(&runner));
    let listener = tokio::net::TcpListener::bind(&worker_config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", worker_config.bind_addr))?;

    tracing::info!(addr = %worker_config.bind_addr, "dispatch server listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "dispatch server exited with error");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining in-flight executions");

    server_handle.abort();
    runner.shutdown(worker_config.shutdown_grace_period).await;

    if let Some(manager) = sandbox_manager {
        if let Err(e) = manager.shutdown().await {
            tracing::warn!(error = %e, "sandbox manager shutdown failed");
        }
    }

    if let Err(e) = client.deregister_worker(&worker_config.worker_id).await {
        tracing::warn!(error = %e, "worker deregistration failed");
    }

    tracing::info!("polos-worker stopped");
    Ok(())
}
