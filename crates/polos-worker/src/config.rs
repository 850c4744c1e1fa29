//! Worker-local configuration (spec.md §4.7): plain struct, `from_env()`
//! constructor, sane defaults baked in rather than a generic config crate.

use std::time::Duration;

const DEFAULT_MAX_CONCURRENT_WORKFLOWS: u32 = 100;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
const DEFAULT_PORT: u16 = 7070;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub runtime: String,
    /// Address the dispatch server binds to.
    pub bind_addr: String,
    /// URL the orchestrator is told to push dispatches to; defaults to
    /// `http://<bind_addr>/dispatch` when not overridden (e.g. behind a
    /// reverse proxy or in a container where the bind address isn't
    /// externally reachable).
    pub push_endpoint_url: Option<String>,
    pub max_concurrent_workflows: u32,
    pub heartbeat_interval: Duration,
    pub shutdown_grace_period: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, String> {
        let worker_id = std::env::var("POLOS_WORKER_ID")
            .map_err(|_| "POLOS_WORKER_ID environment variable not set".to_string())?;

        let port = std::env::var("POLOS_WORKER_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let bind_addr = format!("0.0.0.0:{port}");

        let max_concurrent_workflows = std::env::var("POLOS_MAX_CONCURRENT_WORKFLOWS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_CONCURRENT_WORKFLOWS);

        let heartbeat_interval = std::env::var("POLOS_HEARTBEAT_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS));

        let shutdown_grace_period = std::env::var("POLOS_SHUTDOWN_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS));

        Ok(Self {
            worker_id,
            runtime: format!("rust-{}", env!("CARGO_PKG_VERSION")),
            push_endpoint_url: std::env::var("POLOS_WORKER_PUSH_ENDPOINT_URL").ok(),
            bind_addr,
            max_concurrent_workflows,
            heartbeat_interval,
            shutdown_grace_period,
        })
    }

    /// The URL advertised to the orchestrator at registration time.
    pub fn effective_push_endpoint_url(&self) -> String {
        self.push_endpoint_url
            .clone()
            .unwrap_or_else(|| format!("http://{}/dispatch", self.bind_addr))
    }
}
