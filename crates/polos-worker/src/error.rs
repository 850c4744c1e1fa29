//! Worker-local error type, distinct from `CoreError`: these are failures
//! of the worker shell itself (registration, dispatch refusal), not of a
//! handler's execution.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Client(#[from] polos_client::ClientError),

    #[error(transparent)]
    Sandbox(#[from] polos_sandbox::SandboxError),

    #[error("unknown workflow id '{0}'")]
    UnknownWorkflow(String),

    #[error("worker saturated: all {0} concurrency slots in use")]
    Saturated(u32),

    #[error("worker is shutting down, refusing new dispatch")]
    ShuttingDown,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
