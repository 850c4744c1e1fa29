//! Errors surfaced by the sandbox manager (spec.md §4.6).

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("invalid idle_destroy_timeout '{raw}': {reason}")]
    InvalidDuration { raw: String, reason: String },

    #[error("sandbox {0} not found")]
    NotFound(Uuid),

    #[error("session-scoped sandbox requested without a session_id")]
    MissingSessionId,
}
