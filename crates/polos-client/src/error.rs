//! Client-facing error type. Network and HTTP-status failures here are the
//! ones the retry loop in `client.rs` decides about; once exhausted they
//! surface to callers (the step helper treats them as transient per
//! spec.md §7).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    NetworkError(String),

    #[error("orchestrator returned {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("failed to decode orchestrator response: {0}")]
    Decode(String),
}

impl ClientError {
    /// 5xx and 429 are retryable; every other 4xx is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::NetworkError(_) | ClientError::Timeout(_) => true,
            ClientError::ApiError { status, .. } => *status == 429 || *status >= 500,
            ClientError::Decode(_) => false,
        }
    }
}
