//! Error and suspension types for the step helper, executor, and agent
//! loop (spec.md §7).

use thiserror::Error;

use crate::step::WaitReason;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors the step helper / executor / agent loop surface to handler code.
///
/// `Wait` is not really an error - it is spec.md's `WaitSignal` control-flow
/// marker, modeled as a propagating variant so a handler can bubble a
/// suspension out of arbitrarily nested calls with plain `?` the same way
/// the original throws it. The executor inspects this variant specifically
/// rather than treating it as failure (spec.md §9 Design Notes).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("step execution error: {0}")]
    StepExecution(String),

    #[error(transparent)]
    Client(#[from] polos_client::ClientError),

    #[error("execution cancelled")]
    Cancellation,

    #[error("guardrail failure: {0}")]
    GuardrailFailure(String),

    #[error("tool failure: {0}")]
    ToolFailure(String),

    #[error("execution suspended")]
    Wait(WaitReason),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Retryable-vs-terminal, computed exactly as spec.md §7 describes:
    /// `not (StepExecutionError or tool-type) and not CancellationError and
    /// not Validation`. The `is_tool` flag comes from the workflow
    /// definition the executor is running.
    pub fn is_retryable(&self, is_tool: bool) -> bool {
        !matches!(
            self,
            CoreError::StepExecution(_)
                | CoreError::Cancellation
                | CoreError::Validation(_)
                | CoreError::Wait(_)
        ) && !is_tool
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, CoreError::Wait(_))
    }
}
