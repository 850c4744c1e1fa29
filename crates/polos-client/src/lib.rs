//! Typed HTTP/SSE facade over the Polos orchestrator API: retries,
//! backoff, and SSE stream parsing (spec.md §4.1).

pub mod client;
pub mod config;
pub mod error;
pub mod retry;
pub mod sse;

pub use client::{BatchInvokeItem, InvokeResponse, OrchestratorClient, WorkerRegistration};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use retry::RetryPolicy;
