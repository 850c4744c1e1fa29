//! Worker process library (spec.md §4.7): registration, the concurrency-
//! gated dispatch runner, and the push-dispatch HTTP server. `main.rs`
//! wires these into a runnable binary; embedding processes can use the
//! same pieces directly.

pub mod config;
pub mod error;
pub mod runner;
pub mod server;
pub mod startup;

pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use runner::Runner;
pub use server::{build_router, DispatchRequest};
