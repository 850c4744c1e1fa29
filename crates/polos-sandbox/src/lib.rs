//! Sandbox container lifecycle for the Polos worker (spec.md §4.6):
//! per-execution and per-session sandbox reuse, plus the idle and orphan
//! sweeps that reclaim containers a crashed worker left behind.

mod docker;
pub mod duration;
pub mod error;
pub mod manager;

pub use docker::{BollardDocker, DockerOps};
pub use error::{Result, SandboxError};
pub use manager::{SandboxManager, SandboxManagerConfig};
