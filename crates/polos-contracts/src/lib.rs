//! Wire DTOs shared by every crate in the workspace: execution context,
//! step outputs, messages, tool definitions, sandbox model, and SSE
//! envelopes exchanged with the orchestrator.

pub mod execution;
pub mod message;
pub mod sandbox;
pub mod sse;
pub mod tools;

pub use execution::*;
pub use message::*;
pub use sandbox::*;
pub use sse::*;
pub use tools::*;
