// Sandbox data model shared between the executor (which asks for
// sandboxes) and polos-sandbox (which manages their lifecycle).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxScope {
    Execution,
    Session,
}

/// Request shape for `getOrCreateSandbox`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub scope: SandboxScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// `Nm`/`Nh`/`Nd` duration string, parsed by polos-sandbox.
    #[serde(default = "default_idle_destroy_timeout")]
    pub idle_destroy_timeout: String,
}

fn default_idle_destroy_timeout() -> String {
    "10m".to_string()
}

/// The key identifying which execution/session a sandbox was requested for.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub execution_id: Uuid,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: Uuid,
    pub scope: SandboxScope,
    pub idle_destroy_timeout: std::time::Duration,
    pub last_activity_at: DateTime<Utc>,
    pub attached_executions: HashSet<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub destroyed: bool,
    /// Backend container identifier (opaque to the manager's own logic).
    pub container_id: String,
}

impl Sandbox {
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_activity_at)
            > chrono::Duration::from_std(self.idle_destroy_timeout).unwrap_or_default()
    }
}
