//! Durable project ↔ sandbox association entity.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::state::SandboxState;

/// The association between a project and its one execution container.
///
/// `sandbox_id` is the logical handle: it stays stable when the underlying
/// container is replaced (restart, recovery), so cached tool descriptors keyed
/// by it remain valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSandbox {
    pub id: String,
    pub project_id: String,
    pub tenant_id: String,
    pub sandbox_id: String,
    pub status: SandboxState,
    pub created_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub last_accessed_at: OffsetDateTime,
    pub health_checked_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
}

impl ProjectSandbox {
    /// Create a fresh association in the `Starting` state.
    pub fn new(project_id: &str, tenant_id: &str, sandbox_id: &str) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            tenant_id: tenant_id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            status: SandboxState::Starting,
            created_at: now,
            started_at: None,
            last_accessed_at: now,
            health_checked_at: None,
            error_message: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn mark_accessed(&mut self) {
        self.last_accessed_at = OffsetDateTime::now_utc();
    }

    /// Mark the sandbox healthy and running.
    pub fn mark_healthy(&mut self) {
        self.status = SandboxState::Running;
        self.health_checked_at = Some(OffsetDateTime::now_utc());
        self.error_message = None;
    }

    pub fn mark_unhealthy(&mut self, reason: Option<&str>) {
        self.status = SandboxState::Error;
        self.health_checked_at = Some(OffsetDateTime::now_utc());
        if let Some(reason) = reason {
            self.error_message = Some(reason.to_string());
        }
    }

    pub fn mark_error(&mut self, error: &str) {
        self.status = SandboxState::Error;
        self.error_message = Some(error.to_string());
    }

    pub fn mark_terminated(&mut self) {
        self.status = SandboxState::Terminated;
    }

    pub fn is_usable(&self) -> bool {
        self.status.is_usable()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Whether the cached health verdict has aged out.
    pub fn needs_health_check(&self, max_age_seconds: i64) -> bool {
        match self.health_checked_at {
            None => true,
            Some(checked_at) => {
                (OffsetDateTime::now_utc() - checked_at).whole_seconds() > max_age_seconds
            }
        }
    }
}
