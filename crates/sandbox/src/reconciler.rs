//! Startup reconciliation sweep.
//!
//! Worker restarts can leave containers running that the service no longer
//! tracks (crashed mid-create, deleted rows, another worker's leftovers). The
//! reconciler runs once at worker start, never per-request: it enumerates
//! running containers carrying the managed-sandbox label and applies the
//! configured policy to every one the repository does not know about.

use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::adapter::{SandboxAdapter, SandboxInstance};
use crate::domain::ProjectSandbox;
use crate::error::SandboxResult;
use crate::repository::SandboxRepository;
use crate::state::SandboxState;

/// What to do with a running container the repository does not track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanPolicy {
    /// Record an association for it and let the next health check promote it.
    Adopt,
    /// Tear it down.
    Terminate,
    /// Leave it alone (operator will deal with it).
    Ignore,
}

/// Outcome of one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub adopted: usize,
    pub terminated: usize,
    pub skipped: usize,
}

pub struct SandboxReconciler {
    repository: Arc<dyn SandboxRepository>,
    adapter: Arc<dyn SandboxAdapter>,
    policy: OrphanPolicy,
    /// Orphans older than this are terminated regardless of policy.
    max_orphan_age_hours: i64,
}

impl SandboxReconciler {
    pub fn new(
        repository: Arc<dyn SandboxRepository>,
        adapter: Arc<dyn SandboxAdapter>,
        policy: OrphanPolicy,
        max_orphan_age_hours: i64,
    ) -> Self {
        Self {
            repository,
            adapter,
            policy,
            max_orphan_age_hours,
        }
    }

    /// Run one sweep over all managed containers.
    pub async fn reconcile(&self) -> SandboxResult<ReconcileReport> {
        let containers = self.adapter.list_managed_containers().await?;
        let mut report = ReconcileReport {
            scanned: containers.len(),
            ..Default::default()
        };

        for container in containers {
            if self
                .repository
                .find_by_sandbox_id(&container.id)
                .await?
                .is_some()
            {
                continue; // tracked, nothing to reconcile
            }

            let age_hours =
                (OffsetDateTime::now_utc() - container.created_at).whole_hours();
            let action = if age_hours > self.max_orphan_age_hours {
                OrphanPolicy::Terminate
            } else {
                self.policy
            };

            match action {
                OrphanPolicy::Adopt => {
                    if self.adopt(&container).await {
                        report.adopted += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                OrphanPolicy::Terminate => {
                    match self.adapter.terminate(&container.id).await {
                        Ok(()) => {
                            info!(sandbox_id = %container.id, age_hours, "terminated orphan container");
                            report.terminated += 1;
                        }
                        Err(e) => {
                            error!(sandbox_id = %container.id, error = %e, "failed to terminate orphan");
                            report.skipped += 1;
                        }
                    }
                }
                OrphanPolicy::Ignore => {
                    report.skipped += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            adopted = report.adopted,
            terminated = report.terminated,
            skipped = report.skipped,
            "sandbox reconciliation complete"
        );
        Ok(report)
    }

    /// Manually adopt one orphan by its logical id.
    pub async fn adopt_orphan(&self, sandbox_id: &str) -> SandboxResult<bool> {
        let containers = self.adapter.list_managed_containers().await?;
        match containers.into_iter().find(|c| c.id == sandbox_id) {
            Some(container) => Ok(self.adopt(&container).await),
            None => Ok(false),
        }
    }

    async fn adopt(&self, container: &SandboxInstance) -> bool {
        if !container.running {
            info!(sandbox_id = %container.id, "skipping adoption of non-running orphan");
            return false;
        }

        // An existing row for the project means the orphan is a duplicate
        // container; adopting it would break the one-sandbox invariant.
        match self.repository.find_by_project(&container.project_id).await {
            Ok(Some(_)) => {
                warn!(
                    project_id = %container.project_id,
                    sandbox_id = %container.id,
                    "project already tracked, not adopting duplicate container"
                );
                return false;
            }
            Ok(None) => {}
            Err(e) => {
                error!(sandbox_id = %container.id, error = %e, "adoption lookup failed");
                return false;
            }
        }

        let mut association = ProjectSandbox::new(
            &container.project_id,
            &container.tenant_id,
            &container.id,
        );
        // Adopted containers enter the recoverable state; a successful health
        // check promotes them to Running.
        association.status = SandboxState::Error;
        association.error_message = Some("adopted by reconciliation sweep".to_string());
        association.metadata = serde_json::json!({"orphan": true});

        match self.repository.insert(&association).await {
            Ok(()) => {
                info!(
                    sandbox_id = %container.id,
                    project_id = %container.project_id,
                    "adopted orphan container"
                );
                true
            }
            Err(e) => {
                error!(sandbox_id = %container.id, error = %e, "failed to record adopted orphan");
                false
            }
        }
    }
}
