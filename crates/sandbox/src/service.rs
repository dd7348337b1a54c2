//! Single-writer lifecycle coordinator for project sandboxes.
//!
//! Writer exclusion is layered three deep:
//!
//! 1. `UNIQUE(project_id)` in the repository — two rows cannot exist.
//! 2. The distributed lock (`sandbox:create:{project_id}`) — writers in other
//!    processes are serialised.
//! 3. A per-project in-process mutex — redundant work inside one worker is
//!    avoided.
//!
//! Creation collisions surface as [`SandboxError::CreationConflict`] and are
//! retried by [`SandboxService::get_or_create`] with linear backoff before
//! falling back to the row the winning writer produced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{
    SandboxAdapter, SandboxConfigOverride, SandboxProfile, ToolOutcome,
};
use crate::domain::ProjectSandbox;
use crate::error::{SandboxError, SandboxResult};
use crate::lock::DistributedLock;
use crate::repository::SandboxRepository;
use crate::state::SandboxState;

/// Tunables for the lifecycle service.
#[derive(Debug, Clone)]
pub struct SandboxServiceConfig {
    pub default_profile: SandboxProfile,
    /// Minimum seconds between adapter health probes; inside the window the
    /// cached verdict is served.
    pub health_check_interval_seconds: i64,
    pub lock_ttl: Duration,
    pub lock_acquire_timeout: Duration,
    pub max_create_attempts: u32,
    /// Host directory that project workspaces are mounted from.
    pub project_root: String,
    pub tool_call_timeout: Duration,
}

impl Default for SandboxServiceConfig {
    fn default() -> Self {
        Self {
            default_profile: SandboxProfile::Standard,
            health_check_interval_seconds: 60,
            lock_ttl: Duration::from_secs(120),
            lock_acquire_timeout: Duration::from_secs(30),
            max_create_attempts: 3,
            project_root: "/var/lib/berth/projects".to_string(),
            tool_call_timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot of a sandbox handed to callers (never the mutable row itself).
#[derive(Debug, Clone)]
pub struct SandboxStatusInfo {
    pub sandbox_id: String,
    pub project_id: String,
    pub tenant_id: String,
    pub status: SandboxState,
    pub endpoint: Option<String>,
    pub created_at: time::OffsetDateTime,
    pub last_accessed_at: time::OffsetDateTime,
    pub is_healthy: bool,
    pub error_message: Option<String>,
    pub available_tools: Vec<String>,
}

/// The only writer to a given `ProjectSandbox` row.
pub struct SandboxService {
    repository: Arc<dyn SandboxRepository>,
    adapter: Arc<dyn SandboxAdapter>,
    lock: Option<Arc<dyn DistributedLock>>,
    config: SandboxServiceConfig,
    project_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SandboxService {
    pub fn new(
        repository: Arc<dyn SandboxRepository>,
        adapter: Arc<dyn SandboxAdapter>,
        lock: Option<Arc<dyn DistributedLock>>,
        config: SandboxServiceConfig,
    ) -> Self {
        Self {
            repository,
            adapter,
            lock,
            config,
            project_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn adapter(&self) -> &Arc<dyn SandboxAdapter> {
        &self.adapter
    }

    pub fn repository(&self) -> &Arc<dyn SandboxRepository> {
        &self.repository
    }

    async fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.project_locks.lock().await;
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn drop_project_lock(&self, project_id: &str) {
        self.project_locks.lock().await.remove(project_id);
    }

    /// Get the project's sandbox, creating it lazily.
    ///
    /// Repeated calls are idempotent: as long as the container stays usable
    /// the same `sandbox_id` comes back. On a creation collision the call
    /// retries up to `max_create_attempts` with linear backoff and finally
    /// adopts the row the concurrent writer produced.
    pub async fn get_or_create(
        &self,
        project_id: &str,
        tenant_id: &str,
        profile: Option<SandboxProfile>,
        overrides: Option<&SandboxConfigOverride>,
    ) -> SandboxResult<SandboxStatusInfo> {
        let attempts = self.config.max_create_attempts.max(1);
        for attempt in 0..attempts {
            match self
                .get_or_create_impl(project_id, tenant_id, profile, overrides)
                .await
            {
                Ok(info) => return Ok(info),
                Err(e) if e.is_conflict() => {
                    info!(
                        project_id,
                        attempt = attempt + 1,
                        "concurrent sandbox creation detected, retrying"
                    );
                    if attempt + 1 < attempts {
                        tokio::time::sleep(Duration::from_millis(200 * (attempt as u64 + 1)))
                            .await;
                        continue;
                    }
                    // Final attempt: adopt whatever the winner created.
                    if let Some(existing) = self.repository.find_by_project(project_id).await? {
                        return self.build_info(&existing).await;
                    }
                    return Err(SandboxError::CreationFailed {
                        project_id: project_id.to_string(),
                        attempts,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Err(SandboxError::CreationFailed {
            project_id: project_id.to_string(),
            attempts,
        })
    }

    async fn get_or_create_impl(
        &self,
        project_id: &str,
        tenant_id: &str,
        profile: Option<SandboxProfile>,
        overrides: Option<&SandboxConfigOverride>,
    ) -> SandboxResult<SandboxStatusInfo> {
        let project_lock = self.project_lock(project_id).await;
        let _in_process = project_lock.lock().await;

        let lock_key = format!("sandbox:create:{project_id}");
        let mut lock_handle = None;

        if let Some(lock) = &self.lock {
            lock_handle = lock
                .acquire(
                    &lock_key,
                    self.config.lock_ttl,
                    true,
                    self.config.lock_acquire_timeout,
                )
                .await?;

            if lock_handle.is_none() {
                // Another process is mid-creation. Give it a moment, then
                // either adopt its result or report the collision upward.
                tokio::time::sleep(Duration::from_secs(1)).await;
                if let Some(existing) = self.repository.find_by_project(project_id).await? {
                    if existing.is_usable() {
                        let mut existing = existing;
                        existing.mark_accessed();
                        self.repository.update(&existing).await?;
                        return self.build_info(&existing).await;
                    }
                }
                return Err(SandboxError::conflict(project_id));
            }
        }

        let result = self
            .get_or_create_locked(project_id, tenant_id, profile, overrides)
            .await;

        if let (Some(lock), Some(handle)) = (&self.lock, lock_handle) {
            if let Err(e) = lock.release(handle).await {
                warn!(project_id, error = %e, "failed to release sandbox creation lock");
            }
        }

        result
    }

    async fn get_or_create_locked(
        &self,
        project_id: &str,
        tenant_id: &str,
        profile: Option<SandboxProfile>,
        overrides: Option<&SandboxConfigOverride>,
    ) -> SandboxResult<SandboxStatusInfo> {
        // Double-check under the lock.
        if let Some(existing) = self.repository.find_by_project(project_id).await? {
            if existing.is_usable() {
                if self.adapter.container_exists(&existing.sandbox_id).await? {
                    let mut existing = existing;
                    existing.mark_accessed();
                    self.repository.update(&existing).await?;
                    return self.build_info(&existing).await;
                }
                // Container was killed externally: clean up and recreate.
                self.cleanup_failed(&existing).await;
            } else if existing.status.is_recoverable() {
                self.cleanup_failed(&existing).await;
            } else if existing.is_active() {
                // A writer in this or another process is still starting it.
                return Err(SandboxError::conflict(project_id));
            } else {
                // Terminated rows are dead weight; replace them.
                self.cleanup_failed(&existing).await;
            }
        }

        self.create_new(project_id, tenant_id, profile, overrides)
            .await
    }

    async fn create_new(
        &self,
        project_id: &str,
        tenant_id: &str,
        profile: Option<SandboxProfile>,
        overrides: Option<&SandboxConfigOverride>,
    ) -> SandboxResult<SandboxStatusInfo> {
        let sandbox_id = format!("proj-sb-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let project_path = format!("{}/{}", self.config.project_root, project_id);

        // Expose the row to other processes before the (slow) container
        // create; the unique constraint arbitrates concurrent writers.
        let mut association = ProjectSandbox::new(project_id, tenant_id, &sandbox_id);
        self.repository.insert(&association).await?;

        let config = profile
            .unwrap_or(self.config.default_profile)
            .resolve(overrides);

        match self
            .adapter
            .create(&project_path, &config, project_id, tenant_id, None)
            .await
        {
            Ok(instance) => {
                association.sandbox_id = instance.id.clone();
                association.started_at = Some(time::OffsetDateTime::now_utc());
                association.mark_healthy();
                self.repository.update(&association).await?;

                if let Err(e) = self.adapter.connect_control_channel(&instance.id).await {
                    warn!(sandbox_id = %instance.id, error = %e, "failed to connect control channel");
                }

                info!(project_id, sandbox_id = %instance.id, "created sandbox");
                self.build_info(&association).await
            }
            Err(e) => {
                error!(project_id, error = %e, "sandbox creation failed");
                association.mark_error(&e.to_string());
                self.repository.update(&association).await?;
                Err(e)
            }
        }
    }

    /// Execute a tool in the project's sandbox. Does NOT auto-create.
    pub async fn execute_tool(
        &self,
        project_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
    ) -> SandboxResult<ToolOutcome> {
        let mut association = self
            .repository
            .find_by_project(project_id)
            .await?
            .ok_or_else(|| SandboxError::not_found(project_id))?;

        association.mark_accessed();
        self.repository.update(&association).await?;

        self.adapter
            .call_tool(
                &association.sandbox_id,
                tool_name,
                arguments,
                timeout.unwrap_or(self.config.tool_call_timeout),
            )
            .await
    }

    /// Replace the container while preserving the logical `sandbox_id`.
    pub async fn restart(&self, project_id: &str) -> SandboxResult<SandboxStatusInfo> {
        let project_lock = self.project_lock(project_id).await;
        let _guard = project_lock.lock().await;

        let mut association = self
            .repository
            .find_by_project(project_id)
            .await?
            .ok_or_else(|| SandboxError::not_found(project_id))?;

        let original_sandbox_id = association.sandbox_id.clone();
        let project_path = format!("{}/{}", self.config.project_root, project_id);

        if let Err(e) = self.adapter.terminate(&original_sandbox_id).await {
            debug!(sandbox_id = %original_sandbox_id, error = %e, "old container terminate failed");
        }
        if let Err(e) = self.adapter.cleanup_project_containers(project_id).await {
            warn!(project_id, error = %e, "failed to clean up project containers");
        }

        association.status = SandboxState::Starting;
        association.error_message = None;
        self.repository.update(&association).await?;

        let config = self.config.default_profile.resolve(None);
        match self
            .adapter
            .create(
                &project_path,
                &config,
                project_id,
                &association.tenant_id,
                Some(&original_sandbox_id),
            )
            .await
        {
            Ok(instance) => {
                association.sandbox_id = instance.id.clone();
                association.started_at = Some(time::OffsetDateTime::now_utc());
                association.mark_healthy();
                self.repository.update(&association).await?;

                if let Err(e) = self.adapter.connect_control_channel(&instance.id).await {
                    warn!(sandbox_id = %instance.id, error = %e, "failed to connect control channel");
                }

                info!(project_id, sandbox_id = %instance.id, "restarted sandbox");
                self.build_info(&association).await
            }
            Err(e) => {
                association.mark_error(&format!("restart failed: {e}"));
                self.repository.update(&association).await?;
                Err(e)
            }
        }
    }

    /// Terminate the project's sandbox. Returns false when there was nothing
    /// to terminate or the runtime refused.
    pub async fn terminate(&self, project_id: &str, delete_association: bool) -> bool {
        let association = match self.repository.find_by_project(project_id).await {
            Ok(Some(a)) => a,
            Ok(None) => {
                warn!(project_id, "no sandbox association to terminate");
                return false;
            }
            Err(e) => {
                error!(project_id, error = %e, "failed to load sandbox association");
                return false;
            }
        };

        let mut association = association;
        if let Err(e) = self.adapter.terminate(&association.sandbox_id).await {
            error!(project_id, error = %e, "failed to terminate sandbox");
            return false;
        }

        association.mark_terminated();
        if let Err(e) = self.repository.update(&association).await {
            error!(project_id, error = %e, "failed to persist terminated status");
            return false;
        }

        if delete_association {
            if let Err(e) = self.repository.delete(&association.id).await {
                error!(project_id, error = %e, "failed to delete sandbox association");
                return false;
            }
            self.drop_project_lock(project_id).await;
        }

        info!(project_id, "terminated sandbox");
        true
    }

    /// Health-check the project's sandbox, serving a cached verdict inside
    /// the check interval.
    pub async fn health_check(&self, project_id: &str) -> SandboxResult<bool> {
        let Some(mut association) = self.repository.find_by_project(project_id).await? else {
            return Ok(false);
        };

        if !association.needs_health_check(self.config.health_check_interval_seconds) {
            return Ok(association.is_usable());
        }

        match self.adapter.health_check(&association.sandbox_id).await {
            Ok(true) => {
                association.mark_healthy();
                self.repository.update(&association).await?;
                Ok(true)
            }
            Ok(false) => {
                association.mark_unhealthy(Some("health check failed"));
                self.repository.update(&association).await?;
                Ok(false)
            }
            Err(e) => {
                error!(project_id, error = %e, "health check error");
                association.mark_unhealthy(Some(&e.to_string()));
                self.repository.update(&association).await?;
                Ok(false)
            }
        }
    }

    /// Current status without side effects (no creation, no probes).
    pub async fn get_status(&self, project_id: &str) -> SandboxResult<Option<SandboxStatusInfo>> {
        match self.repository.find_by_project(project_id).await? {
            Some(association) => Ok(Some(self.build_info(&association).await?)),
            None => Ok(None),
        }
    }

    /// Push a file into the project's sandbox via the `write` tool.
    ///
    /// Failures are logged, not raised: callers treat file sync as advisory.
    pub async fn sync_file(
        &self,
        project_id: &str,
        filename: &str,
        content_base64: &str,
        destination: &str,
    ) -> bool {
        let bytes = match BASE64.decode(content_base64) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(project_id, filename, error = %e, "invalid base64 content");
                return false;
            }
        };
        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(e) => {
                error!(project_id, filename, error = %e, "file content is not utf-8");
                return false;
            }
        };

        let association = match self.repository.find_by_project(project_id).await {
            Ok(Some(a)) => a,
            Ok(None) => {
                warn!(project_id, "no sandbox found for file sync");
                return false;
            }
            Err(e) => {
                error!(project_id, error = %e, "failed to load sandbox for file sync");
                return false;
            }
        };

        if let Err(e) = self
            .get_or_create(project_id, &association.tenant_id, None, None)
            .await
        {
            error!(project_id, error = %e, "failed to ensure sandbox for file sync");
            return false;
        }

        let args = serde_json::json!({
            "file_path": format!("{destination}/{filename}"),
            "content": content,
        });
        match self.execute_tool(project_id, "write", args, None).await {
            Ok(outcome) if !outcome.is_error => {
                debug!(project_id, filename, "synced file into sandbox");
                true
            }
            Ok(outcome) => {
                error!(project_id, filename, content = %outcome.content, "sandbox write tool failed");
                false
            }
            Err(e) => {
                error!(project_id, filename, error = %e, "file sync failed");
                false
            }
        }
    }

    /// Terminate the container and delete the row, used when a dead or
    /// errored association blocks recreation.
    async fn cleanup_failed(&self, association: &ProjectSandbox) {
        if let Err(e) = self.adapter.terminate(&association.sandbox_id).await {
            debug!(sandbox_id = %association.sandbox_id, error = %e, "terminate during cleanup failed");
        }
        if let Err(e) = self
            .adapter
            .cleanup_project_containers(&association.project_id)
            .await
        {
            warn!(project_id = %association.project_id, error = %e, "orphan container cleanup failed");
        }
        match self.repository.delete(&association.id).await {
            Ok(()) => info!(
                project_id = %association.project_id,
                association_id = %association.id,
                "deleted failed sandbox association"
            ),
            Err(e) => error!(
                association_id = %association.id,
                error = %e,
                "failed to delete sandbox association"
            ),
        }
    }

    async fn build_info(&self, association: &ProjectSandbox) -> SandboxResult<SandboxStatusInfo> {
        let instance = self.adapter.get(&association.sandbox_id).await?;

        let is_healthy = association.status == SandboxState::Running
            && instance.as_ref().map(|i| i.running).unwrap_or(false);

        let available_tools = if is_healthy {
            match self.adapter.list_tools(&association.sandbox_id).await {
                Ok(tools) => tools.into_iter().map(|t| t.name).collect(),
                Err(e) => {
                    debug!(sandbox_id = %association.sandbox_id, error = %e, "failed to list sandbox tools");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok(SandboxStatusInfo {
            sandbox_id: association.sandbox_id.clone(),
            project_id: association.project_id.clone(),
            tenant_id: association.tenant_id.clone(),
            status: association.status,
            endpoint: instance.and_then(|i| i.endpoint),
            created_at: association.created_at,
            last_accessed_at: association.last_accessed_at,
            is_healthy,
            error_message: association.error_message.clone(),
            available_tools,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{SandboxConfig, SandboxInstance, SandboxToolDescriptor};
    use crate::lock::LocalLockManager;
    use crate::repository::SqliteSandboxRepository;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct FakeRuntimeState {
        containers: HashMap<String, SandboxInstance>,
        create_calls: u32,
        health: bool,
        fail_create: bool,
        tool_calls: Vec<(String, String, serde_json::Value)>,
    }

    /// In-memory adapter standing in for the container runtime.
    #[derive(Default)]
    struct FakeAdapter {
        state: SyncMutex<FakeRuntimeState>,
    }

    impl FakeAdapter {
        fn healthy() -> Self {
            let fake = Self::default();
            fake.state.lock().health = true;
            fake
        }

        fn create_calls(&self) -> u32 {
            self.state.lock().create_calls
        }

        fn kill_container(&self, sandbox_id: &str) {
            self.state.lock().containers.remove(sandbox_id);
        }

        fn recorded_tool_calls(&self) -> Vec<(String, String, serde_json::Value)> {
            self.state.lock().tool_calls.clone()
        }
    }

    #[async_trait]
    impl SandboxAdapter for FakeAdapter {
        async fn create(
            &self,
            _project_path: &str,
            _config: &SandboxConfig,
            project_id: &str,
            tenant_id: &str,
            sandbox_id: Option<&str>,
        ) -> SandboxResult<SandboxInstance> {
            // Simulate container boot latency so concurrent callers overlap.
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut state = self.state.lock();
            state.create_calls += 1;
            if state.fail_create {
                return Err(SandboxError::Adapter("image pull failed".into()));
            }
            let id = sandbox_id
                .map(str::to_string)
                .unwrap_or_else(|| format!("sb-{}", state.create_calls));
            let instance = SandboxInstance {
                id: id.clone(),
                container_ref: format!("ctr-{}", state.create_calls),
                project_id: project_id.to_string(),
                tenant_id: tenant_id.to_string(),
                running: true,
                endpoint: Some(format!("http://sandbox/{id}")),
                created_at: time::OffsetDateTime::now_utc(),
            };
            state.containers.insert(id, instance.clone());
            Ok(instance)
        }

        async fn terminate(&self, sandbox_id: &str) -> SandboxResult<()> {
            self.state.lock().containers.remove(sandbox_id);
            Ok(())
        }

        async fn get(&self, sandbox_id: &str) -> SandboxResult<Option<SandboxInstance>> {
            Ok(self.state.lock().containers.get(sandbox_id).cloned())
        }

        async fn container_exists(&self, sandbox_id: &str) -> SandboxResult<bool> {
            Ok(self.state.lock().containers.contains_key(sandbox_id))
        }

        async fn health_check(&self, _sandbox_id: &str) -> SandboxResult<bool> {
            Ok(self.state.lock().health)
        }

        async fn call_tool(
            &self,
            sandbox_id: &str,
            tool_name: &str,
            arguments: serde_json::Value,
            _timeout: Duration,
        ) -> SandboxResult<ToolOutcome> {
            self.state.lock().tool_calls.push((
                sandbox_id.to_string(),
                tool_name.to_string(),
                arguments,
            ));
            Ok(ToolOutcome::ok(serde_json::json!({"stdout": "ok"})))
        }

        async fn list_tools(&self, _sandbox_id: &str) -> SandboxResult<Vec<SandboxToolDescriptor>> {
            Ok(vec![SandboxToolDescriptor {
                name: "bash".into(),
                description: "run a shell command".into(),
                parameters: serde_json::json!({"type": "object"}),
            }])
        }

        async fn cleanup_project_containers(&self, project_id: &str) -> SandboxResult<u32> {
            let mut state = self.state.lock();
            let before = state.containers.len();
            state.containers.retain(|_, c| c.project_id != project_id);
            Ok((before - state.containers.len()) as u32)
        }

        async fn list_managed_containers(&self) -> SandboxResult<Vec<SandboxInstance>> {
            Ok(self.state.lock().containers.values().cloned().collect())
        }
    }

    async fn service_with(adapter: Arc<FakeAdapter>) -> SandboxService {
        let repo = Arc::new(
            SqliteSandboxRepository::connect(":memory:".into())
                .await
                .unwrap(),
        );
        SandboxService::new(
            repo,
            adapter,
            Some(Arc::new(LocalLockManager::new())),
            SandboxServiceConfig::default(),
        )
    }

    // ── get_or_create ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn lazy_creation_produces_running_sandbox() {
        let adapter = Arc::new(FakeAdapter::healthy());
        let service = service_with(adapter.clone()).await;

        let info = service
            .get_or_create("proj-1", "tenant-1", None, None)
            .await
            .unwrap();

        assert_eq!(info.status, SandboxState::Running);
        assert!(info.is_healthy);
        assert!(info.available_tools.contains(&"bash".to_string()));
        assert_eq!(adapter.create_calls(), 1);
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_while_usable() {
        let adapter = Arc::new(FakeAdapter::healthy());
        let service = service_with(adapter.clone()).await;

        let first = service
            .get_or_create("proj-1", "t", None, None)
            .await
            .unwrap();
        let second = service
            .get_or_create("proj-1", "t", None, None)
            .await
            .unwrap();

        assert_eq!(first.sandbox_id, second.sandbox_id);
        assert_eq!(adapter.create_calls(), 1, "no second container create");
    }

    #[tokio::test]
    async fn concurrent_get_or_create_creates_exactly_one_container() {
        let adapter = Arc::new(FakeAdapter::healthy());
        let service = Arc::new(service_with(adapter.clone()).await);

        let a = {
            let service = service.clone();
            tokio::spawn(async move { service.get_or_create("proj-1", "t", None, None).await })
        };
        let b = {
            let service = service.clone();
            tokio::spawn(async move { service.get_or_create("proj-1", "t", None, None).await })
        };

        let info_a = a.await.unwrap().unwrap();
        let info_b = b.await.unwrap().unwrap();

        assert_eq!(info_a.sandbox_id, info_b.sandbox_id);
        assert_eq!(adapter.create_calls(), 1, "exactly one container created");

        let rows = service.repository().list().await.unwrap();
        assert_eq!(rows.len(), 1, "unique constraint held");
    }

    #[tokio::test]
    async fn externally_killed_container_is_recreated() {
        let adapter = Arc::new(FakeAdapter::healthy());
        let service = service_with(adapter.clone()).await;

        let first = service
            .get_or_create("proj-1", "t", None, None)
            .await
            .unwrap();
        adapter.kill_container(&first.sandbox_id);

        let second = service
            .get_or_create("proj-1", "t", None, None)
            .await
            .unwrap();

        assert_ne!(first.sandbox_id, second.sandbox_id);
        assert_eq!(adapter.create_calls(), 2);
        assert_eq!(service.repository().list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn creation_failure_marks_row_error_and_raises() {
        let adapter = Arc::new(FakeAdapter::default());
        adapter.state.lock().fail_create = true;
        let service = service_with(adapter.clone()).await;

        let err = service
            .get_or_create("proj-1", "t", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Adapter(_)));

        let row = service
            .repository()
            .find_by_project("proj-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, SandboxState::Error);
        assert!(row.error_message.is_some());
    }

    #[tokio::test]
    async fn errored_row_is_cleaned_up_and_recreated() {
        let adapter = Arc::new(FakeAdapter::default());
        adapter.state.lock().fail_create = true;
        let service = service_with(adapter.clone()).await;

        let _ = service.get_or_create("proj-1", "t", None, None).await;

        adapter.state.lock().fail_create = false;
        let info = service
            .get_or_create("proj-1", "t", None, None)
            .await
            .unwrap();
        assert_eq!(info.status, SandboxState::Running);
    }

    // ── execute_tool ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn execute_tool_requires_existing_sandbox() {
        let service = service_with(Arc::new(FakeAdapter::healthy())).await;
        let err = service
            .execute_tool("proj-none", "bash", serde_json::json!({"command": "ls"}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::NotFound { .. }));
    }

    #[tokio::test]
    async fn execute_tool_routes_through_adapter_and_touches_row() {
        let adapter = Arc::new(FakeAdapter::healthy());
        let service = service_with(adapter.clone()).await;
        let info = service
            .get_or_create("proj-1", "t", None, None)
            .await
            .unwrap();

        let before = service
            .repository()
            .find_by_project("proj-1")
            .await
            .unwrap()
            .unwrap()
            .last_accessed_at;
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let outcome = service
            .execute_tool("proj-1", "bash", serde_json::json!({"command": "ls"}), None)
            .await
            .unwrap();
        assert!(!outcome.is_error);

        let calls = adapter.recorded_tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, info.sandbox_id);
        assert_eq!(calls[0].1, "bash");

        let after = service
            .repository()
            .find_by_project("proj-1")
            .await
            .unwrap()
            .unwrap()
            .last_accessed_at;
        assert!(after > before, "last_accessed_at must advance");
    }

    // ── restart ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn restart_preserves_logical_sandbox_id() {
        let adapter = Arc::new(FakeAdapter::healthy());
        let service = service_with(adapter.clone()).await;

        let first = service
            .get_or_create("proj-1", "t", None, None)
            .await
            .unwrap();
        let restarted = service.restart("proj-1").await.unwrap();

        assert_eq!(first.sandbox_id, restarted.sandbox_id);
        assert_eq!(restarted.status, SandboxState::Running);
        assert_eq!(adapter.create_calls(), 2);
    }

    #[tokio::test]
    async fn restart_without_association_is_not_found() {
        let service = service_with(Arc::new(FakeAdapter::healthy())).await;
        let err = service.restart("proj-none").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound { .. }));
    }

    // ── terminate ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn terminate_with_delete_removes_row_and_container() {
        let adapter = Arc::new(FakeAdapter::healthy());
        let service = service_with(adapter.clone()).await;
        let info = service
            .get_or_create("proj-1", "t", None, None)
            .await
            .unwrap();

        assert!(service.terminate("proj-1", true).await);
        assert!(
            service
                .repository()
                .find_by_project("proj-1")
                .await
                .unwrap()
                .is_none()
        );
        assert!(!adapter.container_exists(&info.sandbox_id).await.unwrap());
    }

    #[tokio::test]
    async fn terminate_keeping_association_marks_terminated() {
        let service = service_with(Arc::new(FakeAdapter::healthy())).await;
        service
            .get_or_create("proj-1", "t", None, None)
            .await
            .unwrap();

        assert!(service.terminate("proj-1", false).await);
        let row = service
            .repository()
            .find_by_project("proj-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, SandboxState::Terminated);
    }

    #[tokio::test]
    async fn terminate_without_association_returns_false() {
        let service = service_with(Arc::new(FakeAdapter::healthy())).await;
        assert!(!service.terminate("proj-none", true).await);
    }

    // ── health_check ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn health_check_serves_cached_verdict_inside_interval() {
        let adapter = Arc::new(FakeAdapter::healthy());
        let service = service_with(adapter.clone()).await;
        service
            .get_or_create("proj-1", "t", None, None)
            .await
            .unwrap();

        // Flipping runtime health must not matter while the cache is fresh:
        // creation just marked the sandbox healthy.
        adapter.state.lock().health = false;
        assert!(service.health_check("proj-1").await.unwrap());
    }

    #[tokio::test]
    async fn expired_cache_probes_adapter_and_records_failure() {
        let adapter = Arc::new(FakeAdapter::healthy());
        let repo = Arc::new(
            SqliteSandboxRepository::connect(":memory:".into())
                .await
                .unwrap(),
        );
        let config = SandboxServiceConfig {
            health_check_interval_seconds: 0,
            ..Default::default()
        };
        let service = SandboxService::new(repo, adapter.clone(), None, config);

        service
            .get_or_create("proj-1", "t", None, None)
            .await
            .unwrap();
        adapter.state.lock().health = false;
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(!service.health_check("proj-1").await.unwrap());
        let row = service
            .repository()
            .find_by_project("proj-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, SandboxState::Error);
        assert_eq!(row.error_message.as_deref(), Some("health check failed"));
    }

    #[tokio::test]
    async fn health_check_of_unknown_project_is_false() {
        let service = service_with(Arc::new(FakeAdapter::healthy())).await;
        assert!(!service.health_check("proj-none").await.unwrap());
    }

    // ── sync_file ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn sync_file_writes_through_the_write_tool() {
        let adapter = Arc::new(FakeAdapter::healthy());
        let service = service_with(adapter.clone()).await;
        service
            .get_or_create("proj-1", "t", None, None)
            .await
            .unwrap();

        let encoded = BASE64.encode("fn main() {}\n");
        assert!(
            service
                .sync_file("proj-1", "main.rs", &encoded, "/workspace")
                .await
        );

        let calls = adapter.recorded_tool_calls();
        let write = calls.iter().find(|(_, name, _)| name == "write").unwrap();
        assert_eq!(write.2["file_path"], "/workspace/main.rs");
        assert_eq!(write.2["content"], "fn main() {}\n");
    }

    #[tokio::test]
    async fn sync_file_rejects_invalid_base64() {
        let service = service_with(Arc::new(FakeAdapter::healthy())).await;
        assert!(
            !service
                .sync_file("proj-1", "x", "not-base64!!!", "/workspace")
                .await
        );
    }
}
