//! Port over the container runtime.
//!
//! The adapter is a pure imperative surface; retries, locking, and state
//! bookkeeping all live in the [`service`](crate::service) layer. `call_tool`
//! is the only path by which session-layer code talks to a tool process
//! inside a container.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::SandboxResult;

/// Resource profile presets for new containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxProfile {
    /// Minimal footprint for quick shell/file work.
    Lite,
    /// The default profile.
    #[default]
    Standard,
    /// Desktop-enabled profile for computer-use sessions.
    Full,
}

/// Concrete container configuration resolved from a profile plus overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub image: String,
    pub memory_limit_mb: u64,
    pub cpu_limit: f64,
    pub timeout_seconds: u64,
    pub desktop_enabled: bool,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Overrides applied on top of a profile's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxConfigOverride {
    pub image: Option<String>,
    pub memory_limit_mb: Option<u64>,
    pub cpu_limit: Option<f64>,
    pub timeout_seconds: Option<u64>,
    pub desktop_enabled: Option<bool>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

pub const DEFAULT_SANDBOX_IMAGE: &str = "berth/sandbox:latest";

impl SandboxProfile {
    /// Base configuration for the profile.
    pub fn base_config(self) -> SandboxConfig {
        match self {
            SandboxProfile::Lite => SandboxConfig {
                image: DEFAULT_SANDBOX_IMAGE.to_string(),
                memory_limit_mb: 512,
                cpu_limit: 0.5,
                timeout_seconds: 300,
                desktop_enabled: false,
                environment: BTreeMap::new(),
            },
            SandboxProfile::Standard => SandboxConfig {
                image: DEFAULT_SANDBOX_IMAGE.to_string(),
                memory_limit_mb: 2048,
                cpu_limit: 2.0,
                timeout_seconds: 1800,
                desktop_enabled: false,
                environment: BTreeMap::new(),
            },
            SandboxProfile::Full => SandboxConfig {
                image: DEFAULT_SANDBOX_IMAGE.to_string(),
                memory_limit_mb: 4096,
                cpu_limit: 4.0,
                timeout_seconds: 3600,
                desktop_enabled: true,
                environment: BTreeMap::new(),
            },
        }
    }

    /// Resolve the profile with optional overrides applied on top.
    pub fn resolve(self, overrides: Option<&SandboxConfigOverride>) -> SandboxConfig {
        let mut config = self.base_config();
        if let Some(ov) = overrides {
            if let Some(image) = &ov.image {
                config.image = image.clone();
            }
            if let Some(mem) = ov.memory_limit_mb {
                config.memory_limit_mb = mem;
            }
            if let Some(cpu) = ov.cpu_limit {
                config.cpu_limit = cpu;
            }
            if let Some(timeout) = ov.timeout_seconds {
                config.timeout_seconds = timeout;
            }
            if let Some(desktop) = ov.desktop_enabled {
                config.desktop_enabled = desktop;
            }
            config
                .environment
                .extend(ov.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        config
    }
}

/// A live container as seen by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInstance {
    /// Logical sandbox id (stable across container replacements).
    pub id: String,
    /// Transient runtime handle of the current container.
    pub container_ref: String,
    pub project_id: String,
    pub tenant_id: String,
    pub running: bool,
    pub endpoint: Option<String>,
    pub created_at: time::OffsetDateTime,
}

/// Structured result of a tool call inside a container.
///
/// Tool-level failures are data, not errors: `is_error` is set and `content`
/// carries the failure text so the session layer can hand it back to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub is_error: bool,
    pub content: serde_json::Value,
}

impl ToolOutcome {
    pub fn ok(content: serde_json::Value) -> Self {
        Self {
            is_error: false,
            content,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            content: serde_json::Value::String(message.into()),
        }
    }
}

/// Descriptor of a tool exposed by a container's tool process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Port over the container runtime.
///
/// Transient failures are NOT retried here; the service layer owns retry
/// policy. `create` with an explicit `sandbox_id` reuses that logical id for
/// the new container so tool-descriptor caches stay valid after a restart.
#[async_trait]
pub trait SandboxAdapter: Send + Sync {
    /// Create a new container. When `sandbox_id` is given, the new container
    /// is registered under that existing logical id.
    async fn create(
        &self,
        project_path: &str,
        config: &SandboxConfig,
        project_id: &str,
        tenant_id: &str,
        sandbox_id: Option<&str>,
    ) -> SandboxResult<SandboxInstance>;

    /// Tear down the container behind a logical id.
    async fn terminate(&self, sandbox_id: &str) -> SandboxResult<()>;

    /// Look up the instance behind a logical id, if any.
    async fn get(&self, sandbox_id: &str) -> SandboxResult<Option<SandboxInstance>>;

    /// True runtime state of the container, not the persisted status.
    async fn container_exists(&self, sandbox_id: &str) -> SandboxResult<bool>;

    /// Probe the container's tool process.
    async fn health_check(&self, sandbox_id: &str) -> SandboxResult<bool>;

    /// Invoke a tool inside the container. Tool-level failures come back as
    /// `ToolOutcome { is_error: true, .. }`, not as `Err`.
    async fn call_tool(
        &self,
        sandbox_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> SandboxResult<ToolOutcome>;

    /// Descriptors of the tools exposed by the container.
    async fn list_tools(&self, sandbox_id: &str) -> SandboxResult<Vec<SandboxToolDescriptor>>;

    /// Remove any stray containers labelled with the project, regardless of
    /// whether they are tracked.
    async fn cleanup_project_containers(&self, project_id: &str) -> SandboxResult<u32>;

    /// All running containers carrying the managed-sandbox label, for the
    /// startup reconciliation sweep.
    async fn list_managed_containers(&self) -> SandboxResult<Vec<SandboxInstance>>;

    /// Best-effort post-create hook to attach the tool control channel.
    /// Failures are logged by the caller, never fatal.
    async fn connect_control_channel(&self, _sandbox_id: &str) -> SandboxResult<()> {
        Ok(())
    }
}
