//! Worker configuration, loaded from TOML with defaults for everything but
//! provider credentials.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use berth_agent::config::{AgentSessionConfig, LlmSettings, ProcessorConfig, ToolsConfig};
use berth_sandbox::adapter::SandboxProfile;
use berth_sandbox::reconciler::OrphanPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicyConfig {
    Adopt,
    #[default]
    Terminate,
    Ignore,
}

impl From<OrphanPolicyConfig> for OrphanPolicy {
    fn from(config: OrphanPolicyConfig) -> Self {
        match config {
            OrphanPolicyConfig::Adopt => OrphanPolicy::Adopt,
            OrphanPolicyConfig::Terminate => OrphanPolicy::Terminate,
            OrphanPolicyConfig::Ignore => OrphanPolicy::Ignore,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Root directory where project workspaces live.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default)]
    pub orphan_policy: OrphanPolicyConfig,
    #[serde(default = "default_max_orphan_age_hours")]
    pub max_orphan_age_hours: i64,
    #[serde(default = "default_search_endpoint")]
    pub search_endpoint: String,
    #[serde(default)]
    pub search_api_key: Option<String>,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_tool_cache_ttl")]
    pub tool_cache_ttl_seconds: u64,
    #[serde(default)]
    pub sandbox_profile: SandboxProfile,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("berth.db")
}
fn default_workspace_root() -> PathBuf {
    PathBuf::from("/var/lib/berth/projects")
}
fn default_max_orphan_age_hours() -> i64 {
    24
}
fn default_search_endpoint() -> String {
    "https://api.tavily.com/search".to_string()
}
fn default_idle_timeout() -> u64 {
    1800
}
fn default_tool_cache_ttl() -> u64 {
    300
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            workspace_root: default_workspace_root(),
            orphan_policy: OrphanPolicyConfig::default(),
            max_orphan_age_hours: default_max_orphan_age_hours(),
            search_endpoint: default_search_endpoint(),
            search_api_key: None,
            llm: LlmSettings::default(),
            processor: ProcessorConfig::default(),
            tools: ToolsConfig::default(),
            idle_timeout_seconds: default_idle_timeout(),
            tool_cache_ttl_seconds: default_tool_cache_ttl(),
            sandbox_profile: SandboxProfile::default(),
        }
    }
}

impl WorkerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", path.display()))?;
        let config = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("cannot parse config {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Session template handed to the orchestrator; tenant and project are
    /// filled per conversation.
    pub fn session_template(&self) -> AgentSessionConfig {
        let mut template = AgentSessionConfig::new("", "");
        template.llm = self.llm.clone();
        template.processor = self.processor.clone();
        template.tools = self.tools.clone();
        template.idle_timeout_seconds = self.idle_timeout_seconds;
        template.tool_cache_ttl_seconds = self.tool_cache_ttl_seconds;
        template.sandbox_profile = self.sandbox_profile;
        template
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_full_defaults() {
        let config: WorkerConfig = toml::from_str("").unwrap();
        assert_eq!(config.db_path, PathBuf::from("berth.db"));
        assert_eq!(config.orphan_policy, OrphanPolicyConfig::Terminate);
        assert_eq!(config.max_orphan_age_hours, 24);
        assert_eq!(config.idle_timeout_seconds, 1800);
    }

    #[test]
    fn partial_toml_overrides_selected_fields() {
        let config: WorkerConfig = toml::from_str(
            r#"
            db_path = "/data/berth.db"
            orphan_policy = "adopt"

            [llm]
            model = "deluxe-13b"
            cost_per_1k_prompt_usd = 0.002
            "#,
        )
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/data/berth.db"));
        assert_eq!(config.orphan_policy, OrphanPolicyConfig::Adopt);
        assert_eq!(config.llm.model, "deluxe-13b");
        assert_eq!(config.llm.temperature, 0.7);
    }

    #[test]
    fn session_template_carries_worker_settings() {
        let mut config = WorkerConfig::default();
        config.idle_timeout_seconds = 90;
        config.llm.model = "m".into();

        let template = config.session_template();
        assert_eq!(template.idle_timeout_seconds, 90);
        assert_eq!(template.llm.model, "m");
        assert!(template.tenant_id.is_empty(), "filled per conversation");
    }
}
