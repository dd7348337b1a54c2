//! Configuration structs for the session layer.
//!
//! Every knob the platform honours lives here with its serde default, so a
//! TOML config file only needs to state what differs from stock.

use serde::{Deserialize, Serialize};

use berth_sandbox::adapter::SandboxProfile;

/// Coordinates and limits for the LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_seconds: u64,
    /// USD per 1k prompt tokens; zero disables cost reporting amounts.
    #[serde(default)]
    pub cost_per_1k_prompt_usd: f64,
    #[serde(default)]
    pub cost_per_1k_completion_usd: f64,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_request_timeout() -> u64 {
    60
}
fn default_stream_timeout() -> u64 {
    300
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            api_key: None,
            base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_seconds: default_request_timeout(),
            stream_timeout_seconds: default_stream_timeout(),
            cost_per_1k_prompt_usd: 0.0,
            cost_per_1k_completion_usd: 0.0,
        }
    }
}

/// Per-tool permission policy enforced by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionMatrix {
    #[serde(default = "default_true")]
    pub allow_command_execution: bool,
    #[serde(default = "default_true")]
    pub allow_file_write: bool,
    #[serde(default = "default_true")]
    pub allow_web_access: bool,
    #[serde(default)]
    pub allow_screenshot: bool,
    #[serde(default)]
    pub allow_computer_use: bool,
    #[serde(default = "default_true")]
    pub allow_env_var_requests: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PermissionMatrix {
    fn default() -> Self {
        Self {
            allow_command_execution: true,
            allow_file_write: true,
            allow_web_access: true,
            allow_screenshot: false,
            allow_computer_use: false,
            allow_env_var_requests: true,
        }
    }
}

/// Knobs for one ReAct turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Step ceiling for session-mode turns.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Abort when the same (tool, arguments) pair repeats this many times
    /// within the sliding window.
    #[serde(default = "default_doom_loop_threshold")]
    pub doom_loop_threshold: u32,
    #[serde(default = "default_doom_loop_window")]
    pub doom_loop_window: usize,
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_seconds: u64,
    #[serde(default = "default_llm_retry_attempts")]
    pub llm_retry_attempts: u32,
    #[serde(default = "default_llm_retry_base")]
    pub llm_retry_base_seconds: u64,
    /// Soft context cap; exceeding it triggers one compaction per turn.
    #[serde(default = "default_context_soft_cap")]
    pub context_soft_cap_tokens: usize,
    /// Messages preserved verbatim at the tail during compaction.
    #[serde(default = "default_context_keep_recent")]
    pub context_keep_recent: usize,
}

fn default_max_steps() -> u32 {
    20
}
/// Step ceiling for one-shot (per-request) execution.
pub const PER_REQUEST_MAX_STEPS: u32 = 50;

fn default_doom_loop_threshold() -> u32 {
    3
}
fn default_doom_loop_window() -> usize {
    8
}
fn default_tool_timeout() -> u64 {
    30
}
fn default_llm_retry_attempts() -> u32 {
    3
}
fn default_llm_retry_base() -> u64 {
    1
}
fn default_context_soft_cap() -> usize {
    24_000
}
fn default_context_keep_recent() -> usize {
    6
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            doom_loop_threshold: default_doom_loop_threshold(),
            doom_loop_window: default_doom_loop_window(),
            tool_timeout_seconds: default_tool_timeout(),
            llm_retry_attempts: default_llm_retry_attempts(),
            llm_retry_base_seconds: default_llm_retry_base(),
            context_soft_cap_tokens: default_context_soft_cap(),
            context_keep_recent: default_context_keep_recent(),
        }
    }
}

/// Tool-layer knobs shared across a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub permissions: PermissionMatrix,
    #[serde(default = "default_hitl_timeout")]
    pub hitl_timeout_seconds: u64,
    #[serde(default = "default_web_cache_ttl")]
    pub web_cache_ttl_seconds: u64,
    #[serde(default = "default_web_max_results")]
    pub web_max_results: usize,
}

pub fn default_hitl_timeout() -> u64 {
    300
}
fn default_web_cache_ttl() -> u64 {
    900
}
fn default_web_max_results() -> usize {
    5
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            permissions: PermissionMatrix::default(),
            hitl_timeout_seconds: default_hitl_timeout(),
            web_cache_ttl_seconds: default_web_cache_ttl(),
            web_max_results: default_web_max_results(),
        }
    }
}

/// Configuration a session workflow starts from; durable across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSessionConfig {
    pub tenant_id: String,
    pub project_id: String,
    #[serde(default = "default_agent_mode")]
    pub agent_mode: String,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    /// TTL of the per-sandbox tool-descriptor cache.
    #[serde(default = "default_tool_cache_ttl")]
    pub tool_cache_ttl_seconds: u64,
    #[serde(default)]
    pub sandbox_profile: SandboxProfile,
}

fn default_agent_mode() -> String {
    "default".to_string()
}
fn default_idle_timeout() -> u64 {
    1800
}
fn default_tool_cache_ttl() -> u64 {
    300
}

impl AgentSessionConfig {
    pub fn new(tenant_id: &str, project_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            project_id: project_id.to_string(),
            agent_mode: default_agent_mode(),
            llm: LlmSettings::default(),
            processor: ProcessorConfig::default(),
            tools: ToolsConfig::default(),
            idle_timeout_seconds: default_idle_timeout(),
            tool_cache_ttl_seconds: default_tool_cache_ttl(),
            sandbox_profile: SandboxProfile::default(),
        }
    }
}
