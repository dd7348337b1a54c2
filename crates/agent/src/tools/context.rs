//! Tool protocol: the `Tool` trait, the execution context, and tool errors.
//!
//! Tool failures are deliberately non-fatal: the executor folds them into
//! `observe { status: error }` observations and the turn continues, letting
//! the model decide what to do next.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ToolsConfig;
use crate::graph::GraphService;
use crate::hitl::HitlRegistry;
use crate::llm::{LlmClient, ToolDefinition};
use berth_sandbox::SandboxService;

/// Unified error type for all tools.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("tool timed out after {0}s")]
    Timeout(u64),
    #[error("execution failed: {0}")]
    Execution(String),
}

impl From<crate::error::AgentError> for ToolError {
    fn from(e: crate::error::AgentError) -> Self {
        ToolError::Execution(e.to_string())
    }
}

impl From<berth_sandbox::SandboxError> for ToolError {
    fn from(e: berth_sandbox::SandboxError) -> Self {
        ToolError::Execution(e.to_string())
    }
}

/// Everything a tool may touch during one call.
///
/// The context is built per turn by the processor; tools themselves are
/// stateless and shared across sessions.
#[derive(Clone)]
pub struct ToolContext {
    pub conversation_id: String,
    pub message_id: String,
    pub project_id: String,
    pub user_id: String,
    pub tenant_id: String,
    pub sandbox: Arc<SandboxService>,
    pub hitl: Arc<HitlRegistry>,
    pub graph: Arc<dyn GraphService>,
    pub llm: Arc<dyn LlmClient>,
    pub computer: Option<Arc<dyn ComputerControl>>,
    pub config: ToolsConfig,
}

/// Port for desktop control inside a desktop-enabled sandbox. Separate from
/// the tool-process path on purpose: computer actions have their own
/// permission gate.
#[async_trait]
pub trait ComputerControl: Send + Sync {
    /// Capture the screen; returns base64-encoded PNG data.
    async fn screenshot(&self, project_id: &str) -> Result<String, ToolError>;
    async fn click(&self, project_id: &str, x: i32, y: i32) -> Result<(), ToolError>;
    async fn type_text(&self, project_id: &str, text: &str) -> Result<(), ToolError>;
    async fn scroll(&self, project_id: &str, dx: i32, dy: i32) -> Result<(), ToolError>;
    async fn navigate(&self, project_id: &str, url: &str) -> Result<(), ToolError>;
}

/// A named capability invocable by the model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Declaration shown to the model; `parameters` is a JSON schema.
    fn definition(&self) -> ToolDefinition;

    async fn call(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError>;
}

/// Validate `args` against the subset of JSON schema tools declare:
/// object shape, `required` keys, and primitive `type` tags on properties.
pub fn validate_args(schema: &serde_json::Value, args: &serde_json::Value) -> Result<(), ToolError> {
    let Some(object) = args.as_object() else {
        return Err(ToolError::InvalidArguments(
            "arguments must be a JSON object".into(),
        ));
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !object.contains_key(key) {
                return Err(ToolError::InvalidArguments(format!(
                    "missing required argument '{key}'"
                )));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in object {
            let Some(expected) = properties
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str())
            else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(ToolError::InvalidArguments(format!(
                    "argument '{key}' must be a {expected}"
                )));
            }
        }
    }

    Ok(())
}
