//! Tool executor: resolution, validation, permissions, and the
//! `act`/`observe` event pair around every call.
//!
//! Per-call guarantees: the `act` event strictly precedes its `observe`,
//! both share the model-assigned `call_id`, and an audit record lands in the
//! tool-execution store whatever the outcome.

use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PermissionMatrix;
use crate::event_sink::EventSink;
use crate::events::{AgentEventKind, ToolCallStatus};
use crate::llm::ToolCallRequest;
use crate::store::{StoreResult, ToolExecutionRecord, ToolExecutionStore};
use crate::tools::context::{Tool, ToolContext, ToolError, validate_args};
use crate::tools::registry::ToolRegistry;

/// Result of one tool call, shaped for the model's context window.
#[derive(Debug, Clone)]
pub struct ToolRunOutcome {
    pub content: String,
    pub is_error: bool,
}

/// Stable fingerprint of a `(tool, arguments)` pair, used by the doom-loop
/// detector. Arguments are canonicalised through serde_json so key order
/// does not matter.
pub fn call_fingerprint(tool_name: &str, arguments: &serde_json::Value) -> u64 {
    let canonical = serde_json::to_string(arguments).unwrap_or_default();
    rapidhash::v3::rapidhash_v3(format!("{tool_name}\u{0}{canonical}").as_bytes())
}

pub struct ToolExecutor {
    registry: ToolRegistry,
    permissions: PermissionMatrix,
    sink: Arc<EventSink>,
    audit: Arc<dyn ToolExecutionStore>,
    default_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(
        registry: ToolRegistry,
        permissions: PermissionMatrix,
        sink: Arc<EventSink>,
        audit: Arc<dyn ToolExecutionStore>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            permissions,
            sink,
            audit,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run one tool call end to end: `act` event, permission check, schema
    /// validation, timed execution, `observe` event, audit record.
    ///
    /// Tool-level failures come back as `is_error` outcomes; only event-log
    /// append failures propagate as `Err` (fatal for the turn).
    pub async fn run(
        &self,
        ctx: &ToolContext,
        call: &ToolCallRequest,
    ) -> StoreResult<ToolRunOutcome> {
        self.sink
            .emit_durable(
                &ctx.conversation_id,
                &ctx.message_id,
                AgentEventKind::Act {
                    tool_name: call.name.clone(),
                    tool_input: call.arguments.clone(),
                    call_id: call.id.clone(),
                    status: ToolCallStatus::Started,
                },
            )
            .await?;

        let started_at = OffsetDateTime::now_utc();
        let start = std::time::Instant::now();
        let result = self.execute(ctx, call).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let outcome = match &result {
            Ok(value) => {
                self.sink
                    .emit_durable(
                        &ctx.conversation_id,
                        &ctx.message_id,
                        AgentEventKind::Observe {
                            tool_name: call.name.clone(),
                            result: Some(value.clone()),
                            error: None,
                            duration_ms: Some(duration_ms),
                            call_id: call.id.clone(),
                            status: ToolCallStatus::Completed,
                        },
                    )
                    .await?;
                ToolRunOutcome {
                    content: render_for_model(value),
                    is_error: false,
                }
            }
            Err(e) => {
                debug!(tool = %call.name, error = %e, "tool call failed");
                self.sink
                    .emit_durable(
                        &ctx.conversation_id,
                        &ctx.message_id,
                        AgentEventKind::Observe {
                            tool_name: call.name.clone(),
                            result: None,
                            error: Some(e.to_string()),
                            duration_ms: Some(duration_ms),
                            call_id: call.id.clone(),
                            status: ToolCallStatus::Error,
                        },
                    )
                    .await?;
                ToolRunOutcome {
                    content: format!("Error: {e}"),
                    is_error: true,
                }
            }
        };

        let record = ToolExecutionRecord {
            id: Uuid::new_v4().to_string(),
            conversation_id: ctx.conversation_id.clone(),
            message_id: ctx.message_id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            result: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(|e| e.to_string()),
            duration_ms,
            started_at,
        };
        if let Err(e) = self.audit.record(&record).await {
            // Audit is off the hot path; losing a record is log-worthy only.
            warn!(tool = %call.name, error = %e, "failed to write tool execution record");
        }

        Ok(outcome)
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        call: &ToolCallRequest,
    ) -> Result<serde_json::Value, ToolError> {
        self.check_permission(&call.name)?;

        let tool = self
            .registry
            .find(&call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;

        validate_args(&tool.definition().parameters, &call.arguments)?;

        // HITL tools wait on a human with their own (much longer) deadline;
        // the registry enforces it, so the blanket tool timeout steps aside.
        let timeout = if is_hitl_tool(&call.name) {
            Duration::from_secs(ctx.config.hitl_timeout_seconds)
                .saturating_add(Duration::from_secs(30))
        } else {
            self.default_timeout
        };
        run_with_timeout(tool, call.arguments.clone(), ctx, timeout).await
    }

    fn check_permission(&self, tool_name: &str) -> Result<(), ToolError> {
        let allowed = match tool_name {
            "bash" => self.permissions.allow_command_execution,
            "write" | "file_edit" => self.permissions.allow_file_write,
            "web_search" | "web_scrape" => self.permissions.allow_web_access,
            "screenshot" => self.permissions.allow_screenshot,
            "click" | "type" | "scroll" | "browser_navigate" => {
                self.permissions.allow_computer_use
            }
            "request_env_var" => self.permissions.allow_env_var_requests,
            _ => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(ToolError::PermissionDenied(format!(
                "tool '{tool_name}' is disabled by the permission policy"
            )))
        }
    }
}

fn is_hitl_tool(name: &str) -> bool {
    matches!(
        name,
        "ask_clarification" | "request_decision" | "request_env_var"
    )
}

async fn run_with_timeout(
    tool: Arc<dyn Tool>,
    args: serde_json::Value,
    ctx: &ToolContext,
    timeout: Duration,
) -> Result<serde_json::Value, ToolError> {
    match tokio::time::timeout(timeout, tool.call(args, ctx)).await {
        Ok(result) => result,
        Err(_) => Err(ToolError::Timeout(timeout.as_secs())),
    }
}

/// Render a structured result as the string handed back to the model.
fn render_for_model(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
