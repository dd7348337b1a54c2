//! Planning tools: the session-scoped todo list and plan mode.
//!
//! State is keyed by conversation id in process-wide maps; it survives across
//! turns of one session on a worker but is deliberately not durable.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;

use crate::llm::ToolDefinition;
use crate::tools::context::{Tool, ToolContext, ToolError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TodoItem {
    id: String,
    content: String,
    /// "pending", "in_progress", "completed", "cancelled"
    status: String,
    /// "high", "medium", "low"
    priority: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PlanState {
    active: bool,
    content: String,
}

type TodoStorage = Lazy<Mutex<HashMap<String, Vec<TodoItem>>>>;
type PlanStorage = Lazy<Mutex<HashMap<String, PlanState>>>;

/// Todo lists keyed by conversation id.
static TODOS: TodoStorage = Lazy::new(|| Mutex::new(HashMap::new()));
/// Plan-mode state keyed by conversation id.
static PLANS: PlanStorage = Lazy::new(|| Mutex::new(HashMap::new()));

/// Drop all planning state of a conversation (session cleanup).
pub fn clear_session_state(conversation_id: &str) {
    TODOS.lock().remove(conversation_id);
    PLANS.lock().remove(conversation_id);
}

pub struct TodoReadTool;

#[async_trait]
impl Tool for TodoReadTool {
    fn name(&self) -> &str {
        "todo_read"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "todo_read".into(),
            description: "Read the current todo list for this session.".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(&self, _args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let todos = TODOS.lock();
        let items = todos.get(&ctx.conversation_id).cloned().unwrap_or_default();
        Ok(json!({"todos": items}))
    }
}

pub struct TodoWriteTool;

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "todo_write".into(),
            description: "Replace the session todo list. Use it to track multi-step work: \
                          one item in_progress at a time, completed items marked promptly."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "todos": {
                        "type": "array",
                        "description": "The updated todo list",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "content": {"type": "string"},
                                "status": {
                                    "type": "string",
                                    "enum": ["pending", "in_progress", "completed", "cancelled"]
                                },
                                "priority": {
                                    "type": "string",
                                    "enum": ["high", "medium", "low"]
                                }
                            },
                            "required": ["id", "content", "status", "priority"]
                        }
                    }
                },
                "required": ["todos"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let items: Vec<TodoItem> = serde_json::from_value(args["todos"].clone())
            .map_err(|e| ToolError::InvalidArguments(format!("bad 'todos': {e}")))?;
        let count = items.len();
        TODOS.lock().insert(ctx.conversation_id.clone(), items);
        Ok(json!({"ok": true, "count": count}))
    }
}

pub struct PlanEnterTool;

#[async_trait]
impl Tool for PlanEnterTool {
    fn name(&self) -> &str {
        "plan_enter"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "plan_enter".into(),
            description: "Enter plan mode: record an initial plan before touching anything."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "plan": {"type": "string", "description": "The initial plan"}
                },
                "required": ["plan"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let plan = args["plan"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("'plan' must be a string".into()))?;
        let mut plans = PLANS.lock();
        let state = plans.entry(ctx.conversation_id.clone()).or_default();
        if state.active {
            return Err(ToolError::Execution("already in plan mode".into()));
        }
        state.active = true;
        state.content = plan.to_string();
        Ok(json!({"ok": true}))
    }
}

pub struct PlanUpdateTool;

#[async_trait]
impl Tool for PlanUpdateTool {
    fn name(&self) -> &str {
        "plan_update"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "plan_update".into(),
            description: "Revise the plan while in plan mode.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "plan": {"type": "string", "description": "The revised plan"}
                },
                "required": ["plan"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let plan = args["plan"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("'plan' must be a string".into()))?;
        let mut plans = PLANS.lock();
        match plans.get_mut(&ctx.conversation_id) {
            Some(state) if state.active => {
                state.content = plan.to_string();
                Ok(json!({"ok": true}))
            }
            _ => Err(ToolError::Execution("not in plan mode".into())),
        }
    }
}

pub struct PlanExitTool;

#[async_trait]
impl Tool for PlanExitTool {
    fn name(&self) -> &str {
        "plan_exit"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "plan_exit".into(),
            description: "Leave plan mode and return the final plan.".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(&self, _args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let mut plans = PLANS.lock();
        match plans.get_mut(&ctx.conversation_id) {
            Some(state) if state.active => {
                state.active = false;
                Ok(json!({"ok": true, "plan": state.content}))
            }
            _ => Err(ToolError::Execution("not in plan mode".into())),
        }
    }
}
