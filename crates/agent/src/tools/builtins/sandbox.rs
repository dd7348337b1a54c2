//! Sandbox-resident tools.
//!
//! These execute inside the project's container via
//! `SandboxService::execute_tool` — the only path from session code to a tool
//! process. The wrappers differ only in their declarations, so one struct
//! carries them all.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::llm::ToolDefinition;
use crate::tools::context::{Tool, ToolContext, ToolError};

/// A tool whose implementation lives inside the project sandbox.
pub struct SandboxResidentTool {
    definition: ToolDefinition,
}

impl SandboxResidentTool {
    pub fn bash() -> Self {
        Self {
            definition: ToolDefinition {
                name: "bash".into(),
                description: "Run a shell command in the project sandbox and return its \
                              stdout/stderr."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "command": {"type": "string", "description": "Command to run"},
                        "timeout": {
                            "type": "integer",
                            "description": "Seconds before the command is killed"
                        }
                    },
                    "required": ["command"]
                }),
            },
        }
    }

    pub fn read() -> Self {
        Self {
            definition: ToolDefinition {
                name: "read".into(),
                description: "Read a file from the project sandbox.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "file_path": {"type": "string", "description": "Absolute path"},
                        "offset": {"type": "integer", "description": "First line to read"},
                        "limit": {"type": "integer", "description": "Maximum lines"}
                    },
                    "required": ["file_path"]
                }),
            },
        }
    }

    pub fn write() -> Self {
        Self {
            definition: ToolDefinition {
                name: "write".into(),
                description: "Write a file in the project sandbox, replacing its content."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "file_path": {"type": "string", "description": "Absolute path"},
                        "content": {"type": "string", "description": "New file content"}
                    },
                    "required": ["file_path", "content"]
                }),
            },
        }
    }

    pub fn file_edit() -> Self {
        Self {
            definition: ToolDefinition {
                name: "file_edit".into(),
                description: "Replace an exact string in a sandbox file.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "file_path": {"type": "string"},
                        "old_string": {"type": "string", "description": "Text to replace"},
                        "new_string": {"type": "string", "description": "Replacement text"}
                    },
                    "required": ["file_path", "old_string", "new_string"]
                }),
            },
        }
    }

    pub fn file_glob() -> Self {
        Self {
            definition: ToolDefinition {
                name: "file_glob".into(),
                description: "Find files in the sandbox matching a glob pattern.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "pattern": {"type": "string", "description": "Glob pattern"},
                        "path": {"type": "string", "description": "Directory to search"}
                    },
                    "required": ["pattern"]
                }),
            },
        }
    }

    pub fn file_grep() -> Self {
        Self {
            definition: ToolDefinition {
                name: "file_grep".into(),
                description: "Search sandbox file contents with a regular expression.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "pattern": {"type": "string", "description": "Regex to search for"},
                        "path": {"type": "string", "description": "Directory to search"},
                        "glob": {"type": "string", "description": "Filter files by glob"}
                    },
                    "required": ["pattern"]
                }),
            },
        }
    }

    /// All six sandbox-resident wrappers.
    pub fn all() -> Vec<Self> {
        vec![
            Self::bash(),
            Self::read(),
            Self::write(),
            Self::file_edit(),
            Self::file_glob(),
            Self::file_grep(),
        ]
    }
}

#[async_trait]
impl Tool for SandboxResidentTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        // Lazy provisioning: the first sandbox-resident call of a project
        // creates its container. `execute_tool` itself never auto-creates.
        ctx.sandbox
            .get_or_create(&ctx.project_id, &ctx.tenant_id, None, None)
            .await?;
        let outcome = ctx
            .sandbox
            .execute_tool(&ctx.project_id, &self.definition.name, args, None)
            .await?;
        if outcome.is_error {
            let message = outcome
                .content
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| outcome.content.to_string());
            return Err(ToolError::Execution(message));
        }
        Ok(outcome.content)
    }
}
