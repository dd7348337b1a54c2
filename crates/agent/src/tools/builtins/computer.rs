//! Computer-use tools: desktop control through the `ComputerControl` port.
//!
//! Distinct from the sandbox tool process on purpose — desktop actions carry
//! their own permission gate and their own adapter.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::llm::ToolDefinition;
use crate::tools::context::{ComputerControl, Tool, ToolContext, ToolError};

fn control(ctx: &ToolContext) -> Result<Arc<dyn ComputerControl>, ToolError> {
    ctx.computer
        .clone()
        .ok_or_else(|| ToolError::Execution("no computer-control adapter configured".into()))
}

fn int_arg(args: &Value, key: &str) -> Result<i32, ToolError> {
    args.get(key)
        .and_then(Value::as_i64)
        .map(|v| v as i32)
        .ok_or_else(|| ToolError::InvalidArguments(format!("'{key}' must be an integer")))
}

pub struct ScreenshotTool;

#[async_trait]
impl Tool for ScreenshotTool {
    fn name(&self) -> &str {
        "screenshot"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "screenshot".into(),
            description: "Capture the sandbox desktop. Returns base64-encoded PNG data.".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(&self, _args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let image = control(ctx)?.screenshot(&ctx.project_id).await?;
        Ok(json!({"image_base64": image, "format": "png"}))
    }
}

pub struct ClickTool;

#[async_trait]
impl Tool for ClickTool {
    fn name(&self) -> &str {
        "click"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "click".into(),
            description: "Click at screen coordinates on the sandbox desktop.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "x": {"type": "integer"},
                    "y": {"type": "integer"}
                },
                "required": ["x", "y"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let x = int_arg(&args, "x")?;
        let y = int_arg(&args, "y")?;
        control(ctx)?.click(&ctx.project_id, x, y).await?;
        Ok(json!({"ok": true}))
    }
}

pub struct TypeTool;

#[async_trait]
impl Tool for TypeTool {
    fn name(&self) -> &str {
        "type"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "type".into(),
            description: "Type text into the focused element on the sandbox desktop.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string"}
                },
                "required": ["text"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let text = args["text"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("'text' must be a string".into()))?;
        control(ctx)?.type_text(&ctx.project_id, text).await?;
        Ok(json!({"ok": true}))
    }
}

pub struct ScrollTool;

#[async_trait]
impl Tool for ScrollTool {
    fn name(&self) -> &str {
        "scroll"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "scroll".into(),
            description: "Scroll the sandbox desktop by pixel deltas.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "dx": {"type": "integer"},
                    "dy": {"type": "integer"}
                },
                "required": ["dx", "dy"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let dx = int_arg(&args, "dx")?;
        let dy = int_arg(&args, "dy")?;
        control(ctx)?.scroll(&ctx.project_id, dx, dy).await?;
        Ok(json!({"ok": true}))
    }
}

pub struct BrowserNavigateTool;

#[async_trait]
impl Tool for BrowserNavigateTool {
    fn name(&self) -> &str {
        "browser_navigate"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "browser_navigate".into(),
            description: "Navigate the sandbox browser to a url.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"}
                },
                "required": ["url"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let url = args["url"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("'url' must be a string".into()))?;
        control(ctx)?.navigate(&ctx.project_id, url).await?;
        Ok(json!({"ok": true, "url": url}))
    }
}
