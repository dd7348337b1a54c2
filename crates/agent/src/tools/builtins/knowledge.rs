//! Knowledge tools: long-term memory search and LLM summarisation.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};

use crate::llm::{ChatChunk, ChatMessage, ChatRequest, ToolDefinition};
use crate::tools::context::{Tool, ToolContext, ToolError};

const DEFAULT_MEMORY_LIMIT: usize = 5;
const MAX_MEMORY_LIMIT: usize = 20;

/// Search the knowledge graph for memories relevant to a query.
pub struct MemorySearchTool;

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "memory_search".into(),
            description: "Search long-term project memory for facts, prior decisions and \
                          context relevant to the query."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "What to look for"},
                    "limit": {
                        "type": "integer",
                        "description": "Maximum number of hits (default 5, max 20)"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let query = args["query"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("'query' must be a string".into()))?;
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_MEMORY_LIMIT)
            .min(MAX_MEMORY_LIMIT);

        let hits = ctx
            .graph
            .search(&ctx.tenant_id, &ctx.project_id, query, limit)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        Ok(json!({
            "query": query,
            "count": hits.len(),
            "memories": hits,
        }))
    }
}

/// Summarise text through the session's LLM.
pub struct SummaryTool;

impl SummaryTool {
    /// Shared with the processor's context compaction path.
    pub async fn summarise(ctx: &ToolContext, text: &str, focus: Option<&str>) -> Result<String, ToolError> {
        let instruction = match focus {
            Some(focus) => format!(
                "Summarise the following content concisely, focusing on {focus}. \
                 Preserve concrete facts, decisions, file paths and identifiers."
            ),
            None => "Summarise the following content concisely. Preserve concrete facts, \
                     decisions, file paths and identifiers."
                .to_string(),
        };

        let request = ChatRequest {
            messages: vec![
                ChatMessage::system(instruction),
                ChatMessage::user(text.to_string()),
            ],
            tools: Vec::new(),
            temperature: 0.2,
            max_tokens: 1024,
        };

        let mut stream = ctx
            .llm
            .chat_stream(request)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        let mut summary = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|e| ToolError::Execution(e.to_string()))? {
                ChatChunk::Delta(_) => {}
                ChatChunk::Done(response) => summary = response.content,
            }
        }
        if summary.is_empty() {
            return Err(ToolError::Execution("summariser returned no content".into()));
        }
        Ok(summary)
    }
}

#[async_trait]
impl Tool for SummaryTool {
    fn name(&self) -> &str {
        "summary"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "summary".into(),
            description: "Summarise a block of text, optionally focused on a topic.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string", "description": "Content to summarise"},
                    "focus": {"type": "string", "description": "Optional focus topic"}
                },
                "required": ["text"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let text = args["text"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("'text' must be a string".into()))?;
        let focus = args.get("focus").and_then(Value::as_str);

        let summary = Self::summarise(ctx, text, focus).await?;
        Ok(json!({"summary": summary}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::graph::{GraphError, GraphService, MemoryHit};
    use crate::store::SqliteStore;
    use crate::test_utils::{ScriptedLlm, test_tool_context};
    use std::sync::Arc;

    struct OneHitGraph;

    #[async_trait]
    impl GraphService for OneHitGraph {
        async fn search(
            &self,
            _tenant_id: &str,
            _project_id: &str,
            query: &str,
            _limit: usize,
        ) -> Result<Vec<MemoryHit>, GraphError> {
            Ok(vec![MemoryHit {
                id: "mem-1".into(),
                content: format!("remembered fact about {query}"),
                score: 0.92,
                source: Some("episode-7".into()),
            }])
        }
    }

    async fn ctx() -> ToolContext {
        let store = Arc::new(SqliteStore::connect(":memory:".into()).await.unwrap());
        let broker = Arc::new(MemoryBroker::new());
        let mut ctx = test_tool_context(store, broker).await;
        ctx.graph = Arc::new(OneHitGraph);
        ctx.llm = Arc::new(ScriptedLlm::replying(&["a crisp summary"]));
        ctx
    }

    #[tokio::test]
    async fn memory_search_renders_hits() {
        let ctx = ctx().await;
        let result = MemorySearchTool
            .call(json!({"query": "deploy pipeline"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result["count"], 1);
        assert!(
            result["memories"][0]["content"]
                .as_str()
                .unwrap()
                .contains("deploy pipeline")
        );
    }

    #[tokio::test]
    async fn memory_search_requires_a_query() {
        let ctx = ctx().await;
        assert!(MemorySearchTool.call(json!({}), &ctx).await.is_err());
    }

    #[tokio::test]
    async fn summary_returns_llm_content() {
        let ctx = ctx().await;
        let result = SummaryTool
            .call(json!({"text": "a very long document"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result["summary"], "a crisp summary");
    }
}
