//! Shared fixtures for unit tests: a scripted LLM, a fake sandbox runtime,
//! and a ready-made tool context.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::broker::MemoryBroker;
use crate::config::ToolsConfig;
use crate::event_sink::EventSink;
use crate::graph::NoopGraphService;
use crate::hitl::HitlRegistry;
use crate::llm::{
    ChatChunk, ChatRequest, ChatResponse, FinishReason, LlmClient, LlmError, ToolCallRequest,
    ToolDefinition, Usage,
};
use crate::store::SqliteStore;
use crate::tools::context::{Tool, ToolContext, ToolError};
use berth_sandbox::adapter::{
    SandboxAdapter, SandboxConfig, SandboxInstance, SandboxToolDescriptor, ToolOutcome,
};
use berth_sandbox::error::SandboxResult;
use berth_sandbox::repository::SqliteSandboxRepository;
use berth_sandbox::service::{SandboxService, SandboxServiceConfig};

/// One scripted model reply.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub deltas: Vec<String>,
    pub usage: Usage,
    /// Pause between the last delta and the final chunk, to let tests attach
    /// consumers while the turn is demonstrably in flight.
    pub completion_delay: Duration,
}

impl ScriptedReply {
    /// A plain text reply, streamed one character at a time.
    pub fn text(content: &str) -> Self {
        Self {
            content: content.to_string(),
            tool_calls: Vec::new(),
            deltas: content.chars().map(|c| c.to_string()).collect(),
            usage: Usage::default(),
            completion_delay: Duration::ZERO,
        }
    }

    /// A reply that requests tool calls (no streamed text).
    pub fn calls(content: &str, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            content: content.to_string(),
            tool_calls,
            deltas: Vec::new(),
            usage: Usage::default(),
            completion_delay: Duration::ZERO,
        }
    }

    pub fn with_usage(mut self, prompt: u64, completion: u64) -> Self {
        self.usage = Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
        };
        self
    }

    pub fn with_deltas(mut self, deltas: &[&str]) -> Self {
        self.deltas = deltas.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_completion_delay(mut self, delay: Duration) -> Self {
        self.completion_delay = delay;
        self
    }
}

/// An `LlmClient` that plays back a fixed script of replies.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<ScriptedReply>>,
    calls: AtomicU32,
    always_fail: bool,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicU32::new(0),
            always_fail: false,
        }
    }

    /// Convenience: a script of plain text replies.
    pub fn replying(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| ScriptedReply::text(t)).collect())
    }

    /// Every call fails with a transient network error.
    pub fn always_failing() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            always_fail: true,
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat_stream(
        &self,
        _request: ChatRequest,
    ) -> Result<BoxStream<'static, Result<ChatChunk, LlmError>>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.always_fail {
            return Err(LlmError::Network("scripted failure".into()));
        }
        let reply = self
            .replies
            .lock()
            .pop_front()
            .ok_or_else(|| LlmError::Provider("llm script exhausted".into()))?;

        let finish_reason = if reply.tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };
        let delta_chunks: Vec<Result<ChatChunk, LlmError>> = reply
            .deltas
            .iter()
            .map(|d| Ok(ChatChunk::Delta(d.clone())))
            .collect();
        let delay = reply.completion_delay;
        let done = ChatResponse {
            content: reply.content,
            tool_calls: reply.tool_calls,
            usage: reply.usage,
            finish_reason,
        };
        let stream = futures::stream::iter(delta_chunks).chain(futures::stream::once(
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(ChatChunk::Done(done))
            },
        ));
        Ok(Box::pin(stream))
    }
}

/// A tool that always returns the same value.
pub struct StaticTool {
    name: String,
    result: serde_json::Value,
}

impl StaticTool {
    pub fn new(name: &str, result: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            result,
        }
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: format!("Static test tool '{}'", self.name),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(
        &self,
        _args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        Ok(self.result.clone())
    }
}

/// In-memory sandbox runtime for tests; healthy, never fails.
#[derive(Default)]
pub struct FakeSandboxRuntime {
    containers: Mutex<HashMap<String, SandboxInstance>>,
    create_calls: AtomicU32,
    tool_calls: Mutex<Vec<(String, String, serde_json::Value)>>,
}

impl FakeSandboxRuntime {
    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn tool_calls(&self) -> Vec<(String, String, serde_json::Value)> {
        self.tool_calls.lock().clone()
    }
}

#[async_trait]
impl SandboxAdapter for FakeSandboxRuntime {
    async fn create(
        &self,
        _project_path: &str,
        _config: &SandboxConfig,
        project_id: &str,
        tenant_id: &str,
        sandbox_id: Option<&str>,
    ) -> SandboxResult<SandboxInstance> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let id = sandbox_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("sb-test-{n}"));
        let instance = SandboxInstance {
            id: id.clone(),
            container_ref: format!("ctr-{n}"),
            project_id: project_id.to_string(),
            tenant_id: tenant_id.to_string(),
            running: true,
            endpoint: None,
            created_at: time::OffsetDateTime::now_utc(),
        };
        self.containers.lock().insert(id, instance.clone());
        Ok(instance)
    }

    async fn terminate(&self, sandbox_id: &str) -> SandboxResult<()> {
        self.containers.lock().remove(sandbox_id);
        Ok(())
    }

    async fn get(&self, sandbox_id: &str) -> SandboxResult<Option<SandboxInstance>> {
        Ok(self.containers.lock().get(sandbox_id).cloned())
    }

    async fn container_exists(&self, sandbox_id: &str) -> SandboxResult<bool> {
        Ok(self.containers.lock().contains_key(sandbox_id))
    }

    async fn health_check(&self, _sandbox_id: &str) -> SandboxResult<bool> {
        Ok(true)
    }

    async fn call_tool(
        &self,
        sandbox_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        _timeout: Duration,
    ) -> SandboxResult<ToolOutcome> {
        self.tool_calls.lock().push((
            sandbox_id.to_string(),
            tool_name.to_string(),
            arguments.clone(),
        ));
        Ok(ToolOutcome::ok(json!({
            "tool": tool_name,
            "stdout": "ok",
            "args": arguments,
        })))
    }

    async fn list_tools(&self, _sandbox_id: &str) -> SandboxResult<Vec<SandboxToolDescriptor>> {
        Ok(vec![SandboxToolDescriptor {
            name: "bash".into(),
            description: "run a shell command".into(),
            parameters: json!({"type": "object"}),
        }])
    }

    async fn cleanup_project_containers(&self, project_id: &str) -> SandboxResult<u32> {
        let mut containers = self.containers.lock();
        let before = containers.len();
        containers.retain(|_, c| c.project_id != project_id);
        Ok((before - containers.len()) as u32)
    }

    async fn list_managed_containers(&self) -> SandboxResult<Vec<SandboxInstance>> {
        Ok(self.containers.lock().values().cloned().collect())
    }
}

/// A sandbox service over the fake runtime and an in-memory repository.
pub async fn test_sandbox_service(runtime: Arc<FakeSandboxRuntime>) -> Arc<SandboxService> {
    let repo = Arc::new(
        SqliteSandboxRepository::connect(":memory:".into())
            .await
            .unwrap(),
    );
    Arc::new(SandboxService::new(
        repo,
        runtime,
        None,
        SandboxServiceConfig::default(),
    ))
}

/// A fully wired tool context over the given store and broker.
pub async fn test_tool_context(store: Arc<SqliteStore>, broker: Arc<MemoryBroker>) -> ToolContext {
    let sink = Arc::new(EventSink::new(store.clone(), broker.clone()));
    let hitl = Arc::new(HitlRegistry::new(
        store.clone(),
        sink,
        broker,
        Duration::from_secs(300),
    ));
    let sandbox = test_sandbox_service(Arc::new(FakeSandboxRuntime::default())).await;

    ToolContext {
        conversation_id: "conv-test".into(),
        message_id: "msg-test".into(),
        project_id: "proj-test".into(),
        user_id: "user-test".into(),
        tenant_id: "tenant-test".into(),
        sandbox,
        hitl,
        graph: Arc::new(NoopGraphService),
        llm: Arc::new(ScriptedLlm::new(Vec::new())),
        computer: None,
        config: ToolsConfig::default(),
    }
}
