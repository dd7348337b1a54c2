//! The session workflow body.
//!
//! One instance serves all chat turns of its `(tenant, project, mode)` key:
//! it waits for a `chat` update or the idle timeout, drives the processor to
//! a terminal event, answers the update with the turn result, and resets the
//! idle timer. Cancellation ends the in-flight turn with an `error` event
//! and terminates the instance.
//!
//! The processor's state travels through checkpoints, so a replacement
//! instance picks an interrupted turn back up where the last one stopped.

use moka::future::Cache;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentSessionConfig;
use crate::event_sink::EventSink;
use crate::graph::GraphService;
use crate::hitl::HitlRegistry;
use crate::llm::LlmClient;
use crate::processor::{SessionProcessor, TurnRequest, TurnResult};
use crate::store::CheckpointStore;
use crate::tools::builtins::planning;
use crate::tools::{ComputerControl, ToolContext, ToolExecutor};
use crate::workflow::ChatTurn;
use berth_sandbox::SandboxService;
use berth_sandbox::adapter::SandboxToolDescriptor;

/// Shared collaborators a workflow needs to drive turns.
#[derive(Clone)]
pub struct SessionDeps {
    pub llm: Arc<dyn LlmClient>,
    pub sink: Arc<EventSink>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub executor: Arc<ToolExecutor>,
    pub sandbox: Arc<SandboxService>,
    pub hitl: Arc<HitlRegistry>,
    pub graph: Arc<dyn GraphService>,
    pub computer: Option<Arc<dyn ComputerControl>>,
}

/// An update waiting for its result.
pub type ChatUpdate = (ChatTurn, oneshot::Sender<TurnResult>);

/// This many failed turns in a row escalate from fatal-for-turn to
/// fatal-for-session: the instance terminates and a later update starts a
/// clean replacement.
const MAX_CONSECUTIVE_FAILED_TURNS: u32 = 3;

pub struct SessionWorkflow {
    config: AgentSessionConfig,
    deps: SessionDeps,
    processor: SessionProcessor,
    /// Sandbox tool descriptors cached per `sandbox_id`; survives container
    /// restarts because the logical id does.
    tool_cache: Cache<String, Arc<Vec<SandboxToolDescriptor>>>,
    /// Conversations this instance served, for state cleanup on exit.
    seen_conversations: HashSet<String>,
}

impl SessionWorkflow {
    pub fn new(config: AgentSessionConfig, deps: SessionDeps) -> Self {
        let processor = SessionProcessor::new(
            deps.llm.clone(),
            deps.executor.clone(),
            deps.sink.clone(),
            deps.checkpoints.clone(),
            config.processor.clone(),
            config.llm.clone(),
        );
        let tool_cache = Cache::builder()
            .max_capacity(64)
            .time_to_live(Duration::from_secs(config.tool_cache_ttl_seconds))
            .build();
        Self {
            config,
            deps,
            processor,
            tool_cache,
            seen_conversations: HashSet::new(),
        }
    }

    /// Main loop: updates in, results out, idle timeout or cancellation ends
    /// the instance.
    pub async fn run(
        mut self,
        mut updates: mpsc::Receiver<ChatUpdate>,
        cancel: CancellationToken,
    ) {
        let workflow_id = crate::workflow::session_workflow_id(
            &self.config.tenant_id,
            &self.config.project_id,
            &self.config.agent_mode,
        );
        info!(workflow_id, "session workflow started");
        let idle = Duration::from_secs(self.config.idle_timeout_seconds);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(workflow_id, "session workflow cancelled");
                    break;
                }
                update = tokio::time::timeout(idle, updates.recv()) => {
                    match update {
                        Ok(Some((turn, reply))) => {
                            let result = self.handle_chat(turn, &cancel).await;
                            if result.is_error {
                                consecutive_failures += 1;
                            } else {
                                consecutive_failures = 0;
                            }
                            // The caller may have walked away; the events are
                            // already durable either way.
                            let _ = reply.send(result);
                            if cancel.is_cancelled() {
                                break;
                            }
                            if consecutive_failures >= MAX_CONSECUTIVE_FAILED_TURNS {
                                warn!(
                                    workflow_id,
                                    consecutive_failures,
                                    "too many failed turns, terminating session"
                                );
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!(workflow_id, "update channel closed");
                            break;
                        }
                        Err(_) => {
                            info!(workflow_id, idle_seconds = idle.as_secs(), "idle timeout, terminating");
                            break;
                        }
                    }
                }
            }
        }

        self.cleanup();
        info!(workflow_id, "session workflow terminated");
    }

    async fn handle_chat(&mut self, turn: ChatTurn, cancel: &CancellationToken) -> TurnResult {
        self.seen_conversations.insert(turn.conversation_id.clone());

        // Refresh the sandbox tool descriptors through the TTL cache; the
        // listing only matters for logging here, the cache keeps turn starts
        // from hammering the container on every message.
        if let Ok(Some(status)) = self.deps.sandbox.get_status(&self.config.project_id).await {
            let sandbox_id = status.sandbox_id.clone();
            let sandbox = self.deps.sandbox.clone();
            let descriptors = self
                .tool_cache
                .try_get_with(sandbox_id.clone(), async move {
                    sandbox
                        .adapter()
                        .list_tools(&sandbox_id)
                        .await
                        .map(Arc::new)
                })
                .await;
            match descriptors {
                Ok(descriptors) => {
                    debug!(count = descriptors.len(), "sandbox tools available")
                }
                Err(e) => warn!(error = %e, "failed to list sandbox tools"),
            }
        }

        let ctx = ToolContext {
            conversation_id: turn.conversation_id.clone(),
            message_id: turn.message_id.clone(),
            project_id: self.config.project_id.clone(),
            user_id: turn.user_id.clone(),
            tenant_id: self.config.tenant_id.clone(),
            sandbox: self.deps.sandbox.clone(),
            hitl: self.deps.hitl.clone(),
            graph: self.deps.graph.clone(),
            llm: self.deps.llm.clone(),
            computer: self.deps.computer.clone(),
            config: self.config.tools.clone(),
        };

        let request = TurnRequest {
            conversation_id: turn.conversation_id,
            message_id: turn.message_id,
            user_message: turn.user_message,
            context: turn.context,
        };

        self.processor
            .run_turn(&ctx, request, cancel.child_token())
            .await
    }

    fn cleanup(&self) {
        for conversation_id in &self.seen_conversations {
            planning::clear_session_state(conversation_id);
        }
    }
}
