//! In-process host for session workflows.
//!
//! The host provides the durable-runtime contract the orchestrator relies
//! on: get-or-create by workflow id, updates with results, cancellation, and
//! replacement of instances that have terminated. A networked workflow
//! engine slots in behind the same surface.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AgentSessionConfig;
use crate::processor::TurnResult;
use crate::workflow::session::{ChatUpdate, SessionDeps, SessionWorkflow};
use crate::workflow::{ChatTurn, session_workflow_id};

const UPDATE_CHANNEL_CAPACITY: usize = 16;

/// Handle to one running workflow instance.
#[derive(Clone)]
pub struct SessionHandle {
    pub workflow_id: String,
    update_tx: mpsc::Sender<ChatUpdate>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Send a `chat` update; the returned receiver resolves with the turn
    /// result once the processor reaches a terminal event.
    pub async fn send_chat(&self, turn: ChatTurn) -> Result<oneshot::Receiver<TurnResult>, String> {
        let (tx, rx) = oneshot::channel();
        self.update_tx
            .send((turn, tx))
            .await
            .map_err(|_| format!("workflow {} is no longer running", self.workflow_id))?;
        Ok(rx)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.update_tx.is_closed()
    }
}

/// Registry of running session workflows keyed by workflow id.
pub struct SessionHost {
    deps: SessionDeps,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionHost {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            deps,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Get the running workflow for the config's key, starting a fresh
    /// instance when none exists or the previous one terminated (idle
    /// timeout, cancellation, crash).
    pub async fn get_or_create(&self, config: AgentSessionConfig) -> SessionHandle {
        let workflow_id = session_workflow_id(
            &config.tenant_id,
            &config.project_id,
            &config.agent_mode,
        );
        let mut sessions = self.sessions.lock().await;

        if let Some(handle) = sessions.get(&workflow_id) {
            if !handle.is_closed() {
                debug!(workflow_id, "reusing running session workflow");
                return handle.clone();
            }
            debug!(workflow_id, "previous instance terminated, replacing");
        }

        let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let workflow = SessionWorkflow::new(config, self.deps.clone());
        tokio::spawn(workflow.run(update_rx, cancel.clone()));

        let handle = SessionHandle {
            workflow_id: workflow_id.clone(),
            update_tx,
            cancel,
        };
        sessions.insert(workflow_id.clone(), handle.clone());
        info!(workflow_id, "started session workflow");
        handle
    }

    /// Cancel a workflow by id; a later `get_or_create` starts a fresh one.
    pub async fn cancel(&self, workflow_id: &str) -> bool {
        let sessions = self.sessions.lock().await;
        match sessions.get(workflow_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of live instances (closed handles are not counted).
    pub async fn running_count(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.values().filter(|h| !h.is_closed()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::PermissionMatrix;
    use crate::event_sink::EventSink;
    use crate::graph::NoopGraphService;
    use crate::hitl::HitlRegistry;
    use crate::store::SqliteStore;
    use crate::test_utils::{
        FakeSandboxRuntime, ScriptedLlm, ScriptedReply, test_sandbox_service,
    };
    use crate::tools::{ToolExecutor, ToolRegistry};
    use std::time::Duration;

    async fn deps_with(llm: Arc<ScriptedLlm>) -> SessionDeps {
        let store = Arc::new(SqliteStore::connect(":memory:".into()).await.unwrap());
        let broker = Arc::new(MemoryBroker::new());
        let sink = Arc::new(EventSink::new(store.clone(), broker.clone()));
        let executor = Arc::new(ToolExecutor::new(
            ToolRegistry::new(),
            PermissionMatrix::default(),
            sink.clone(),
            store.clone(),
            Duration::from_secs(30),
        ));
        let hitl = Arc::new(HitlRegistry::new(
            store.clone(),
            sink.clone(),
            broker,
            Duration::from_secs(300),
        ));
        SessionDeps {
            llm,
            sink,
            checkpoints: store.clone(),
            executor,
            sandbox: test_sandbox_service(Arc::new(FakeSandboxRuntime::default())).await,
            hitl,
            graph: Arc::new(NoopGraphService),
            computer: None,
        }
    }

    fn turn(n: u32) -> ChatTurn {
        ChatTurn {
            conversation_id: "c1".into(),
            message_id: format!("m{n}"),
            user_message: format!("message {n}"),
            user_id: "u1".into(),
            context: Vec::new(),
        }
    }

    // ── Update round trips ─────────────────────────────────────────────────

    #[tokio::test]
    async fn chat_update_returns_the_turn_result() {
        let llm = Arc::new(ScriptedLlm::replying(&["hello back"]));
        let host = SessionHost::new(deps_with(llm).await);
        let handle = host
            .get_or_create(AgentSessionConfig::new("t1", "p1"))
            .await;

        let rx = handle.send_chat(turn(1)).await.unwrap();
        let result = rx.await.unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content, "hello back");
    }

    #[tokio::test]
    async fn one_instance_serves_sequential_turns() {
        let llm = Arc::new(ScriptedLlm::replying(&["first", "second"]));
        let host = SessionHost::new(deps_with(llm).await);

        let config = AgentSessionConfig::new("t1", "p1");
        let handle_a = host.get_or_create(config.clone()).await;
        let result_a = handle_a.send_chat(turn(1)).await.unwrap().await.unwrap();
        assert_eq!(result_a.content, "first");

        let handle_b = host.get_or_create(config).await;
        assert_eq!(handle_a.workflow_id, handle_b.workflow_id);
        let result_b = handle_b.send_chat(turn(2)).await.unwrap().await.unwrap();
        assert_eq!(result_b.content, "second");

        assert_eq!(host.running_count().await, 1);
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_workflows() {
        let llm = Arc::new(ScriptedLlm::replying(&["a", "b"]));
        let host = SessionHost::new(deps_with(llm).await);

        let h1 = host.get_or_create(AgentSessionConfig::new("t1", "p1")).await;
        let h2 = host.get_or_create(AgentSessionConfig::new("t1", "p2")).await;
        assert_ne!(h1.workflow_id, h2.workflow_id);
        assert_eq!(host.running_count().await, 2);
    }

    // ── Idle timeout ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn idle_workflow_terminates_and_is_replaced_on_demand() {
        let llm = Arc::new(ScriptedLlm::replying(&["after idle"]));
        let host = SessionHost::new(deps_with(llm).await);

        let mut config = AgentSessionConfig::new("t1", "p1");
        config.idle_timeout_seconds = 0; // fires on the first empty poll
        let handle = host.get_or_create(config.clone()).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.is_closed(), "idle instance must terminate");
        assert_eq!(host.running_count().await, 0);

        // A new update transparently starts a replacement instance.
        config.idle_timeout_seconds = 60;
        let fresh = host.get_or_create(config).await;
        let result = fresh.send_chat(turn(1)).await.unwrap().await.unwrap();
        assert_eq!(result.content, "after idle");
    }

    // ── Cancellation ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancelled_workflow_stops_accepting_updates() {
        let llm = Arc::new(ScriptedLlm::replying(&["unused"]));
        let host = SessionHost::new(deps_with(llm).await);
        let handle = host
            .get_or_create(AgentSessionConfig::new("t1", "p1"))
            .await;

        assert!(host.cancel(&handle.workflow_id).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_closed());
        assert!(!host.cancel("agent_t9_p9_default").await);
    }
}
