//! Platform assembly: stores, broker, sink, sandbox stack, tools, session
//! host, and the chat service — everything a worker serves with.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use berth_agent::broker::MemoryBroker;
use berth_agent::event_sink::EventSink;
use berth_agent::graph::{GraphService, NoopGraphService};
use berth_agent::hitl::HitlRegistry;
use berth_agent::orchestrator::ChatService;
use berth_agent::store::SqliteStore;
use berth_agent::tools::builtins::web::{HttpPageFetcher, HttpSearchApi};
use berth_agent::tools::builtins::default_registry;
use berth_agent::tools::ToolExecutor;
use berth_agent::workflow::{SessionDeps, SessionHost};
use berth_sandbox::lock::LocalLockManager;
use berth_sandbox::reconciler::SandboxReconciler;
use berth_sandbox::repository::SqliteSandboxRepository;
use berth_sandbox::service::{SandboxService, SandboxServiceConfig};

use crate::config::WorkerConfig;
use crate::llm_client::OpenAiCompatClient;
use crate::local_sandbox::LocalProcessAdapter;

/// A fully wired worker.
pub struct Platform {
    pub chat: Arc<ChatService>,
    pub sandbox: Arc<SandboxService>,
    pub reconciler: SandboxReconciler,
    pub hitl: Arc<HitlRegistry>,
}

pub async fn build(config: &WorkerConfig) -> anyhow::Result<Platform> {
    let store = Arc::new(SqliteStore::connect(config.db_path.clone()).await?);
    let broker = Arc::new(MemoryBroker::new());
    let sink = Arc::new(EventSink::new(store.clone(), broker.clone()));

    let hitl = Arc::new(HitlRegistry::new(
        store.clone(),
        sink.clone(),
        broker.clone(),
        Duration::from_secs(config.tools.hitl_timeout_seconds),
    ));

    // Sandbox stack: local-process adapter, SQLite associations, in-process
    // distributed lock. Container-backed deployments replace the adapter.
    let adapter = Arc::new(LocalProcessAdapter::new(config.workspace_root.clone()));
    let sandbox_repo = Arc::new(SqliteSandboxRepository::connect(config.db_path.clone()).await?);
    let sandbox_config = SandboxServiceConfig {
        default_profile: config.sandbox_profile,
        project_root: config.workspace_root.to_string_lossy().to_string(),
        ..Default::default()
    };
    let sandbox = Arc::new(SandboxService::new(
        sandbox_repo.clone(),
        adapter.clone(),
        Some(Arc::new(LocalLockManager::new())),
        sandbox_config,
    ));
    let reconciler = SandboxReconciler::new(
        sandbox_repo,
        adapter,
        config.orphan_policy.into(),
        config.max_orphan_age_hours,
    );

    let llm = Arc::new(OpenAiCompatClient::new(config.llm.clone()));
    let graph: Arc<dyn GraphService> = Arc::new(NoopGraphService);

    let registry = default_registry(
        &config.tools,
        Arc::new(HttpSearchApi::new(
            config.search_endpoint.clone(),
            config.search_api_key.clone(),
        )),
        Arc::new(HttpPageFetcher::new()),
    );
    let executor = Arc::new(ToolExecutor::new(
        registry,
        config.tools.permissions.clone(),
        sink.clone(),
        store.clone(),
        Duration::from_secs(config.processor.tool_timeout_seconds),
    ));

    let deps = SessionDeps {
        llm: llm.clone(),
        sink: sink.clone(),
        checkpoints: store.clone(),
        executor,
        sandbox: sandbox.clone(),
        hitl: hitl.clone(),
        graph,
        computer: None,
    };
    let host = Arc::new(SessionHost::new(deps));

    let chat = Arc::new(ChatService::new(
        store.clone(),
        store,
        sink,
        broker,
        host,
        llm,
        config.session_template(),
    ));

    info!(db = %config.db_path.display(), "platform assembled");
    Ok(Platform {
        chat,
        sandbox,
        reconciler,
        hitl,
    })
}
