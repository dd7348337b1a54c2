//! Chat orchestration: the per-request entry point into the platform.
//!
//! `stream_chat` authorises the caller, persists the user turn, routes the
//! message into the session workflow, and returns the combined replay/tail
//! event stream. Conversation CRUD and title generation live here too.

mod stream;

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::StreamBroker;
use crate::config::AgentSessionConfig;
use crate::error::{AgentError, AgentResult, codes};
use crate::event_sink::EventSink;
use crate::events::{AgentEventKind, SseEvent, now_rfc3339};
use crate::llm::{ChatChunk, ChatMessage, ChatRequest, LlmClient};
use crate::store::{Conversation, ConversationStatus, ConversationStore, EventLog};
use crate::workflow::{ChatTurn, SessionHost};

/// How many prior message events feed the model's context window.
const CONTEXT_WINDOW_MESSAGES: usize = 50;
/// Title length cap for the deterministic fallback.
const FALLBACK_TITLE_CHARS: usize = 50;

pub struct ChatService {
    conversations: Arc<dyn ConversationStore>,
    log: Arc<dyn EventLog>,
    sink: Arc<EventSink>,
    broker: Arc<dyn StreamBroker>,
    host: Arc<SessionHost>,
    llm: Arc<dyn LlmClient>,
    /// Template for new session workflows; tenant/project are replaced per
    /// conversation.
    base_config: AgentSessionConfig,
}

impl ChatService {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        log: Arc<dyn EventLog>,
        sink: Arc<EventSink>,
        broker: Arc<dyn StreamBroker>,
        host: Arc<SessionHost>,
        llm: Arc<dyn LlmClient>,
        base_config: AgentSessionConfig,
    ) -> Self {
        Self {
            conversations,
            log,
            sink,
            broker,
            host,
            llm,
            base_config,
        }
    }

    // ── Conversations ──────────────────────────────────────────────────────

    pub async fn create_conversation(
        &self,
        project_id: &str,
        user_id: &str,
        tenant_id: &str,
        title: Option<String>,
        agent_config: Option<serde_json::Value>,
    ) -> AgentResult<Conversation> {
        let mut conversation = Conversation::new(tenant_id, project_id, user_id);
        conversation.title = title;
        if let Some(agent_config) = agent_config {
            conversation.agent_config = agent_config;
        }
        self.conversations.create(&conversation).await?;
        info!(conversation_id = %conversation.id, project_id, "created conversation");
        Ok(conversation)
    }

    /// Load a conversation, enforcing the `(project, user)` ownership check.
    pub async fn get_conversation(
        &self,
        conversation_id: &str,
        project_id: &str,
        user_id: &str,
    ) -> AgentResult<Conversation> {
        let conversation = self
            .conversations
            .find(conversation_id)
            .await?
            .ok_or_else(|| AgentError::ConversationNotFound(conversation_id.to_string()))?;
        if conversation.project_id != project_id || conversation.user_id != user_id {
            warn!(conversation_id, project_id, user_id, "unauthorized conversation access");
            return Err(AgentError::Unauthorized {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(conversation)
    }

    pub async fn list_conversations(
        &self,
        project_id: &str,
        user_id: &str,
        limit: usize,
    ) -> AgentResult<Vec<Conversation>> {
        Ok(self
            .conversations
            .list_for_project(project_id, user_id, limit)
            .await?)
    }

    pub async fn archive_conversation(&self, conversation_id: &str) -> AgentResult<()> {
        self.conversations
            .set_status(conversation_id, ConversationStatus::Archived)
            .await?;
        Ok(())
    }

    /// Delete a conversation with everything it owns (ordered cascade).
    pub async fn delete_conversation(&self, conversation_id: &str) -> AgentResult<()> {
        self.conversations.delete_cascade(conversation_id).await?;
        info!(conversation_id, "deleted conversation");
        Ok(())
    }

    /// Events of one turn, for history views.
    pub async fn get_turn_events(&self, message_id: &str) -> AgentResult<Vec<SseEvent>> {
        let events = self.log.events_for_message(message_id).await?;
        Ok(events.iter().map(SseEvent::from_persisted).collect())
    }

    // ── Chat ───────────────────────────────────────────────────────────────

    /// Run one user message against the conversation's session workflow and
    /// stream back the turn's events.
    ///
    /// The first yielded element is the persisted `user_message` (it replays
    /// from the log); the stream ends with the turn's `complete` or `error`.
    /// Authorization failures yield a single synthetic `error` event and
    /// touch nothing.
    pub async fn stream_chat(
        &self,
        conversation_id: &str,
        user_message: &str,
        project_id: &str,
        user_id: &str,
        tenant_id: &str,
    ) -> ReceiverStream<SseEvent> {
        let (tx, rx) = mpsc::channel(64);

        let conversation = match self
            .get_conversation(conversation_id, project_id, user_id)
            .await
        {
            Ok(conversation) => conversation,
            Err(e) => {
                let code = match &e {
                    AgentError::Unauthorized { .. } => codes::UNAUTHORIZED,
                    _ => "not_found",
                };
                send_synthetic_error(&tx, &e.to_string(), code).await;
                return ReceiverStream::new(rx);
            }
        };

        // Persist the user turn; it becomes the stream's first element via
        // the replay below.
        let user_msg_id = Uuid::new_v4().to_string();
        let persisted = match self
            .sink
            .emit_durable(
                conversation_id,
                &user_msg_id,
                AgentEventKind::UserMessage {
                    role: "user".into(),
                    content: user_message.to_string(),
                },
            )
            .await
        {
            Ok(persisted) => persisted,
            Err(e) => {
                error!(conversation_id, error = %e, "failed to persist user message");
                send_synthetic_error(&tx, "failed to persist message", codes::APPEND_FAILED)
                    .await;
                return ReceiverStream::new(rx);
            }
        };
        if let Err(e) = self.conversations.increment_message_count(conversation_id).await {
            warn!(conversation_id, error = %e, "failed to bump message count");
        }

        // First contact names the conversation, best-effort in the background.
        if conversation.message_count == 0 && conversation.title.is_none() {
            self.spawn_title_generation(conversation_id, user_message);
        }

        // Context window: recent message events, excluding the just-written
        // user turn (the workflow reinjects it).
        let context = match self
            .log
            .recent_message_events(conversation_id, CONTEXT_WINDOW_MESSAGES)
            .await
        {
            Ok(events) => events
                .iter()
                .filter(|e| e.id != persisted.id)
                .filter_map(|e| match &e.kind {
                    AgentEventKind::UserMessage { content, .. } => {
                        Some(ChatMessage::user(content.clone()))
                    }
                    AgentEventKind::AssistantMessage { content, .. } => {
                        Some(ChatMessage::assistant(content.clone()))
                    }
                    _ => None,
                })
                .collect(),
            Err(e) => {
                warn!(conversation_id, error = %e, "failed to load context window");
                Vec::new()
            }
        };

        // Route into the session workflow without awaiting the result; the
        // stream below carries the outputs.
        let mut config = self.base_config.clone();
        config.tenant_id = tenant_id.to_string();
        config.project_id = conversation.project_id.clone();
        let handle = self.host.get_or_create(config).await;
        let turn = ChatTurn {
            conversation_id: conversation_id.to_string(),
            message_id: user_msg_id.clone(),
            user_message: user_message.to_string(),
            user_id: user_id.to_string(),
            context,
        };
        match handle.send_chat(turn).await {
            Ok(result_rx) => {
                let workflow_id = handle.workflow_id.clone();
                let conversation_id = conversation_id.to_string();
                tokio::spawn(async move {
                    match result_rx.await {
                        Ok(result) => info!(
                            workflow_id,
                            conversation_id,
                            is_error = result.is_error,
                            "session chat completed"
                        ),
                        Err(_) => warn!(workflow_id, conversation_id, "session chat dropped"),
                    }
                });
            }
            Err(e) => {
                error!(conversation_id, error = %e, "failed to send chat update");
                send_synthetic_error(&tx, &e, "workflow_unavailable").await;
                return ReceiverStream::new(rx);
            }
        }

        self.spawn_stream_driver(tx, conversation_id.to_string(), Some(user_msg_id));
        ReceiverStream::new(rx)
    }

    /// Attach to a conversation's event stream: durable replay first, then
    /// live tailing without gaps or duplicates (see `stream.rs`).
    pub fn connect_chat_stream(
        &self,
        conversation_id: &str,
        message_id: Option<String>,
    ) -> ReceiverStream<SseEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.spawn_stream_driver(tx, conversation_id.to_string(), message_id);
        ReceiverStream::new(rx)
    }

    fn spawn_stream_driver(
        &self,
        tx: mpsc::Sender<SseEvent>,
        conversation_id: String,
        message_id: Option<String>,
    ) {
        let log = self.log.clone();
        let broker = self.broker.clone();
        tokio::spawn(async move {
            stream::drive_chat_stream(log, broker, tx, conversation_id, message_id).await;
        });
    }

    // ── Titles ─────────────────────────────────────────────────────────────

    fn spawn_title_generation(&self, conversation_id: &str, first_message: &str) {
        let llm = self.llm.clone();
        let conversations = self.conversations.clone();
        let conversation_id = conversation_id.to_string();
        let first_message = first_message.to_string();
        tokio::spawn(async move {
            let title = generate_title(llm.as_ref(), &first_message).await;
            if let Err(e) = conversations.update_title(&conversation_id, &title).await {
                warn!(conversation_id, error = %e, "failed to store conversation title");
            }
        });
    }
}

async fn send_synthetic_error(tx: &mpsc::Sender<SseEvent>, message: &str, code: &str) {
    let event = SseEvent {
        event_type: "error".into(),
        data: serde_json::json!({"message": message, "code": code}),
        id: 0,
        timestamp: now_rfc3339(),
    };
    let _ = tx.send(event).await;
}

/// Title from the first message via the LLM, with a deterministic truncation
/// fallback when the model is unavailable.
pub(crate) async fn generate_title(llm: &dyn LlmClient, first_message: &str) -> String {
    let request = ChatRequest {
        messages: vec![
            ChatMessage::system(
                "Produce a short title (at most six words) for a conversation that starts \
                 with the user message below. Reply with the title only.",
            ),
            ChatMessage::user(first_message.to_string()),
        ],
        tools: Vec::new(),
        temperature: 0.3,
        max_tokens: 32,
    };

    let generated = async {
        let mut stream = llm.chat_stream(request).await.ok()?;
        let mut title = None;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(ChatChunk::Done(response)) => title = Some(response.content),
                Ok(ChatChunk::Delta(_)) => {}
                Err(_) => return None,
            }
        }
        title.map(|t| t.trim().trim_matches('"').to_string())
            .filter(|t| !t.is_empty())
    }
    .await;

    generated.unwrap_or_else(|| fallback_title(first_message))
}

pub(crate) fn fallback_title(first_message: &str) -> String {
    let trimmed = first_message.trim();
    if trimmed.chars().count() <= FALLBACK_TITLE_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(FALLBACK_TITLE_CHARS).collect();
        format!("{}…", cut.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedLlm;

    // ── Titles ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn title_comes_from_the_llm_when_available() {
        let llm = ScriptedLlm::replying(&["Fix the flaky deploy"]);
        let title = generate_title(&llm, "my deploy keeps failing, can you look?").await;
        assert_eq!(title, "Fix the flaky deploy");
    }

    #[tokio::test]
    async fn title_falls_back_to_truncation_on_llm_failure() {
        let llm = ScriptedLlm::always_failing();
        let title = generate_title(&llm, "short question").await;
        assert_eq!(title, "short question");
    }

    #[test]
    fn fallback_truncates_long_messages() {
        let long = "a".repeat(120);
        let title = fallback_title(&long);
        assert!(title.chars().count() <= FALLBACK_TITLE_CHARS + 1);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn fallback_keeps_short_messages_whole() {
        assert_eq!(fallback_title("  hello there  "), "hello there");
    }
}
