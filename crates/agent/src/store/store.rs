//! Store traits, one per concern.
//!
//! The relational backend stays behind these seams; SQLite is the shipped
//! implementation in [`sqlite`](super::sqlite).

use async_trait::async_trait;

use crate::events::{AgentEventKind, PersistedEvent};
use crate::hitl::types::PendingHitlRequest;
use crate::store::domain::{
    Conversation, ConversationStatus, ExecutionCheckpoint, ToolExecutionRecord,
};
use crate::store::error::StoreResult;

/// Input to an event append; the log assigns id, sequence, and timestamp.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub conversation_id: String,
    pub message_id: String,
    pub kind: AgentEventKind,
}

impl NewEvent {
    pub fn new(conversation_id: &str, message_id: &str, kind: AgentEventKind) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            kind,
        }
    }
}

/// The append-only per-conversation event log.
///
/// `append` is linearizable per conversation: sequence numbers are allocated
/// atomically with the insert, so they come out dense and strictly
/// increasing. Two appends to different conversations never contend on the
/// allocation itself.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: NewEvent) -> StoreResult<PersistedEvent>;

    /// Events of one conversation ordered by sequence number, optionally
    /// starting after `since_seq`.
    async fn events_for_conversation(
        &self,
        conversation_id: &str,
        since_seq: Option<u64>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<PersistedEvent>>;

    /// The contiguous event slice of one assistant turn.
    async fn events_for_message(&self, message_id: &str) -> StoreResult<Vec<PersistedEvent>>;

    /// Highest allocated sequence number, 0 for an empty conversation.
    async fn last_sequence(&self, conversation_id: &str) -> StoreResult<u64>;

    /// The most recent `user_message`/`assistant_message` events, oldest
    /// first, for building the conversation context window.
    async fn recent_message_events(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<PersistedEvent>>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(&self, conversation: &Conversation) -> StoreResult<()>;

    async fn find(&self, conversation_id: &str) -> StoreResult<Option<Conversation>>;

    async fn list_for_project(
        &self,
        project_id: &str,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Conversation>>;

    async fn update_title(&self, conversation_id: &str, title: &str) -> StoreResult<()>;

    async fn set_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> StoreResult<()>;

    async fn increment_message_count(&self, conversation_id: &str) -> StoreResult<()>;

    /// Delete a conversation and everything it owns, in order: tool
    /// executions, checkpoints, HITL rows, events, then the conversation row.
    async fn delete_cascade(&self, conversation_id: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &ExecutionCheckpoint) -> StoreResult<()>;

    /// Latest checkpoint written for a turn, if any.
    async fn latest_for_message(
        &self,
        message_id: &str,
    ) -> StoreResult<Option<ExecutionCheckpoint>>;

    async fn list_for_conversation(
        &self,
        conversation_id: &str,
    ) -> StoreResult<Vec<ExecutionCheckpoint>>;
}

#[async_trait]
pub trait ToolExecutionStore: Send + Sync {
    async fn record(&self, record: &ToolExecutionRecord) -> StoreResult<()>;

    async fn list_for_conversation(
        &self,
        conversation_id: &str,
    ) -> StoreResult<Vec<ToolExecutionRecord>>;
}

/// Durable pending HITL prompts so a reconnecting UI can enumerate and
/// answer them. Rows are deleted on resolution.
#[async_trait]
pub trait HitlRequestStore: Send + Sync {
    async fn insert(&self, request: &PendingHitlRequest) -> StoreResult<()>;

    async fn get(&self, request_id: &str) -> StoreResult<Option<PendingHitlRequest>>;

    async fn delete(&self, request_id: &str) -> StoreResult<()>;

    async fn list_open_for_conversation(
        &self,
        conversation_id: &str,
    ) -> StoreResult<Vec<PendingHitlRequest>>;
}
