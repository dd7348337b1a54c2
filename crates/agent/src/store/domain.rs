//! Persistent entities owned by the store.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::events::CheckpointKind;

/// Conversation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Archived,
    Deleted,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
            ConversationStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ConversationStatus::Active),
            "archived" => Some(ConversationStatus::Archived),
            "deleted" => Some(ConversationStatus::Deleted),
            _ => None,
        }
    }
}

/// A conversation owns all events persisted under its id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub tenant_id: String,
    pub project_id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub status: ConversationStatus,
    pub agent_config: serde_json::Value,
    pub message_count: u32,
    pub created_at: OffsetDateTime,
}

impl Conversation {
    pub fn new(tenant_id: &str, project_id: &str, user_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            title: None,
            status: ConversationStatus::Active,
            agent_config: serde_json::Value::Object(Default::default()),
            message_count: 0,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Serialized processor state at a resumable boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCheckpoint {
    pub id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub kind: CheckpointKind,
    pub state: serde_json::Value,
    pub created_at: OffsetDateTime,
}

impl ExecutionCheckpoint {
    pub fn new(
        conversation_id: &str,
        message_id: &str,
        kind: CheckpointKind,
        state: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            kind,
            state,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Append-only audit record for one tool call. Never read on the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at: OffsetDateTime,
}
