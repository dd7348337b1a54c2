//! The closed set of observable agent events and their wire shapes.
//!
//! Every event flows through the shared emit path in
//! [`event_sink`](crate::event_sink): durable kinds land in the event log and
//! on the stream broker, ephemeral kinds (token deltas) on the broker only.
//! Adding a kind here is a coordinated change — consumers hold the same set.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::hitl::types::{
    AnswerSource, ClarificationOption, DecisionOption, EnvVarField, HitlKind,
};

/// Granularity tag on `thought` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThoughtLevel {
    Work,
    Task,
    Step,
    Debug,
}

/// Lifecycle tag on `act`/`observe` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Started,
    Completed,
    Error,
}

/// Token counters reported with `cost_update`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

/// Checkpoint flavours; `complete`/`error` close a turn, `progress` marks a
/// resumable step boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Progress,
    Complete,
    Error,
}

/// One observable agent event. The serde tag doubles as the wire `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEventKind {
    UserMessage {
        role: String,
        content: String,
    },
    AssistantMessage {
        role: String,
        content: String,
    },
    Thought {
        content: String,
        thought_level: ThoughtLevel,
    },
    TextDelta {
        delta: String,
    },
    Act {
        tool_name: String,
        tool_input: serde_json::Value,
        call_id: String,
        status: ToolCallStatus,
    },
    Observe {
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        call_id: String,
        status: ToolCallStatus,
    },
    CostUpdate {
        cost: f64,
        tokens: TokenCounts,
    },
    ClarificationAsked {
        request_id: String,
        question: String,
        options: Vec<ClarificationOption>,
        allow_custom: bool,
    },
    ClarificationAnswered {
        request_id: String,
        answer: serde_json::Value,
        source: AnswerSource,
    },
    DecisionAsked {
        request_id: String,
        question: String,
        options: Vec<DecisionOption>,
        allow_custom: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        default_choice: Option<String>,
    },
    DecisionAnswered {
        request_id: String,
        answer: serde_json::Value,
        source: AnswerSource,
    },
    EnvVarRequested {
        request_id: String,
        prompt: String,
        variables: Vec<EnvVarField>,
    },
    EnvVarProvided {
        request_id: String,
        /// Names only; values never travel through the event pipeline.
        provided: Vec<String>,
        source: AnswerSource,
    },
    Complete {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Checkpoint {
        kind: CheckpointKind,
        step: u32,
    },
}

/// Storage/transport classification of a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Appended to the event log, then published to the broker.
    Durable,
    /// Published to the broker only — never persisted.
    Ephemeral,
}

/// Token deltas are the only stream-only kind; everything else replays from
/// the durable log.
pub fn classify_durability(kind: &AgentEventKind) -> Durability {
    match kind {
        AgentEventKind::TextDelta { .. } => Durability::Ephemeral,
        _ => Durability::Durable,
    }
}

impl AgentEventKind {
    /// The wire `type` string for this kind.
    pub fn event_type(&self) -> &'static str {
        match self {
            AgentEventKind::UserMessage { .. } => "user_message",
            AgentEventKind::AssistantMessage { .. } => "assistant_message",
            AgentEventKind::Thought { .. } => "thought",
            AgentEventKind::TextDelta { .. } => "text_delta",
            AgentEventKind::Act { .. } => "act",
            AgentEventKind::Observe { .. } => "observe",
            AgentEventKind::CostUpdate { .. } => "cost_update",
            AgentEventKind::ClarificationAsked { .. } => "clarification_asked",
            AgentEventKind::ClarificationAnswered { .. } => "clarification_answered",
            AgentEventKind::DecisionAsked { .. } => "decision_asked",
            AgentEventKind::DecisionAnswered { .. } => "decision_answered",
            AgentEventKind::EnvVarRequested { .. } => "env_var_requested",
            AgentEventKind::EnvVarProvided { .. } => "env_var_provided",
            AgentEventKind::Complete { .. } => "complete",
            AgentEventKind::Error { .. } => "error",
            AgentEventKind::Checkpoint { .. } => "checkpoint",
        }
    }

    /// Event payload for the wire: the tagged serialization minus the tag,
    /// with the owning `message_id` injected.
    pub fn event_data(&self, message_id: &str) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(map) = &mut value {
            map.remove("type");
            map.insert(
                "message_id".to_string(),
                serde_json::Value::String(message_id.to_string()),
            );
        }
        value
    }

    /// Build a kind back from `(event_type, event_data)` as stored in the log.
    pub fn from_stored(
        event_type: &str,
        event_data: &serde_json::Value,
    ) -> Result<AgentEventKind, serde_json::Error> {
        let mut value = event_data.clone();
        if let serde_json::Value::Object(map) = &mut value {
            map.remove("message_id");
            map.insert(
                "type".to_string(),
                serde_json::Value::String(event_type.to_string()),
            );
        }
        serde_json::from_value(value)
    }

    /// The HITL `{kind}_asked` event type for a request kind.
    pub fn asked_type_for(kind: HitlKind) -> &'static str {
        match kind {
            HitlKind::Clarification => "clarification_asked",
            HitlKind::Decision => "decision_asked",
            HitlKind::EnvVar => "env_var_requested",
        }
    }
}

/// Whether a wire type string closes its turn.
pub fn is_terminal_type(event_type: &str) -> bool {
    matches!(event_type, "complete" | "error")
}

/// A durable event as persisted in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEvent {
    pub id: String,
    pub conversation_id: String,
    pub message_id: String,
    /// Dense, strictly increasing per conversation, starting at 1.
    pub sequence_number: u64,
    pub kind: AgentEventKind,
    pub created_at: OffsetDateTime,
}

/// One entry on the stream broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    /// Tentative sequence number; authoritative for durable events, borrowed
    /// from the conversation cursor for ephemeral ones.
    pub seq: u64,
    pub timestamp: String,
}

impl StreamPayload {
    pub fn new(kind: &AgentEventKind, message_id: &str, seq: u64) -> Self {
        Self {
            event_type: kind.event_type().to_string(),
            data: kind.event_data(message_id),
            seq,
            timestamp: now_rfc3339(),
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.data.get("message_id").and_then(|v| v.as_str())
    }

    pub fn is_terminal(&self) -> bool {
        is_terminal_type(&self.event_type)
    }
}

/// The event shape yielded to HTTP callers (before any SSE framing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub id: u64,
    pub timestamp: String,
}

impl SseEvent {
    pub fn from_persisted(event: &PersistedEvent) -> Self {
        Self {
            event_type: event.kind.event_type().to_string(),
            data: event.kind.event_data(&event.message_id),
            id: event.sequence_number,
            timestamp: event
                .created_at
                .format(&Rfc3339)
                .unwrap_or_else(|_| now_rfc3339()),
        }
    }

    pub fn from_payload(payload: &StreamPayload) -> Self {
        Self {
            event_type: payload.event_type.clone(),
            data: payload.data.clone(),
            id: payload.seq,
            timestamp: payload.timestamp.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        is_terminal_type(&self.event_type)
    }
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
