//! Shapes of human-in-the-loop requests and answers.
//!
//! Three request kinds exist; each carries its own option shape. The structs
//! here are shared between the registry, the event payloads, and the HITL
//! tools, so they stay dependency-free.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// The kind of human input being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlKind {
    Clarification,
    Decision,
    EnvVar,
}

impl HitlKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HitlKind::Clarification => "clarification",
            HitlKind::Decision => "decision",
            HitlKind::EnvVar => "env_var",
        }
    }
}

/// An option the user can pick when answering a clarification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClarificationOption {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub recommended: bool,
}

/// A decision option carries effort and risk estimates so the user can weigh
/// alternatives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DecisionOption {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub recommended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risks: Vec<String>,
}

/// Input widget type for an environment variable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnvVarInputType {
    #[default]
    Text,
    Password,
    Url,
}

/// One environment variable the agent needs from the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EnvVarField {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_type: EnvVarInputType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_pattern: Option<String>,
}

/// Options payload, one variant per request kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HitlOptions {
    Clarification(Vec<ClarificationOption>),
    Decision(Vec<DecisionOption>),
    EnvVar(Vec<EnvVarField>),
}

/// Where the answer to a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerSource {
    User,
    Timeout,
    Cancelled,
}

/// A resolved answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlAnswer {
    pub answer: serde_json::Value,
    pub source: AnswerSource,
}

impl HitlAnswer {
    pub fn user(answer: serde_json::Value) -> Self {
        Self {
            answer,
            source: AnswerSource::User,
        }
    }

    pub fn timeout_default(answer: serde_json::Value) -> Self {
        Self {
            answer,
            source: AnswerSource::Timeout,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            answer: serde_json::Value::Null,
            source: AnswerSource::Cancelled,
        }
    }
}

/// A pending request as persisted for reconnecting UIs. Deleted on
/// resolution; a row's existence means the prompt is still open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingHitlRequest {
    pub request_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub kind: HitlKind,
    pub prompt: String,
    pub options: HitlOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_choice: Option<String>,
    #[serde(default)]
    pub allow_custom: bool,
    pub timeout_deadline: OffsetDateTime,
}
