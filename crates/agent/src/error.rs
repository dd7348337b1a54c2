//! Structured error type for the session layer.
//!
//! Variants map onto the handling policies of the platform: transient errors
//! retry at their call sites, fatal-for-turn errors become exactly one
//! `error` event, tool-local failures never surface here at all (they stay
//! inside `observe` payloads).

use thiserror::Error;

use crate::llm::LlmError;
use crate::store::StoreError;
use berth_sandbox::SandboxError;

/// Machine-readable codes carried in `error` events.
pub mod codes {
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const MAX_STEPS: &str = "max_steps";
    pub const DOOM_LOOP: &str = "doom_loop";
    pub const CANCELLED: &str = "cancelled";
    pub const LLM_FAILED: &str = "llm_failed";
    pub const APPEND_FAILED: &str = "append_failed";
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("not authorized to access conversation {conversation_id}")]
    Unauthorized { conversation_id: String },

    #[error("session workflow error: {0}")]
    Workflow(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("hitl error: {0}")]
    Hitl(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for AgentError {
    fn from(e: anyhow::Error) -> Self {
        AgentError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Internal(format!("serialization error: {e}"))
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_human_readable() {
        assert_eq!(
            AgentError::ConversationNotFound("c-9".into()).to_string(),
            "conversation not found: c-9"
        );
        assert!(
            AgentError::Unauthorized {
                conversation_id: "c-9".into()
            }
            .to_string()
            .contains("c-9")
        );
    }

    #[test]
    fn store_errors_convert_transparently() {
        let err: AgentError = StoreError::Database("locked".into()).into();
        assert!(err.to_string().contains("locked"));
    }

    #[test]
    fn sandbox_errors_convert_transparently() {
        let err: AgentError = SandboxError::not_found("p1").into();
        assert!(err.to_string().contains("p1"));
    }
}
