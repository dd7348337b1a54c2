//! Durable session workflows: one long-lived instance per
//! `(tenant, project, agent_mode)` that outlives individual client
//! connections and accepts `chat` updates.

pub mod host;
pub mod session;

pub use host::{SessionHandle, SessionHost};
pub use session::{SessionDeps, SessionWorkflow};

use crate::llm::ChatMessage;

/// Workflow identifier format shared with every other component.
pub fn session_workflow_id(tenant_id: &str, project_id: &str, agent_mode: &str) -> String {
    format!("agent_{tenant_id}_{project_id}_{agent_mode}")
}

/// One `chat` update sent into a running session workflow.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub conversation_id: String,
    pub message_id: String,
    pub user_message: String,
    pub user_id: String,
    /// Prior conversation history, oldest first, excluding this user turn.
    pub context: Vec<ChatMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_id_format_is_stable() {
        assert_eq!(
            session_workflow_id("acme", "proj-1", "default"),
            "agent_acme_proj-1_default"
        );
    }
}
