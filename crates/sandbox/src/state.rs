//! Sandbox lifecycle state machine.
//!
//! Four states cover the whole lifecycle; legacy status strings from older
//! deployments map onto them so persisted rows survive upgrades.
//!
//! ```text
//!     STARTING ──success──▶ RUNNING ──error──▶ ERROR ──retry──▶ STARTING
//!        │                     │                 │
//!        └──fail──▶ ERROR      └──terminate──┐   └──give up──┐
//!                                            ▼               ▼
//!                                         TERMINATED (terminal)
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a project sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// Container is being created or connected.
    Starting,
    /// Container is running and healthy.
    Running,
    /// Creation failed, runtime error, or health check failure.
    Error,
    /// Terminal: the container is gone and the association is dead.
    Terminated,
}

/// Raised when a transition is not in the permitted table.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid state transition from {from} to {to}{}", .sandbox_id.as_deref().map(|id| format!(" for sandbox {id}")).unwrap_or_default())]
pub struct InvalidStateTransition {
    pub from: SandboxState,
    pub to: SandboxState,
    pub sandbox_id: Option<String>,
}

/// Permitted transitions. Same-state transitions are no-ops and always allowed.
const VALID_TRANSITIONS: &[(SandboxState, SandboxState)] = &[
    (SandboxState::Starting, SandboxState::Running),
    (SandboxState::Starting, SandboxState::Error),
    (SandboxState::Running, SandboxState::Error),
    (SandboxState::Running, SandboxState::Terminated),
    (SandboxState::Error, SandboxState::Starting),
    (SandboxState::Error, SandboxState::Terminated),
];

impl SandboxState {
    /// Whether the sandbox can execute tool calls right now.
    pub fn is_usable(self) -> bool {
        self == SandboxState::Running
    }

    /// Whether the sandbox is running or on its way up.
    pub fn is_active(self) -> bool {
        matches!(self, SandboxState::Starting | SandboxState::Running)
    }

    /// Whether the state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        self == SandboxState::Terminated
    }

    /// Whether the sandbox can be retried back into service.
    pub fn is_recoverable(self) -> bool {
        self == SandboxState::Error
    }

    /// Check whether `self → to` is a permitted transition.
    pub fn can_transition(self, to: SandboxState) -> bool {
        if self == to {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        VALID_TRANSITIONS.contains(&(self, to))
    }

    /// Validate a transition, returning the new state or the typed error.
    pub fn transition(
        self,
        to: SandboxState,
        sandbox_id: Option<&str>,
    ) -> Result<SandboxState, InvalidStateTransition> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(InvalidStateTransition {
                from: self,
                to,
                sandbox_id: sandbox_id.map(str::to_string),
            })
        }
    }

    /// All permitted target states from `self`.
    pub fn valid_targets(self) -> Vec<SandboxState> {
        VALID_TRANSITIONS
            .iter()
            .filter(|(from, _)| *from == self)
            .map(|(_, to)| *to)
            .collect()
    }

    /// Map a legacy status string from older deployments onto the four-state
    /// model. Unknown strings are rejected rather than guessed at.
    pub fn from_legacy(status: &str) -> Option<SandboxState> {
        match status {
            "pending" | "creating" | "connecting" | "starting" => Some(SandboxState::Starting),
            "running" => Some(SandboxState::Running),
            "unhealthy" | "error" | "disconnected" | "orphan" => Some(SandboxState::Error),
            "stopped" | "terminated" => Some(SandboxState::Terminated),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SandboxState::Starting => "starting",
            SandboxState::Running => "running",
            SandboxState::Error => "error",
            SandboxState::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
