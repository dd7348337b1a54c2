//! Error types for sandbox lifecycle operations.

use thiserror::Error;

use crate::state::InvalidStateTransition;

/// Errors surfaced by the sandbox repository, adapter, and service layers.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// No sandbox association exists for the project.
    #[error("no sandbox found for project {project_id}")]
    NotFound { project_id: String },

    /// A concurrent writer created the association first (unique constraint
    /// or lost distributed lock). Callers retry and then fall back to the
    /// existing row.
    #[error("concurrent sandbox creation for project {project_id}")]
    CreationConflict { project_id: String },

    /// Creation gave up after exhausting retries.
    #[error("failed to create sandbox for project {project_id} after {attempts} attempts")]
    CreationFailed { project_id: String, attempts: u32 },

    /// The lifecycle state machine rejected a transition.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidStateTransition),

    /// Container runtime failure reported by the adapter.
    #[error("sandbox adapter error: {0}")]
    Adapter(String),

    /// Persistence failure.
    #[error("sandbox repository error: {0}")]
    Repository(String),

    /// Distributed lock failure (not a lost race — a transport/backend error).
    #[error("sandbox lock error: {0}")]
    Lock(String),
}

impl SandboxError {
    pub fn not_found(project_id: impl Into<String>) -> Self {
        SandboxError::NotFound {
            project_id: project_id.into(),
        }
    }

    pub fn conflict(project_id: impl Into<String>) -> Self {
        SandboxError::CreationConflict {
            project_id: project_id.into(),
        }
    }

    /// Whether the error is the retryable creation-collision case.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SandboxError::CreationConflict { .. })
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
