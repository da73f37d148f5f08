//! Session error types.

use thiserror::Error;

use super::types::SessionStatus;
use crate::error::CollaboratorError;
use crate::pipeline::ConfigError;

/// Errors returned by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Another active, non-stale session already works on the issue.
    #[error("Issue #{issue} already has active session {existing_id}")]
    Conflict { issue: u64, existing_id: String },

    /// The parallel-session cap is reached.
    #[error("Session capacity reached ({limit} active)")]
    Capacity { limit: usize },

    #[error("Session not found: {0}")]
    NotFound(String),

    /// The operation is not allowed from the session's current state.
    #[error("Cannot {operation} session {session_id} in state '{status}'")]
    InvalidState {
        session_id: String,
        status: SessionStatus,
        operation: String,
    },

    #[error("Invalid session request: {0}")]
    InvalidRequest(String),

    #[error("Reaction configuration error: {0}")]
    ReactionConfig(String),

    #[error("Template rendering failed: {0}")]
    Template(String),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub(crate) fn invalid_state(
        session_id: &str,
        status: SessionStatus,
        operation: impl Into<String>,
    ) -> Self {
        SessionError::InvalidState {
            session_id: session_id.to_string(),
            status,
            operation: operation.into(),
        }
    }

    /// Whether a caller should see this as a conflict with current state.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SessionError::Conflict { .. } | SessionError::InvalidState { .. }
        )
    }
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
