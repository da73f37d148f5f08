//! Error types shared across swe-conductor subsystems.
//!
//! Module-specific errors (transitions, pipeline runs, sessions, agents) live
//! next to the code that raises them. This module holds the errors produced at
//! the boundaries:
//! - Model execution (LLM API interactions)
//! - Durable event log storage
//! - External collaborators (git, diff inspection, issue tracker)

use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: LITELLM_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Context length exceeded: {limit} tokens")]
    ContextLengthExceeded { limit: u32 },

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by durable event storage.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("Invalid correlation id '{0}'")]
    InvalidCorrelationId(String),

    #[error("Failed to create log directory {path}: {source}")]
    DirectoryCreationFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures reported by external collaborators.
///
/// Collaborators return these instead of panicking so that the owning
/// pipeline or session can move to a terminal state with the original message.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Git operation '{operation}' failed: {message}")]
    Git { operation: String, message: String },

    #[error("Diff inspection failed: {0}")]
    Diff(String),

    #[error("Issue tracker error: {0}")]
    Tracker(String),

    #[error("Issue #{0} not found")]
    IssueNotFound(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CollaboratorError {
    /// Builds a git failure for `operation`.
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CollaboratorError::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaborator_error_display() {
        let err = CollaboratorError::git("push", "rejected: non-fast-forward");
        assert_eq!(
            err.to_string(),
            "Git operation 'push' failed: rejected: non-fast-forward"
        );
        assert_eq!(
            CollaboratorError::IssueNotFound(7).to_string(),
            "Issue #7 not found"
        );
    }

    #[test]
    fn test_llm_error_display() {
        let err = LlmError::ApiError {
            code: 503,
            message: "overloaded".to_string(),
        };
        assert!(err.to_string().contains("503"));
        assert!(LlmError::UnknownProvider("acme".to_string())
            .to_string()
            .contains("acme"));
    }
}
