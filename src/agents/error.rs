//! Error types for agent roles, tools and execution.

use thiserror::Error;

/// Errors raised while configuring or running an agent.
///
/// None of these escape [`AgentExecutor::execute`](super::AgentExecutor::execute);
/// they are folded into an `error` [`AgentResult`](super::AgentResult).
#[derive(Debug, Error)]
pub enum AgentError {
    /// No role registered under the requested name.
    #[error("Unknown agent role: {0}")]
    UnknownRole(String),

    /// Role catalogue could not be loaded.
    #[error("Invalid role configuration: {0}")]
    RoleConfig(String),

    /// Error from the LLM provider.
    #[error("LLM error: {0}")]
    Llm(#[from] crate::error::LlmError),

    /// Tool execution broke outside the agent's control.
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// The run was cancelled cooperatively.
    #[error("Agent run cancelled")]
    Cancelled,

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a single tool call. Reported back to the model, never fatal.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Tool exists but the role may not use it, or it does not exist at all.
    #[error("Tool not available: {0}")]
    NotAvailable(String),

    /// Path resolves outside the worktree.
    #[error("Path escapes the worktree: {0}")]
    PathEscape(String),

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),
}

/// Result type alias for agent operations.
pub type AgentOpResult<T> = Result<T, AgentError>;
