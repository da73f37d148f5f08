//! Agent roles, tools, and the executor that runs one role to a result.

pub mod error;
pub mod executor;
pub mod roles;
pub mod tools;
pub mod types;

pub use error::{AgentError, AgentOpResult, ToolError};
pub use executor::{AgentExecutor, ExecutorConfig, StepCallback, StepEvent};
pub use roles::{builtin_roles, AgentRole, RoleRegistry};
pub use tools::{parse_tool_call, NoTools, ToolCall, ToolResult, ToolSurface, WorktreeTools};
pub use types::{
    AgentContext, AgentReport, AgentResult, AgentStatus, DiffStats, ExecutionMetadata, Finding,
    Severity,
};
