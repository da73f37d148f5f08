//! swe-conductor: orchestration engine for autonomous software-change agents.
//!
//! Two entry points share one event bus:
//! - [`pipeline::PipelineRunner`] classifies a changeset by size and runs a
//!   tier-dependent set of review agents over it in parallel, producing one
//!   aggregated quality report per request.
//! - [`session::SessionManager`] takes an issue to a pull request through
//!   planning and implementation agents, then reacts to CI and review
//!   signals with retries, notifications, merges or escalation.

// Core modules
pub mod agents;
pub mod circuit_breaker;
pub mod cli;
pub mod collaborators;
pub mod error;
pub mod events;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod quality;
pub mod session;
pub mod state_machine;
pub mod utils;

// Re-export commonly used error types
pub use error::{CollaboratorError, EventLogError, LlmError};
pub use pipeline::{ConfigError, PipelineError};
pub use session::SessionError;
