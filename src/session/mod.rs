//! Issue-to-PR sessions.
//!
//! A session takes one issue (tracker number, inline title and body, or a
//! free-text prompt) through planning, implementation and a pull request, then
//! reacts to CI and review signals until it is merged, fails, is escalated to
//! a human, or is cancelled.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use swe_conductor::session::{SessionConfig, SessionManager, SignalKind, StartSessionRequest};
//!
//! let manager = Arc::new(
//!     SessionManager::new(SessionConfig::from_env()?, executor, roles, git, bus)?
//!         .with_tracker(tracker),
//! );
//! let view = manager.start(StartSessionRequest::new("/repos/app").for_issue(42)).await?;
//!
//! // Later, when CI reports:
//! manager.handle_signal(&view.session_id, SignalKind::CiFailed, Some(log)).await?;
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod reactions;
pub mod types;

pub use config::SessionConfig;
pub use error::{SessionError, SessionResult};
pub use manager::SessionManager;
pub use reactions::{
    render_template, PromptContext, Reaction, ReactionAction, ReactionEngine, ReactionRule,
    ReactionTable, SignalKind,
};
pub use types::{
    IssueRef, IssueSource, Plan, RetryCounter, Session, SessionStatus, SessionView,
    StartSessionRequest,
};
