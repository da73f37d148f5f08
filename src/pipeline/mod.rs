//! Pipeline orchestration for quality checks on a changeset.
//!
//! # Architecture
//!
//! - **Runner**: per-request orchestrator, one independent unit per request id
//! - **Registry**: FSM, cancellation token and tier of every live request,
//!   plus terminal records
//! - **Tier**: size classification and the default agent set per tier
//! - **Config**: thresholds, agent sets, breaker and model defaults
//!
//! # Pipeline Flow
//!
//! 1. **Accept**: register the request and publish `pipeline.accepted`
//! 2. **Classify**: compute diff statistics and a tier (or take the caller's)
//! 3. **Select**: caller's agent list, else the tier default
//! 4. **Run**: fan out to the quality pipeline behind the circuit breaker
//! 5. **Finalize**: exactly one of `completed`, `failed`, `stopped`, `error`
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use swe_conductor::collaborators::GitDiffProvider;
//! use swe_conductor::events::EventBus;
//! use swe_conductor::pipeline::{PipelineConfig, PipelineRequest, PipelineRunner};
//!
//! let config = PipelineConfig::from_env()?;
//! let runner = Arc::new(PipelineRunner::from_config(
//!     config,
//!     providers,
//!     Arc::new(GitDiffProvider),
//!     Arc::new(EventBus::in_memory()),
//! )?);
//!
//! let id = runner.submit(PipelineRequest::new("feature/login", "/work/app"))?;
//! // ...
//! runner.stop(&id);
//! ```

pub mod config;
pub mod registry;
pub mod request;
pub mod runner;
pub mod tier;

pub use config::{ConfigError, PipelineConfig};
pub use registry::{PipelineOutcome, PipelineRecord, PipelineRegistry, DEFAULT_HISTORY_LIMIT};
pub use request::{PipelineRequest, PipelineStatus, RunOverrides};
pub use runner::{PipelineError, PipelineRunner, PipelineStats};
pub use tier::{Tier, TierAgents, TierThresholds};
