//! Prometheus-based monitoring for pipelines, agents, breakers and sessions.
//!
//! # Example
//!
//! ```ignore
//! use swe_conductor::metrics::{export_metrics, init_metrics, record_pipeline_outcome};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! record_pipeline_outcome("approved");
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{
    record_agent_run, record_breaker_state, record_pipeline_outcome, record_reaction,
    set_active_sessions,
};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_SESSIONS, AGENT_DURATION, AGENT_RUNS_TOTAL, BREAKER_STATE, PIPELINES_TOTAL,
    REACTIONS_TOTAL, REGISTRY,
};
