//! Recording helpers over the Prometheus statics.
//!
//! Each helper checks its static and silently skips recording when metrics
//! were never initialized, so library code can call them unconditionally.

use super::prometheus::{
    ACTIVE_SESSIONS, AGENT_DURATION, AGENT_RUNS_TOTAL, BREAKER_STATE, PIPELINES_TOTAL,
    REACTIONS_TOTAL,
};
use crate::circuit_breaker::CircuitState;

/// Records a finished pipeline request.
pub fn record_pipeline_outcome(outcome: &str) {
    if let Some(total) = PIPELINES_TOTAL.get() {
        total.with_label_values(&[outcome]).inc();
    }
    tracing::trace!(outcome = outcome, "Recorded pipeline metric");
}

/// Records one agent run.
pub fn record_agent_run(agent: &str, status: &str, duration_secs: f64) {
    if let Some(total) = AGENT_RUNS_TOTAL.get() {
        total.with_label_values(&[agent, status]).inc();
    }
    if let Some(duration) = AGENT_DURATION.get() {
        duration.with_label_values(&[agent]).observe(duration_secs);
    }
}

/// Publishes the current state of a circuit breaker.
pub fn record_breaker_state(breaker: &str, state: CircuitState) {
    if let Some(gauge) = BREAKER_STATE.get() {
        gauge.with_label_values(&[breaker]).set(state.as_gauge());
    }
}

/// Sets the number of non-terminal sessions.
pub fn set_active_sessions(count: usize) {
    if let Some(gauge) = ACTIVE_SESSIONS.get() {
        gauge.set(count as f64);
    }
}

/// Records a reaction applied to a session signal.
pub fn record_reaction(signal: &str, action: &str) {
    if let Some(total) = REACTIONS_TOTAL.get() {
        total.with_label_values(&[signal, action]).inc();
    }
}
