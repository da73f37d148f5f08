//! Prometheus metrics registration and export.
//!
//! Metrics live in `OnceLock` statics so recording sites never need a handle.
//! Until [`init_metrics`] runs every recording call is a no-op.

use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all conductor metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Finished pipeline requests, labeled by outcome (approved, failed, stopped, error).
pub static PIPELINES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Agent runs, labeled by agent role and result status.
pub static AGENT_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Agent run duration in seconds, labeled by agent role.
pub static AGENT_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Circuit breaker state (0 closed, 1 half-open, 2 open), labeled by breaker name.
pub static BREAKER_STATE: OnceLock<GaugeVec> = OnceLock::new();

/// Sessions not yet in a terminal state.
pub static ACTIVE_SESSIONS: OnceLock<Gauge> = OnceLock::new();

/// Reactions applied, labeled by signal and action.
pub static REACTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. A second call registers nothing new and leaves the
/// first set of statics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let pipelines_total = CounterVec::new(
        Opts::new("conductor_pipelines_total", "Finished pipeline requests"),
        &["outcome"],
    )?;

    let agent_runs_total = CounterVec::new(
        Opts::new("conductor_agent_runs_total", "Agent runs by role and status"),
        &["agent", "status"],
    )?;

    let agent_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "conductor_agent_duration_seconds",
            "Agent run duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        &["agent"],
    )?;

    let breaker_state = GaugeVec::new(
        Opts::new(
            "conductor_circuit_breaker_state",
            "Circuit breaker state (0 closed, 1 half-open, 2 open)",
        ),
        &["breaker"],
    )?;

    let active_sessions = Gauge::new(
        "conductor_active_sessions",
        "Sessions not yet in a terminal state",
    )?;

    let reactions_total = CounterVec::new(
        Opts::new("conductor_reactions_total", "Reactions applied to session signals"),
        &["signal", "action"],
    )?;

    registry.register(Box::new(pipelines_total.clone()))?;
    registry.register(Box::new(agent_runs_total.clone()))?;
    registry.register(Box::new(agent_duration.clone()))?;
    registry.register(Box::new(breaker_state.clone()))?;
    registry.register(Box::new(active_sessions.clone()))?;
    registry.register(Box::new(reactions_total.clone()))?;

    // Losing a race with a concurrent init leaves the winner's metrics in place.
    let _ = REGISTRY.set(registry);
    let _ = PIPELINES_TOTAL.set(pipelines_total);
    let _ = AGENT_RUNS_TOTAL.set(agent_runs_total);
    let _ = AGENT_DURATION.set(agent_duration);
    let _ = BREAKER_STATE.set(breaker_state);
    let _ = ACTIVE_SESSIONS.set(active_sessions);
    let _ = REACTIONS_TOTAL.set(reactions_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
