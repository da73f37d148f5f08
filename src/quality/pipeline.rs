//! Concurrent fan-out of agent roles over one changeset.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::report::{aggregate, QualityReport};
use crate::agents::{
    AgentContext, AgentExecutor, AgentResult, AgentRole, AgentStatus, DiffStats,
    ExecutionMetadata, RoleRegistry, StepCallback,
};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError, Verdict};
use crate::events::{EventBus, EventForwarder, EventType, PipelineEvent};
use crate::pipeline::{PipelineRequest, Tier};

/// Runs a set of agent roles concurrently against a shared diff context.
///
/// Every agent gets its own executor clone, its own model/provider from the
/// resolution table, and its own step-event forwarder. Agents may edit the
/// same files at the same time; writes are not serialized.
pub struct QualityPipeline {
    executor: AgentExecutor,
    roles: Arc<RoleRegistry>,
    bus: Arc<EventBus>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl QualityPipeline {
    pub fn new(executor: AgentExecutor, roles: Arc<RoleRegistry>, bus: Arc<EventBus>) -> Self {
        Self {
            executor,
            roles,
            bus,
            breaker: None,
        }
    }

    /// Guards every agent run with `breaker`.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub fn roles(&self) -> &RoleRegistry {
        &self.roles
    }

    /// Runs every agent in `agent_names` and waits for all of them to settle.
    ///
    /// Unknown role names produce an `error` result for that agent; they do
    /// not abort the others.
    pub async fn run(
        &self,
        request_id: &str,
        request: &PipelineRequest,
        tier: Tier,
        agent_names: &[String],
        diff_stats: &DiffStats,
        cancel: &CancellationToken,
    ) -> QualityReport {
        let started = Instant::now();
        info!(
            request_id = %request_id,
            tier = %tier,
            agents = agent_names.len(),
            "Quality pipeline started"
        );

        let runs = agent_names
            .iter()
            .map(|name| self.run_agent(request_id, request, tier, name, diff_stats, cancel));
        let results = join_all(runs).await;

        let report = aggregate(results, started.elapsed().as_millis() as u64);
        info!(
            request_id = %request_id,
            overall_status = %report.overall_status,
            corrections = report.corrections_applied.len(),
            duration_ms = report.duration_ms,
            "Quality pipeline finished"
        );
        report
    }

    async fn run_agent(
        &self,
        request_id: &str,
        request: &PipelineRequest,
        tier: Tier,
        name: &str,
        diff_stats: &DiffStats,
        cancel: &CancellationToken,
    ) -> AgentResult {
        self.bus
            .emit(
                EventType::PipelineAgentStarted,
                request_id,
                json!({ "agent": name, "tier": tier }),
            )
            .await;

        let forwarder = EventForwarder::spawn(Arc::clone(&self.bus));
        let result = {
            let tx = forwarder.sender();
            let agent = name.to_string();
            let correlation_id = request_id.to_string();
            let callback: StepCallback = Arc::new(move |step| {
                let event = PipelineEvent::new(
                    EventType::PipelineAgentStep,
                    correlation_id.as_str(),
                    json!({ "agent": agent, "step": step }),
                );
                // The forwarder outlives every executor clone holding this sender.
                let _ = tx.send(event);
            });
            let executor = self.executor.clone().with_step_callback(callback);

            match self.roles.get(name) {
                Some(role) => {
                    let ctx = agent_context(request_id, request, role, tier, diff_stats);
                    self.guarded(&executor, role, &ctx, cancel).await
                }
                None => {
                    warn!(request_id = %request_id, agent = %name, "Unknown agent role");
                    AgentResult::error(
                        name,
                        format!("Unknown agent role: {}", name),
                        ExecutionMetadata::default(),
                    )
                }
            }
        };
        forwarder.finish().await;

        self.bus
            .emit(
                EventType::PipelineAgentCompleted,
                request_id,
                json!({
                    "agent": name,
                    "status": result.status,
                    "findings": result.findings.len(),
                    "fixes_applied": result.fixes_applied,
                    "duration_ms": result.metadata.duration_ms,
                    "error": result.error,
                }),
            )
            .await;

        result
    }

    async fn guarded(
        &self,
        executor: &AgentExecutor,
        role: &AgentRole,
        ctx: &AgentContext,
        cancel: &CancellationToken,
    ) -> AgentResult {
        let Some(breaker) = &self.breaker else {
            return executor.execute(role, ctx, cancel).await;
        };

        let outcome = breaker
            .execute_judged(
                move || executor.execute(role, ctx, cancel),
                |result: &AgentResult| {
                    // A cancelled run never reached a verdict on the downstream.
                    if cancel.is_cancelled() {
                        Verdict::Inconclusive
                    } else if result.status == AgentStatus::Error {
                        Verdict::Failure
                    } else {
                        Verdict::Success
                    }
                },
            )
            .await;

        match outcome {
            Ok(result) => result,
            Err(CircuitBreakerError::Inner(never)) => match never {},
            Err(CircuitBreakerError::Open { name, retry_after }) => {
                warn!(agent = %role.name, breaker = %name, "Agent run rejected by open circuit");
                AgentResult::error(
                    &role.name,
                    format!(
                        "circuit '{}' is open, retry in {}s",
                        name,
                        retry_after.as_secs()
                    ),
                    ExecutionMetadata::default(),
                )
            }
        }
    }
}

fn agent_context(
    request_id: &str,
    request: &PipelineRequest,
    role: &AgentRole,
    tier: Tier,
    diff_stats: &DiffStats,
) -> AgentContext {
    let focus = if role.description.is_empty() {
        role.name.as_str()
    } else {
        role.description.as_str()
    };
    let task = format!(
        "Review the changes on branch '{}' against '{}' in this worktree.\nYour focus: {}.",
        request.branch, request.base_branch, focus
    );
    AgentContext::new(request_id, &request.worktree_path, task)
        .with_branches(&request.branch, &request.base_branch)
        .with_diff_stats(diff_stats.clone())
        .with_tier(tier)
}
