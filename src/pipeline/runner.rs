//! Per-request pipeline runner.
//!
//! Drives one [`PipelineRequest`] through classify → select agents → quality
//! run → terminal event, keeping every step visible on the event bus.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::config::{ConfigError, PipelineConfig};
use super::registry::{PipelineOutcome, PipelineRecord, PipelineRegistry, Termination};
use super::request::{PipelineRequest, PipelineStatus};
use super::tier::Tier;
use crate::agents::{AgentError, AgentExecutor, DiffStats, RoleRegistry};
use crate::circuit_breaker::CircuitBreaker;
use crate::collaborators::DiffProvider;
use crate::error::CollaboratorError;
use crate::events::{EventBus, EventType};
use crate::llm::{ModelResolution, ProviderRegistry};
use crate::metrics;
use crate::quality::{QualityPipeline, QualityReport};

/// Errors that can occur during pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A pipeline with this request id is still running.
    #[error("Pipeline {0} is already active")]
    AlreadyActive(String),

    /// The request id is blank.
    #[error("Request id must not be empty")]
    EmptyRequestId,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Role catalogue could not be loaded.
    #[error("Role catalogue error: {0}")]
    Roles(#[from] AgentError),

    /// Diff statistics could not be computed.
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

/// Statistics about finished pipelines.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub total: u64,
    pub approved: u64,
    pub failed: u64,
    pub stopped: u64,
    pub errored: u64,
    pub average_duration: Duration,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, outcome: PipelineOutcome, duration: Duration) {
        self.total += 1;
        match outcome {
            PipelineOutcome::Approved => self.approved += 1,
            PipelineOutcome::Failed => self.failed += 1,
            PipelineOutcome::Stopped => self.stopped += 1,
            PipelineOutcome::Error => self.errored += 1,
        }
        self.update_average_duration(duration);
    }

    fn update_average_duration(&mut self, duration: Duration) {
        if self.total == 1 {
            self.average_duration = duration;
        } else {
            // Incremental average: avg = avg + (new - avg) / n
            let n = self.total as f64;
            let old_avg = self.average_duration.as_secs_f64();
            let new_avg = old_avg + (duration.as_secs_f64() - old_avg) / n;
            self.average_duration = Duration::from_secs_f64(new_avg.max(0.0));
        }
    }
}

/// Runs pipeline requests, one independent unit per request id.
pub struct PipelineRunner {
    config: PipelineConfig,
    quality: QualityPipeline,
    diff: Arc<dyn DiffProvider>,
    bus: Arc<EventBus>,
    registry: PipelineRegistry,
    stats: RwLock<PipelineStats>,
}

impl PipelineRunner {
    pub fn new(
        config: PipelineConfig,
        quality: QualityPipeline,
        diff: Arc<dyn DiffProvider>,
        bus: Arc<EventBus>,
    ) -> Self {
        let history_limit = config.max_finished_records;
        Self {
            config,
            quality,
            diff,
            bus,
            registry: PipelineRegistry::with_history_limit(history_limit),
            stats: RwLock::new(PipelineStats::new()),
        }
    }

    /// Builds the role catalogue, executor and breaker described by `config`.
    pub fn from_config(
        config: PipelineConfig,
        providers: ProviderRegistry,
        diff: Arc<dyn DiffProvider>,
        bus: Arc<EventBus>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let roles = match &config.roles_file {
            Some(path) => RoleRegistry::load(path)?,
            None => RoleRegistry::with_defaults(),
        };
        let resolution = ModelResolution::new(&config.default_provider, &config.default_model);
        let executor =
            AgentExecutor::new(providers, resolution).with_config(config.executor_config());

        let mut quality = QualityPipeline::new(executor, Arc::new(roles), Arc::clone(&bus));
        if config.breaker_enabled {
            quality = quality.with_breaker(Arc::new(CircuitBreaker::new(
                "quality-agents",
                config.breaker.clone(),
            )));
        }

        Ok(Self::new(config, quality, diff, bus))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn quality(&self) -> &QualityPipeline {
        &self.quality
    }

    /// Accepts `request` and runs it in the background.
    ///
    /// Rejects synchronously when the id is already live. A panic inside the
    /// run is converted to a `pipeline.error` outcome.
    pub fn submit(self: &Arc<Self>, request: PipelineRequest) -> Result<String, PipelineError> {
        let request_id = checked_request_id(&request)?;
        let cancel = self
            .registry
            .register(request.clone())
            .ok_or_else(|| PipelineError::AlreadyActive(request_id.clone()))?;

        let runner = Arc::clone(self);
        let id = request_id.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let inner = Arc::clone(&runner);
            let handle = tokio::spawn(async move { inner.drive(request, cancel).await });
            if let Err(err) = handle.await {
                error!(request_id = %id, error = %err, "Pipeline task aborted");
                runner
                    .conclude(&id, Termination::Errored(format!("pipeline task aborted: {}", err)), started)
                    .await;
            }
        });

        Ok(request_id)
    }

    /// Runs `request` to completion and returns its terminal record.
    pub async fn run(&self, request: PipelineRequest) -> Result<PipelineRecord, PipelineError> {
        let request_id = checked_request_id(&request)?;
        let cancel = self
            .registry
            .register(request.clone())
            .ok_or_else(|| PipelineError::AlreadyActive(request_id.clone()))?;
        Ok(self.drive(request, cancel).await)
    }

    /// Requests cooperative cancellation of one pipeline.
    pub fn stop(&self, request_id: &str) -> bool {
        let stopped = self.registry.cancel(request_id);
        if stopped {
            info!(request_id = %request_id, "Pipeline stop requested");
        }
        stopped
    }

    /// Requests cooperative cancellation of every live pipeline.
    pub fn stop_all(&self) -> usize {
        let count = self.registry.cancel_all();
        info!(count, "Stop requested for all pipelines");
        count
    }

    /// Live snapshot or terminal record of a request.
    pub fn status(&self, request_id: &str) -> Option<PipelineRecord> {
        self.registry.status(request_id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.registry.active_ids()
    }

    pub async fn stats(&self) -> PipelineStats {
        self.stats.read().await.clone()
    }

    async fn drive(&self, request: PipelineRequest, cancel: CancellationToken) -> PipelineRecord {
        let started = Instant::now();
        let request_id = request.request_id.clone();

        info!(
            request_id = %request_id,
            branch = %request.branch,
            base_branch = %request.base_branch,
            "Pipeline accepted"
        );
        self.bus
            .emit(
                EventType::PipelineAccepted,
                &request_id,
                json!({
                    "branch": request.branch,
                    "base_branch": request.base_branch,
                    "worktree_path": request.worktree_path,
                    "metadata": request.metadata,
                }),
            )
            .await;

        let termination = match self.execute(&request, &cancel).await {
            Ok(termination) => termination,
            Err(err) => {
                error!(request_id = %request_id, error = %err, "Pipeline failed internally");
                Termination::Errored(err.to_string())
            }
        };

        match self.conclude(&request_id, termination, started).await {
            Some(record) => record,
            // Only reachable if the entry vanished underneath us.
            None => PipelineRecord {
                request_id: request_id.clone(),
                branch: request.branch,
                base_branch: request.base_branch,
                status: PipelineStatus::Error,
                tier: None,
                agents: Vec::new(),
                stopped: false,
                report: None,
                error: Some("pipeline state lost".to_string()),
                started_at: chrono::Utc::now(),
                finished_at: Some(chrono::Utc::now()),
            },
        }
    }

    async fn execute(
        &self,
        request: &PipelineRequest,
        cancel: &CancellationToken,
    ) -> Result<Termination, PipelineError> {
        let request_id = request.request_id.as_str();

        let stats = tokio::select! {
            _ = cancel.cancelled() => return Ok(Termination::Stopped(None)),
            stats = self.diff.diff_stats(&request.worktree_path, &request.base_branch) => stats?,
        };

        let (tier, overridden) = match request.overrides.tier {
            Some(tier) => (tier, true),
            None => (self.config.thresholds.classify(&stats), false),
        };
        self.registry.set_tier(request_id, tier);
        info!(request_id = %request_id, tier = %tier, overridden, "Tier classified");
        self.bus
            .emit(
                EventType::PipelineTierClassified,
                request_id,
                json!({
                    "tier": tier,
                    "overridden": overridden,
                    "files_changed": stats.files_changed,
                    "lines_changed": stats.lines_changed(),
                }),
            )
            .await;

        if cancel.is_cancelled() {
            return Ok(Termination::Stopped(None));
        }
        self.registry.advance(request_id, PipelineStatus::Running);

        let agents = self.select_agents(request, tier);
        self.registry.set_agents(request_id, &agents);
        self.bus
            .emit(
                EventType::PipelineStarted,
                request_id,
                json!({ "tier": tier, "agents": agents }),
            )
            .await;

        let report = self.run_quality(request, tier, &agents, &stats, cancel).await;

        if cancel.is_cancelled() {
            return Ok(Termination::Stopped(Some(report)));
        }
        if report.passed() {
            Ok(Termination::Approved(report))
        } else {
            Ok(Termination::Failed(report))
        }
    }

    async fn run_quality(
        &self,
        request: &PipelineRequest,
        tier: Tier,
        agents: &[String],
        stats: &DiffStats,
        cancel: &CancellationToken,
    ) -> QualityReport {
        self.quality
            .run(&request.request_id, request, tier, agents, stats, cancel)
            .await
    }

    /// Caller's explicit list beats the tier default.
    fn select_agents(&self, request: &PipelineRequest, tier: Tier) -> Vec<String> {
        match &request.overrides.agents {
            Some(agents) if !agents.is_empty() => agents.clone(),
            _ => self.config.tier_agents.for_tier(tier).to_vec(),
        }
    }

    /// Records the terminal state, then publishes the single terminal event.
    async fn conclude(
        &self,
        request_id: &str,
        termination: Termination,
        started: Instant,
    ) -> Option<PipelineRecord> {
        let outcome = termination.outcome();
        let event_type = match outcome {
            PipelineOutcome::Approved => EventType::PipelineCompleted,
            PipelineOutcome::Failed => EventType::PipelineFailed,
            PipelineOutcome::Stopped => EventType::PipelineStopped,
            PipelineOutcome::Error => EventType::PipelineError,
        };

        let record = self.registry.finish(request_id, termination)?;
        let duration = started.elapsed();

        let mut data = json!({
            "status": record.status,
            "tier": record.tier,
            "agents": record.agents,
            "duration_ms": duration.as_millis() as u64,
        });
        if let Some(report) = &record.report {
            data["overall_status"] = json!(report.overall_status);
            data["findings"] = json!(report.total_findings());
            data["corrections_applied"] = json!(report.corrections_applied.len());
            data["failing_agents"] = json!(report.failing_agents());
        }
        if let Some(message) = &record.error {
            data["error"] = json!(message);
        }
        self.bus.emit(event_type, request_id, data).await;
        self.bus.close(request_id).await;

        self.stats.write().await.record(outcome, duration);
        metrics::record_pipeline_outcome(outcome.as_str());

        match outcome {
            PipelineOutcome::Approved => info!(request_id = %request_id, "Pipeline approved"),
            PipelineOutcome::Stopped => info!(request_id = %request_id, "Pipeline stopped"),
            PipelineOutcome::Failed | PipelineOutcome::Error => warn!(
                request_id = %request_id,
                outcome = outcome.as_str(),
                error = record.error.as_deref().unwrap_or(""),
                "Pipeline did not pass"
            ),
        }
        Some(record)
    }
}

/// Request ids are opaque, but must not be blank.
fn checked_request_id(request: &PipelineRequest) -> Result<String, PipelineError> {
    if request.request_id.trim().is_empty() {
        return Err(PipelineError::EmptyRequestId);
    }
    Ok(request.request_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};
    use async_trait::async_trait;
    use std::path::Path;

    struct MockDiffProvider {
        stats: DiffStats,
    }

    #[async_trait]
    impl DiffProvider for MockDiffProvider {
        async fn diff_stats(&self, _: &Path, _: &str) -> Result<DiffStats, CollaboratorError> {
            Ok(self.stats.clone())
        }
    }

    struct FailingDiffProvider;

    #[async_trait]
    impl DiffProvider for FailingDiffProvider {
        async fn diff_stats(&self, _: &Path, _: &str) -> Result<DiffStats, CollaboratorError> {
            Err(CollaboratorError::Diff("fatal: bad revision 'main...HEAD'".to_string()))
        }
    }

    struct MockLlmProvider {
        reply: &'static str,
    }

    #[async_trait]
    impl LlmProvider for MockLlmProvider {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            Ok(GenerationResponse {
                id: "mock".to_string(),
                model: request.model,
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(self.reply),
                    finish_reason: "stop".to_string(),
                }],
                usage: Usage::default(),
            })
        }
    }

    const PASS: &str = r#"{"status": "passed", "summary": "ok", "findings": []}"#;
    const FAIL: &str = r#"{"status": "failed", "summary": "no", "findings": []}"#;

    fn runner(reply: &'static str, diff: Arc<dyn DiffProvider>) -> PipelineRunner {
        let config = PipelineConfig::default().with_default_model("mock", "m");
        let providers = ProviderRegistry::single("mock", Arc::new(MockLlmProvider { reply }));
        PipelineRunner::from_config(config, providers, diff, Arc::new(EventBus::in_memory()))
            .unwrap()
    }

    fn small_diff() -> Arc<dyn DiffProvider> {
        Arc::new(MockDiffProvider {
            stats: DiffStats {
                files_changed: 1,
                insertions: 5,
                deletions: 1,
                changed_files: vec!["src/lib.rs".to_string()],
            },
        })
    }

    fn lifecycle(events: &[crate::events::PipelineEvent]) -> Vec<String> {
        events
            .iter()
            .filter(|e| {
                !matches!(
                    e.event_type,
                    EventType::PipelineAgentStarted
                        | EventType::PipelineAgentStep
                        | EventType::PipelineAgentCompleted
                )
            })
            .map(|e| e.event_type.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_happy_path_event_sequence() {
        let runner = runner(PASS, small_diff());
        let request = PipelineRequest::new("feature/x", "/tmp").with_request_id("req-ok");

        let record = runner.run(request).await.unwrap();
        assert_eq!(record.status, PipelineStatus::Approved);
        assert_eq!(record.tier, Some(Tier::Small));
        assert_eq!(record.agents, vec!["tests", "style"]);

        let events = runner.bus().get_events("req-ok").await.unwrap();
        assert_eq!(
            lifecycle(&events),
            vec![
                "pipeline.accepted",
                "pipeline.tier_classified",
                "pipeline.started",
                "pipeline.completed"
            ]
        );

        let stats = runner.stats().await;
        assert_eq!((stats.total, stats.approved), (1, 1));
        assert!(runner.active_ids().is_empty());
        assert_eq!(runner.status("req-ok").unwrap().status, PipelineStatus::Approved);
    }

    #[tokio::test]
    async fn test_failed_agents_fail_pipeline() {
        let runner = runner(FAIL, small_diff());
        let request = PipelineRequest::new("b", "/tmp").with_request_id("req-fail");
        let record = runner.run(request).await.unwrap();

        assert_eq!(record.status, PipelineStatus::Failed);
        assert!(!record.stopped);
        let events = runner.bus().get_events("req-fail").await.unwrap();
        assert_eq!(lifecycle(&events).last().unwrap(), "pipeline.failed");
        assert_eq!(runner.stats().await.failed, 1);
    }

    #[tokio::test]
    async fn test_overrides_skip_classification() {
        let runner = runner(PASS, small_diff());
        let request = PipelineRequest::new("b", "/tmp")
            .with_request_id("req-over")
            .with_tier(Tier::Large)
            .with_agents(["security"]);
        let record = runner.run(request).await.unwrap();

        assert_eq!(record.tier, Some(Tier::Large));
        assert_eq!(record.agents, vec!["security"]);
        let events = runner.bus().get_events("req-over").await.unwrap();
        let classified = events
            .iter()
            .find(|e| e.event_type == EventType::PipelineTierClassified)
            .unwrap();
        assert_eq!(classified.data["overridden"], true);
    }

    #[tokio::test]
    async fn test_diff_failure_is_error_outcome() {
        let runner = runner(PASS, Arc::new(FailingDiffProvider));
        let request = PipelineRequest::new("b", "/tmp").with_request_id("req-err");
        let record = runner.run(request).await.unwrap();

        assert_eq!(record.status, PipelineStatus::Error);
        assert!(record.error.unwrap().contains("bad revision"));
        let events = runner.bus().get_events("req-err").await.unwrap();
        assert_eq!(
            lifecycle(&events),
            vec!["pipeline.accepted", "pipeline.error"]
        );
        assert_eq!(runner.stats().await.errored, 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_duplicate_live_id() {
        let runner = Arc::new(runner(PASS, small_diff()));
        let request = PipelineRequest::new("b", "/tmp").with_request_id("req-dup");

        runner.submit(request.clone()).unwrap();
        let err = runner.submit(request).unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyActive(id) if id == "req-dup"));
    }

    #[tokio::test]
    async fn test_stop_unknown_is_false() {
        let runner = runner(PASS, small_diff());
        assert!(!runner.stop("nope"));
        assert_eq!(runner.stop_all(), 0);
    }

    #[test]
    fn test_stats_average() {
        let mut stats = PipelineStats::new();
        stats.record(PipelineOutcome::Approved, Duration::from_secs(2));
        stats.record(PipelineOutcome::Stopped, Duration::from_secs(4));
        assert_eq!(stats.total, 2);
        assert_eq!(stats.stopped, 1);
        assert_eq!(stats.average_duration, Duration::from_secs(3));
    }
}
