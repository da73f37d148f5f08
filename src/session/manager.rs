//! Session manager: admission, the issue-to-PR pipeline, and reactions to
//! external signals.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::error::{SessionError, SessionResult};
use super::reactions::{PromptContext, Reaction, ReactionAction, ReactionEngine, ReactionTable, SignalKind};
use super::types::{IssueRef, Plan, Session, SessionStatus, SessionView, StartSessionRequest};
use crate::agents::{AgentContext, AgentExecutor, AgentResult, AgentStatus, RoleRegistry, StepCallback, StepEvent};
use crate::collaborators::{GitOperations, IssueTracker};
use crate::events::{EventBus, EventForwarder, EventType, PipelineEvent};
use crate::metrics;
use crate::state_machine::Transitions;

const PLANNER_ROLE: &str = "planner";
const IMPLEMENTER_ROLE: &str = "implementer";

struct SessionEntry {
    session: Session,
    cancel: CancellationToken,
}

/// Why a pipeline step stopped.
enum StepError {
    /// Cancelled, escalated or otherwise moved on by someone else.
    Interrupted,
    Failed { step: &'static str, message: String },
}

impl StepError {
    fn failed(step: &'static str, message: impl Into<String>) -> Self {
        StepError::Failed {
            step,
            message: message.into(),
        }
    }

    /// Attributes an agent failure to the pipeline step it happened in.
    fn in_step(self, step: &'static str) -> Self {
        match self {
            StepError::Failed { message, .. } => StepError::Failed { step, message },
            other => other,
        }
    }
}

/// Owns every session, keyed by session id.
///
/// The session map lock is never held across an await; events are published
/// after it is released.
pub struct SessionManager {
    config: SessionConfig,
    executor: AgentExecutor,
    roles: Arc<RoleRegistry>,
    git: Arc<dyn GitOperations>,
    tracker: Option<Arc<dyn IssueTracker>>,
    bus: Arc<EventBus>,
    engine: ReactionEngine,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionManager {
    /// Creates a manager; loads the reaction overlay named in `config`.
    pub fn new(
        config: SessionConfig,
        executor: AgentExecutor,
        roles: Arc<RoleRegistry>,
        git: Arc<dyn GitOperations>,
        bus: Arc<EventBus>,
    ) -> SessionResult<Self> {
        config.validate()?;
        let table = match &config.reactions_file {
            Some(path) => ReactionTable::load(path)?,
            None => ReactionTable::default(),
        };
        Ok(Self {
            config,
            executor,
            roles,
            git,
            tracker: None,
            bus,
            engine: ReactionEngine::new(table),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn IssueTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_reaction_table(mut self, table: ReactionTable) -> Self {
        self.engine = ReactionEngine::new(table);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn refresh_gauge(&self) {
        let active = self.lock().values().filter(|e| e.session.is_active()).count();
        metrics::set_active_sessions(active);
    }

    /// Admits a session and runs its pipeline in the background.
    pub async fn start(self: &Arc<Self>, request: StartSessionRequest) -> SessionResult<SessionView> {
        let view = self.admit(request).await?;
        let manager = Arc::clone(self);
        let id = view.session_id.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.run_pipeline(&id).await {
                error!(session_id = %id, error = %err, "Session pipeline aborted");
            }
        });
        Ok(view)
    }

    /// Validates and registers a session in `accepted` without running it.
    ///
    /// Rejects with `Conflict` when an active session for the same issue has
    /// been idle for less than `stale_after`; an older one is superseded and
    /// cancelled. Rejects with `Capacity` at the parallel-session cap.
    pub async fn admit(&self, request: StartSessionRequest) -> SessionResult<SessionView> {
        let source = request.issue_source()?;
        let number = source.issue_number();

        // Fail fast before the tracker round-trip; re-checked below.
        self.admission_check(&self.lock(), number, Utc::now())?;

        let issue = match source.synthetic_ref() {
            Some(issue) => issue,
            None => {
                let number = number.unwrap_or_default();
                let tracker = self.tracker.as_ref().ok_or_else(|| {
                    SessionError::InvalidRequest(
                        "issue_number given but no issue tracker is configured".to_string(),
                    )
                })?;
                IssueRef::from(tracker.fetch_issue_detail(number).await?)
            }
        };

        let id = uuid::Uuid::new_v4().to_string();
        let mut session = Session::new(&id, issue, &request.project_path);
        session.base_branch = request
            .base_branch
            .clone()
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| self.config.default_base_branch.clone());
        session.model = request.model.clone();
        session.provider = request.provider.clone();

        let (view, superseded) = {
            let mut sessions = self.lock();
            let superseded = self.admission_check(&sessions, number, Utc::now())?;
            for old_id in &superseded {
                if let Some(entry) = sessions.get_mut(old_id) {
                    entry.session.advance(SessionStatus::Cancelled);
                    entry.cancel.cancel();
                }
            }
            let view = session.view();
            sessions.insert(
                id.clone(),
                SessionEntry {
                    session,
                    cancel: CancellationToken::new(),
                },
            );
            (view, superseded)
        };

        for old_id in &superseded {
            warn!(session_id = %old_id, superseded_by = %id, "Stale session superseded");
            self.bus
                .emit(
                    EventType::SessionCancelled,
                    old_id,
                    json!({ "reason": "superseded", "superseded_by": id }),
                )
                .await;
            self.bus.close(old_id).await;
        }

        info!(
            session_id = %id,
            issue = ?view.issue.number,
            synthetic = view.issue.synthetic,
            "Session accepted"
        );
        self.bus
            .emit(
                EventType::SessionAccepted,
                &id,
                json!({
                    "issue": view.issue,
                    "project_path": view.project_path,
                    "base_branch": view.base_branch,
                    "model": view.model,
                    "provider": view.provider,
                }),
            )
            .await;
        self.refresh_gauge();
        Ok(view)
    }

    /// Returns the ids of stale sessions a new session for `number` supersedes.
    fn admission_check(
        &self,
        sessions: &HashMap<String, SessionEntry>,
        number: Option<u64>,
        now: DateTime<Utc>,
    ) -> SessionResult<Vec<String>> {
        let mut superseded = Vec::new();
        if let Some(number) = number {
            for entry in sessions.values() {
                let session = &entry.session;
                if !session.is_active() || session.issue.number != Some(number) {
                    continue;
                }
                let idle = session.idle_for(now).to_std().unwrap_or_default();
                if idle < self.config.stale_after {
                    return Err(SessionError::Conflict {
                        issue: number,
                        existing_id: session.id.clone(),
                    });
                }
                superseded.push(session.id.clone());
            }
        }

        let active = sessions.values().filter(|e| e.session.is_active()).count();
        if active - superseded.len() >= self.config.max_parallel {
            return Err(SessionError::Capacity {
                limit: self.config.max_parallel,
            });
        }
        Ok(superseded)
    }

    /// Runs `planning → implementing → pr_created → ci_running`.
    ///
    /// Any step error moves the session to `failed` and publishes
    /// `session.failed`; there is no retry inside the pipeline. Returns the
    /// state the session ends in.
    pub async fn run_pipeline(&self, session_id: &str) -> SessionResult<SessionStatus> {
        let cancel = self.with_entry(session_id, |entry| entry.cancel.clone())?;

        if !self.advance(session_id, SessionStatus::Planning) {
            return self.current_status(session_id);
        }
        self.bus
            .emit(EventType::SessionPlanning, session_id, json!({}))
            .await;

        match self.pipeline_steps(session_id, &cancel).await {
            Ok(()) => {}
            Err(StepError::Interrupted) => {
                info!(session_id = %session_id, "Session pipeline interrupted");
            }
            Err(StepError::Failed { step, message }) => {
                self.fail(session_id, step, &message).await;
            }
        }
        self.release_log_if_finished(session_id).await;
        self.current_status(session_id)
    }

    async fn pipeline_steps(&self, session_id: &str, cancel: &CancellationToken) -> Result<(), StepError> {
        let session = self.snapshot(session_id).ok_or(StepError::Interrupted)?;

        // Planning
        let branch = self.branch_name(&session);
        let worktree = tokio::select! {
            _ = cancel.cancelled() => return Err(StepError::Interrupted),
            result = self.git.create_worktree(&session.project_path, &branch, &session.base_branch) => {
                result.map_err(|e| StepError::failed("planning", e.to_string()))?
            }
        };
        let session = self
            .with_entry(session_id, |entry| {
                entry.session.set_workspace(&branch, &worktree);
                entry.session.clone()
            })
            .map_err(|_| StepError::Interrupted)?;

        let planned = self
            .run_role(session_id, &session, PLANNER_ROLE, issue_task(&session.issue), Vec::new(), &worktree, cancel)
            .await
            .map_err(|e| e.in_step("planning"))?;
        let plan = Plan {
            summary: planned.summary.clone(),
            notes: planned.findings.iter().map(|f| f.description.clone()).collect(),
            created_at: Utc::now(),
        };
        self.with_entry(session_id, |entry| {
            entry.session.plan = Some(plan.clone());
            entry.session.agent_results.push(planned.clone());
            entry.session.touch();
        })
        .map_err(|_| StepError::Interrupted)?;
        self.bus
            .emit(
                EventType::SessionPlanReady,
                session_id,
                json!({ "plan": plan }),
            )
            .await;

        // Implementing
        self.step(session_id, SessionStatus::Implementing)?;
        self.bus
            .emit(EventType::SessionImplementing, session_id, json!({ "attempt": 0 }))
            .await;
        let task = format!(
            "{}\n\nImplementation plan:\n{}",
            issue_task(&session.issue),
            plan.summary
        );
        let implemented = self
            .run_role(session_id, &session, IMPLEMENTER_ROLE, task, vec![planned], &worktree, cancel)
            .await
            .map_err(|e| e.in_step("implementing"))?;
        self.with_entry(session_id, |entry| {
            entry.session.agent_results.push(implemented.clone());
        })
        .map_err(|_| StepError::Interrupted)?;
        self.bus
            .emit(
                EventType::SessionImplemented,
                session_id,
                json!({
                    "summary": implemented.summary,
                    "findings": implemented.findings.len(),
                }),
            )
            .await;

        // Pull request
        let message = match session.issue.number {
            Some(number) => format!("{} (#{})", session.issue.title, number),
            None => session.issue.title.clone(),
        };
        self.git
            .commit_and_push(&worktree, &branch, &message)
            .await
            .map_err(|e| StepError::failed("pull_request", e.to_string()))?;
        if cancel.is_cancelled() {
            return Err(StepError::Interrupted);
        }
        let body = pr_body(&session.issue, &plan, &implemented);
        let pull_request = self
            .git
            .create_pull_request(&worktree, &branch, &session.base_branch, &session.issue.title, &body)
            .await
            .map_err(|e| StepError::failed("pull_request", e.to_string()))?;
        self.with_entry(session_id, |entry| {
            entry.session.set_pull_request(pull_request.clone());
        })
        .map_err(|_| StepError::Interrupted)?;
        self.step(session_id, SessionStatus::PrCreated)?;
        self.bus
            .emit(
                EventType::SessionPrCreated,
                session_id,
                json!({ "pr_number": pull_request.number, "pr_url": pull_request.url }),
            )
            .await;

        // CI
        self.step(session_id, SessionStatus::CiRunning)?;
        self.bus
            .emit(EventType::SessionCiRunning, session_id, json!({ "attempt": 0 }))
            .await;
        info!(session_id = %session_id, pr = pull_request.number, "Session waiting on CI");
        Ok(())
    }

    /// Runs one role for a session with step events forwarded to the bus.
    ///
    /// Every step refreshes the session's activity stamp, so a working agent
    /// never looks idle to `sweep_stale` or admission.
    #[allow(clippy::too_many_arguments)]
    async fn run_role(
        &self,
        session_id: &str,
        session: &Session,
        role_name: &str,
        task: String,
        prior_results: Vec<AgentResult>,
        worktree: &Path,
        cancel: &CancellationToken,
    ) -> Result<AgentResult, StepError> {
        let mut role = self
            .roles
            .require(role_name)
            .map_err(|e| StepError::failed("agent", e.to_string()))?
            .clone();
        if let Some(model) = &session.model {
            role.model = Some(model.clone());
        }
        if let Some(provider) = &session.provider {
            role.provider = Some(provider.clone());
        }

        let ctx = AgentContext::new(session_id, worktree, task)
            .with_branches(session.branch().unwrap_or_default(), &session.base_branch)
            .with_prior_results(prior_results);

        let forwarder = EventForwarder::spawn(Arc::clone(&self.bus));
        let result = {
            let tx = forwarder.sender();
            let id = session_id.to_string();
            let agent = role.name.clone();
            let activity = session.activity();
            let callback: StepCallback = Arc::new(move |step| {
                activity.touch();
                let _ = tx.send(step_event(&id, &agent, step));
            });
            let executor = self.executor.clone().with_step_callback(callback);
            executor.execute(&role, &ctx, cancel).await
        };
        forwarder.finish().await;

        if cancel.is_cancelled() {
            return Err(StepError::Interrupted);
        }
        match result.status {
            AgentStatus::Passed => Ok(result),
            AgentStatus::Failed => Err(StepError::failed(
                "agent",
                format!("{} reported failure: {}", role.name, result.summary),
            )),
            AgentStatus::Error | AgentStatus::Timeout => Err(StepError::failed(
                "agent",
                result
                    .error
                    .unwrap_or_else(|| format!("{} did not finish", role.name)),
            )),
        }
    }

    /// Applies the configured reaction to an external signal.
    ///
    /// `ci_passed` first moves `ci_running → review_requested`. Returns the
    /// reaction applied, or `None` when the table has no rule for the signal.
    pub async fn handle_signal(
        &self,
        session_id: &str,
        signal: SignalKind,
        feedback: Option<String>,
    ) -> SessionResult<Option<Reaction>> {
        let now = Utc::now();
        let (reaction, mut prompt, review_requested) = {
            let mut sessions = self.lock();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            let session = &mut entry.session;
            let needs_pull_request = self
                .engine
                .table()
                .get(signal)
                .is_some_and(|rule| rule.action.acts_on_pull_request());
            let status = session.status();
            // Respawn and merge reactions need a pull request under CI or review.
            if !session.is_active() || (needs_pull_request && !status.awaits_feedback()) {
                return Err(SessionError::invalid_state(
                    session_id,
                    status,
                    format!("handle {} for", signal),
                ));
            }

            let review_requested = signal == SignalKind::CiPassed
                && session.status() == SessionStatus::CiRunning
                && session.advance(SessionStatus::ReviewRequested);

            let counter = session.retries.entry(signal).or_default();
            let reaction = self.engine.decide(signal, counter, now);
            let attempt = counter.attempts;
            session.touch();
            (reaction, prompt_context(session, signal, attempt, feedback.as_deref()), review_requested)
        };

        if review_requested {
            self.bus
                .emit(EventType::SessionReviewRequested, session_id, json!({}))
                .await;
        }

        let Some(reaction) = reaction else {
            debug!(session_id = %session_id, signal = %signal, "No reaction configured");
            return Ok(None);
        };

        let action = reaction.action();
        metrics::record_reaction(signal.as_str(), action.as_str());
        info!(session_id = %session_id, signal = %signal, action = action.as_str(), "Reaction triggered");
        self.bus
            .emit(
                EventType::ReactionTriggered,
                session_id,
                json!({ "signal": signal, "action": action, "attempt": prompt.attempt }),
            )
            .await;

        match &reaction {
            Reaction::Respawn { attempt } => {
                prompt.attempt = *attempt;
                self.respawn(session_id, signal, prompt).await?;
            }
            Reaction::Notify => {
                self.notify(session_id, signal, &prompt).await;
            }
            Reaction::Escalate { reason } => {
                let configured = self.engine.table().get(signal).map(|r| r.action);
                let reason = match configured {
                    Some(ReactionAction::Escalate) => {
                        let rendered = self.engine.render(signal, &prompt)?;
                        if rendered.is_empty() {
                            reason.clone()
                        } else {
                            rendered
                        }
                    }
                    _ => reason.clone(),
                };
                self.escalate(session_id, Some(reason)).await?;
            }
            Reaction::AutoMerge => {
                self.auto_merge(session_id).await?;
            }
        }
        Ok(Some(reaction))
    }

    /// Re-enters `implementing` with a feedback prompt, then pushes and goes
    /// back to `ci_running`.
    async fn respawn(&self, session_id: &str, signal: SignalKind, prompt: PromptContext) -> SessionResult<()> {
        let (session, worktree, cancel) = {
            let mut sessions = self.lock();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            let worktree = entry.session.worktree_path().cloned();
            let Some(worktree) = worktree.filter(|_| entry.session.status().awaits_feedback()) else {
                return Err(SessionError::invalid_state(
                    session_id,
                    entry.session.status(),
                    "respawn",
                ));
            };
            entry.session.advance(SessionStatus::Implementing);
            (entry.session.clone(), worktree, entry.cancel.clone())
        };

        let attempt = prompt.attempt;
        self.bus
            .emit(
                EventType::SessionImplementing,
                session_id,
                json!({ "attempt": attempt, "signal": signal }),
            )
            .await;

        let mut instructions = self.engine.render(signal, &prompt)?;
        if instructions.is_empty() {
            instructions = prompt.feedback.clone();
        }
        let task = format!("{}\n\n{}", issue_task(&session.issue), instructions);

        let outcome = self
            .respawn_steps(session_id, &session, &worktree, task, &cancel)
            .await;
        match outcome {
            Ok(()) => {
                self.bus
                    .emit(
                        EventType::SessionCiRunning,
                        session_id,
                        json!({ "attempt": attempt }),
                    )
                    .await;
            }
            Err(StepError::Interrupted) => {}
            Err(StepError::Failed { step, message }) => self.fail(session_id, step, &message).await,
        }
        self.release_log_if_finished(session_id).await;
        Ok(())
    }

    async fn respawn_steps(
        &self,
        session_id: &str,
        session: &Session,
        worktree: &Path,
        task: String,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let implemented = self
            .run_role(
                session_id,
                session,
                IMPLEMENTER_ROLE,
                task,
                session.agent_results.clone(),
                worktree,
                cancel,
            )
            .await
            .map_err(|e| e.in_step("respawn"))?;
        self.with_entry(session_id, |entry| {
            entry.session.agent_results.push(implemented.clone());
        })
        .map_err(|_| StepError::Interrupted)?;
        self.bus
            .emit(
                EventType::SessionImplemented,
                session_id,
                json!({ "summary": implemented.summary, "findings": implemented.findings.len() }),
            )
            .await;

        let branch = session.branch().unwrap_or_default();
        self.git
            .commit_and_push(worktree, branch, &format!("Address feedback: {}", session.issue.title))
            .await
            .map_err(|e| StepError::failed("respawn", e.to_string()))?;
        self.step(session_id, SessionStatus::CiRunning)
    }

    async fn notify(&self, session_id: &str, signal: SignalKind, prompt: &PromptContext) {
        let message = match self.engine.render(signal, prompt) {
            Ok(message) if !message.is_empty() => message,
            Ok(_) => format!("Session {}: {}", session_id, signal),
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Notification template failed");
                format!("Session {}: {}", session_id, signal)
            }
        };
        let delivered = self.comment(prompt.issue_number, &message).await;
        self.bus
            .emit(
                EventType::ReactionNotified,
                session_id,
                json!({ "signal": signal, "message": message, "delivered": delivered }),
            )
            .await;
    }

    /// Best-effort tracker comment; failures are logged.
    async fn comment(&self, issue_number: Option<u64>, body: &str) -> bool {
        let (Some(tracker), Some(number)) = (&self.tracker, issue_number) else {
            return false;
        };
        match tracker.add_comment(number, body).await {
            Ok(()) => true,
            Err(err) => {
                warn!(issue = number, error = %err, "Failed to comment on issue");
                false
            }
        }
    }

    async fn auto_merge(&self, session_id: &str) -> SessionResult<()> {
        let (pull_request, dir) = self.with_entry(session_id, |entry| {
            let session = &entry.session;
            let dir = session
                .worktree_path()
                .cloned()
                .unwrap_or_else(|| session.project_path.clone());
            match session.pull_request() {
                Some(pr) if session.can_transition(SessionStatus::Merged) => Ok((pr.clone(), dir)),
                _ => Err(SessionError::invalid_state(session_id, session.status(), "merge")),
            }
        })??;

        match self.git.merge_pull_request(&dir, pull_request.number).await {
            Ok(()) => {
                if self.advance(session_id, SessionStatus::Merged) {
                    info!(session_id = %session_id, pr = pull_request.number, "Session merged");
                    self.bus
                        .emit(
                            EventType::SessionCompleted,
                            session_id,
                            json!({ "pr_number": pull_request.number, "pr_url": pull_request.url }),
                        )
                        .await;
                    self.bus.close(session_id).await;
                    self.refresh_gauge();
                }
                Ok(())
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Auto-merge failed");
                self.escalate(session_id, Some(format!("auto-merge failed: {}", err)))
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Moves a session to `escalated`.
    ///
    /// Idempotent: escalating an escalated session changes nothing, but a
    /// reason not seen before is recorded and published once. Other terminal
    /// states reject the call.
    pub async fn escalate(&self, session_id: &str, reason: Option<String>) -> SessionResult<SessionView> {
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "manual escalation".to_string());

        let (view, publish) = {
            let mut sessions = self.lock();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            let session = &mut entry.session;
            let publish = match session.status() {
                SessionStatus::Escalated => {
                    if session.escalation_reasons.contains(&reason) {
                        false
                    } else {
                        session.escalation_reasons.push(reason.clone());
                        true
                    }
                }
                status if !session.can_transition(SessionStatus::Escalated) => {
                    return Err(SessionError::invalid_state(session_id, status, "escalate"));
                }
                _ => {
                    session.advance(SessionStatus::Escalated);
                    session.escalation_reasons.push(reason.clone());
                    entry.cancel.cancel();
                    true
                }
            };
            (session.view(), publish)
        };

        if publish {
            warn!(session_id = %session_id, reason = %reason, "Session escalated");
            self.bus
                .emit(
                    EventType::ReactionEscalated,
                    session_id,
                    json!({ "reason": reason }),
                )
                .await;
            self.bus.close(session_id).await;
            self.comment(view.issue.number, &format!("Escalated to a human: {}", reason))
                .await;
        }
        self.refresh_gauge();
        Ok(view)
    }

    /// Moves a session to `cancelled` and fires its cancellation token.
    pub async fn cancel(&self, session_id: &str, reason: Option<String>) -> SessionResult<SessionView> {
        let view = self.with_entry(session_id, |entry| {
            if !entry.session.can_transition(SessionStatus::Cancelled) {
                return Err(SessionError::invalid_state(
                    session_id,
                    entry.session.status(),
                    "cancel",
                ));
            }
            entry.session.advance(SessionStatus::Cancelled);
            entry.cancel.cancel();
            Ok(entry.session.view())
        })??;

        let reason = reason.unwrap_or_else(|| "cancelled by caller".to_string());
        info!(session_id = %session_id, reason = %reason, "Session cancelled");
        self.bus
            .emit(EventType::SessionCancelled, session_id, json!({ "reason": reason }))
            .await;
        self.bus.close(session_id).await;
        self.refresh_gauge();
        Ok(view)
    }

    /// Raises `stuck` for every active session idle longer than `stuck_after`.
    /// Returns the ids that were signalled.
    pub async fn sweep_stale(&self) -> Vec<String> {
        let now = Utc::now();
        let mut stale: Vec<String> = self
            .lock()
            .values()
            .filter(|e| e.session.is_active())
            .filter(|e| e.session.idle_for(now).to_std().unwrap_or_default() >= self.config.stuck_after)
            .map(|e| e.session.id.clone())
            .collect();
        stale.sort();

        for id in &stale {
            if let Err(err) = self.handle_signal(id, SignalKind::Stuck, None).await {
                warn!(session_id = %id, error = %err, "Stuck reaction failed");
            }
        }
        stale
    }

    pub fn get(&self, session_id: &str) -> Option<SessionView> {
        self.lock().get(session_id).map(|e| e.session.view())
    }

    /// Every session, oldest first.
    pub fn list(&self) -> Vec<SessionView> {
        let mut views: Vec<SessionView> = self.lock().values().map(|e| e.session.view()).collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.session_id.cmp(&b.session_id)));
        views
    }

    pub fn active_count(&self) -> usize {
        self.lock().values().filter(|e| e.session.is_active()).count()
    }

    async fn fail(&self, session_id: &str, step: &str, message: &str) {
        let moved = self
            .with_entry(session_id, |entry| {
                let moved = entry.session.advance(SessionStatus::Failed);
                if moved {
                    entry.session.last_error = Some(message.to_string());
                }
                moved
            })
            .unwrap_or(false);
        if !moved {
            return;
        }
        error!(session_id = %session_id, step, error = %message, "Session failed");
        self.bus
            .emit(
                EventType::SessionFailed,
                session_id,
                json!({ "step": step, "error": message }),
            )
            .await;
        self.bus.close(session_id).await;
        self.refresh_gauge();
    }

    /// Closes the event log of a session that has reached a terminal state.
    ///
    /// Late step events from an interrupted agent reopen the log, so this runs
    /// again once a pipeline task has unwound.
    async fn release_log_if_finished(&self, session_id: &str) {
        let finished = self
            .current_status(session_id)
            .map(|status| status.is_terminal())
            .unwrap_or(true);
        if finished {
            self.bus.close(session_id).await;
        }
    }

    fn with_entry<T>(&self, session_id: &str, f: impl FnOnce(&mut SessionEntry) -> T) -> SessionResult<T> {
        let mut sessions = self.lock();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        Ok(f(entry))
    }

    fn snapshot(&self, session_id: &str) -> Option<Session> {
        self.lock().get(session_id).map(|e| e.session.clone())
    }

    fn advance(&self, session_id: &str, to: SessionStatus) -> bool {
        self.with_entry(session_id, |entry| entry.session.advance(to))
            .unwrap_or(false)
    }

    /// Pipeline transition; losing the race to a cancel or escalation
    /// interrupts the pipeline.
    fn step(&self, session_id: &str, to: SessionStatus) -> Result<(), StepError> {
        if self.advance(session_id, to) {
            Ok(())
        } else {
            Err(StepError::Interrupted)
        }
    }

    fn current_status(&self, session_id: &str) -> SessionResult<SessionStatus> {
        self.with_entry(session_id, |entry| entry.session.status())
    }

    fn branch_name(&self, session: &Session) -> String {
        let suffix = match session.issue.number {
            Some(number) => format!("issue-{}", number),
            None => format!("task-{}", session.id.chars().take(8).collect::<String>()),
        };
        format!("{}{}", self.config.branch_prefix, suffix)
    }
}

fn step_event(session_id: &str, agent: &str, step: StepEvent) -> PipelineEvent {
    let event_type = match &step {
        StepEvent::AssistantText { .. } => EventType::SessionAssistantText,
        StepEvent::ToolCall { .. } => EventType::SessionToolCall,
        StepEvent::ToolResult { .. } => EventType::SessionToolResult,
    };
    let step = serde_json::to_value(&step).unwrap_or(Value::Null);
    PipelineEvent::new(event_type, session_id, json!({ "agent": agent, "step": step }))
}

fn issue_task(issue: &IssueRef) -> String {
    let mut task = match issue.number {
        Some(number) => format!("Issue #{}: {}", number, issue.title),
        None => format!("Task: {}", issue.title),
    };
    if !issue.body.trim().is_empty() {
        task.push_str("\n\n");
        task.push_str(issue.body.trim());
    }
    task
}

fn pr_body(issue: &IssueRef, plan: &Plan, implemented: &AgentResult) -> String {
    let mut body = String::new();
    if !implemented.summary.is_empty() {
        body.push_str(&implemented.summary);
        body.push_str("\n\n");
    }
    body.push_str("## Plan\n\n");
    body.push_str(&plan.summary);
    if let Some(number) = issue.number {
        body.push_str(&format!("\n\nCloses #{}", number));
    }
    body
}

fn prompt_context(session: &Session, signal: SignalKind, attempt: u32, feedback: Option<&str>) -> PromptContext {
    PromptContext {
        signal: signal.as_str().to_string(),
        issue_number: session.issue.number,
        issue_title: session.issue.title.clone(),
        issue_body: session.issue.body.clone(),
        branch: session.branch().unwrap_or_default().to_string(),
        pr_url: session
            .pull_request()
            .map(|pr| pr.url.clone())
            .unwrap_or_default(),
        attempt,
        max_retries: 0,
        feedback: feedback.unwrap_or_default().to_string(),
    }
}
