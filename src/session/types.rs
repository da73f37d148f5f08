//! Session records and their lifecycle.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::SessionError;
use super::reactions::SignalKind;
use crate::agents::AgentResult;
use crate::collaborators::{IssueDetail, PullRequestRef};
use crate::state_machine::{StateMachine, Transitions};

/// Lifecycle of an issue-to-PR session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Accepted,
    Planning,
    Implementing,
    PrCreated,
    CiRunning,
    ReviewRequested,
    Merged,
    Failed,
    Escalated,
    Cancelled,
}

impl Transitions for SessionStatus {
    fn targets(self) -> &'static [Self] {
        use SessionStatus::*;
        match self {
            Accepted => &[Planning, Failed, Cancelled, Escalated],
            Planning => &[Implementing, Failed, Cancelled, Escalated],
            Implementing => &[PrCreated, CiRunning, Failed, Cancelled, Escalated],
            PrCreated => &[CiRunning, Failed, Cancelled, Escalated],
            CiRunning => &[ReviewRequested, Merged, Implementing, Failed, Cancelled, Escalated],
            ReviewRequested => &[Implementing, Merged, Escalated, Cancelled],
            Merged | Failed | Escalated | Cancelled => &[],
        }
    }
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Accepted => "accepted",
            SessionStatus::Planning => "planning",
            SessionStatus::Implementing => "implementing",
            SessionStatus::PrCreated => "pr_created",
            SessionStatus::CiRunning => "ci_running",
            SessionStatus::ReviewRequested => "review_requested",
            SessionStatus::Merged => "merged",
            SessionStatus::Failed => "failed",
            SessionStatus::Escalated => "escalated",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    /// Non-terminal sessions count toward capacity and issue exclusivity.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// States in which the pull request exists and is under CI or review.
    pub fn awaits_feedback(self) -> bool {
        matches!(self, SessionStatus::CiRunning | SessionStatus::ReviewRequested)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The issue a session works on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRef {
    /// Tracker number; `None` for synthetic issues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u64>,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Built from inline text or a prompt rather than fetched.
    #[serde(default)]
    pub synthetic: bool,
}

impl From<IssueDetail> for IssueRef {
    fn from(detail: IssueDetail) -> Self {
        Self {
            number: Some(detail.number),
            title: detail.title,
            body: detail.body,
            labels: detail.labels,
            synthetic: false,
        }
    }
}

/// Where the issue of a new session comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueSource {
    Tracker(u64),
    Inline { title: String, body: String },
    Prompt(String),
}

impl IssueSource {
    pub fn issue_number(&self) -> Option<u64> {
        match self {
            IssueSource::Tracker(number) => Some(*number),
            _ => None,
        }
    }

    /// Issue reference for sources that need no tracker lookup.
    pub(crate) fn synthetic_ref(&self) -> Option<IssueRef> {
        match self {
            IssueSource::Tracker(_) => None,
            IssueSource::Inline { title, body } => Some(IssueRef {
                number: None,
                title: title.clone(),
                body: body.clone(),
                labels: Vec::new(),
                synthetic: true,
            }),
            IssueSource::Prompt(prompt) => Some(IssueRef {
                number: None,
                title: prompt_title(prompt),
                body: prompt.clone(),
                labels: Vec::new(),
                synthetic: true,
            }),
        }
    }
}

/// First line of a prompt, cut to 72 characters.
fn prompt_title(prompt: &str) -> String {
    let first = prompt.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let first = first.trim();
    if first.chars().count() <= 72 {
        first.to_string()
    } else {
        let cut: String = first.chars().take(69).collect();
        format!("{}...", cut.trim_end())
    }
}

/// A request to start a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartSessionRequest {
    #[serde(default)]
    pub issue_number: Option<u64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    pub project_path: PathBuf,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
}

impl StartSessionRequest {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            ..Self::default()
        }
    }

    pub fn for_issue(mut self, number: u64) -> Self {
        self.issue_number = Some(number);
        self
    }

    pub fn with_inline_issue(mut self, title: impl Into<String>, body: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self.body = Some(body.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_model(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    pub fn with_base_branch(mut self, base_branch: impl Into<String>) -> Self {
        self.base_branch = Some(base_branch.into());
        self
    }

    /// Exactly one source, by precedence: tracker number, inline title+body,
    /// then free-text prompt.
    pub fn issue_source(&self) -> Result<IssueSource, SessionError> {
        if let Some(number) = self.issue_number {
            return Ok(IssueSource::Tracker(number));
        }
        let title = self.title.as_deref().map(str::trim).unwrap_or("");
        if !title.is_empty() {
            return Ok(IssueSource::Inline {
                title: title.to_string(),
                body: self.body.clone().unwrap_or_default(),
            });
        }
        match self.prompt.as_deref().map(str::trim) {
            Some(prompt) if !prompt.is_empty() => Ok(IssueSource::Prompt(prompt.to_string())),
            _ => Err(SessionError::InvalidRequest(
                "one of issue_number, title or prompt is required".to_string(),
            )),
        }
    }
}

/// Plan produced by the planning step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub summary: String,
    /// Open points the planner raised.
    #[serde(default)]
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Retry bookkeeping for one signal class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounter {
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,
}

/// Last time a session showed any sign of life, shared with the agents
/// working on it so their steps count as activity.
#[derive(Debug, Clone)]
pub struct ActivityStamp(Arc<AtomicI64>);

impl ActivityStamp {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(Arc::new(AtomicI64::new(at.timestamp_millis())))
    }

    /// Moves the stamp to now; never moves it backwards.
    pub fn touch(&self) {
        self.0.fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn get(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0.load(Ordering::Relaxed)).unwrap_or_default()
    }
}

/// One session, owned by the session manager.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub issue: IssueRef,
    pub project_path: PathBuf,
    pub base_branch: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    machine: StateMachine<SessionStatus>,
    branch: Option<String>,
    worktree_path: Option<PathBuf>,
    pull_request: Option<PullRequestRef>,
    pub plan: Option<Plan>,
    /// Planner and implementer results, oldest first.
    pub agent_results: Vec<AgentResult>,
    pub retries: HashMap<SignalKind, RetryCounter>,
    pub escalation_reasons: Vec<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    activity: ActivityStamp,
}

impl Session {
    pub fn new(id: impl Into<String>, issue: IssueRef, project_path: impl Into<PathBuf>) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            machine: StateMachine::new(SessionStatus::Accepted, format!("session {}", id)),
            id,
            issue,
            project_path: project_path.into(),
            base_branch: "main".to_string(),
            model: None,
            provider: None,
            branch: None,
            worktree_path: None,
            pull_request: None,
            plan: None,
            agent_results: Vec::new(),
            retries: HashMap::new(),
            escalation_reasons: Vec::new(),
            last_error: None,
            created_at: now,
            activity: ActivityStamp::new(now),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.machine.current()
    }

    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    pub fn can_transition(&self, to: SessionStatus) -> bool {
        self.machine.can_transition(to)
    }

    /// Attempts a transition; a rejection is logged and leaves the state as is.
    pub fn advance(&mut self, to: SessionStatus) -> bool {
        let moved = self.machine.try_transition(to);
        if moved {
            self.touch();
        }
        moved
    }

    pub fn touch(&mut self) {
        self.activity.touch();
    }

    /// Handle agents use to report activity while they run.
    pub fn activity(&self) -> ActivityStamp {
        self.activity.clone()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.activity.get()
    }

    /// Time since the session last changed or one of its agents took a step.
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.updated_at()
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn worktree_path(&self) -> Option<&PathBuf> {
        self.worktree_path.as_ref()
    }

    pub fn pull_request(&self) -> Option<&PullRequestRef> {
        self.pull_request.as_ref()
    }

    /// Sets branch and worktree once; later calls are ignored.
    pub fn set_workspace(&mut self, branch: impl Into<String>, worktree: impl Into<PathBuf>) -> bool {
        if self.branch.is_some() {
            return false;
        }
        self.branch = Some(branch.into());
        self.worktree_path = Some(worktree.into());
        self.touch();
        true
    }

    /// Sets the pull request once; later calls are ignored.
    pub fn set_pull_request(&mut self, pull_request: PullRequestRef) -> bool {
        if self.pull_request.is_some() {
            return false;
        }
        self.pull_request = Some(pull_request);
        self.touch();
        true
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            session_id: self.id.clone(),
            status: self.status(),
            issue: self.issue.clone(),
            project_path: self.project_path.clone(),
            base_branch: self.base_branch.clone(),
            model: self.model.clone(),
            provider: self.provider.clone(),
            branch: self.branch.clone(),
            worktree_path: self.worktree_path.clone(),
            pr_number: self.pull_request.as_ref().map(|pr| pr.number),
            pr_url: self.pull_request.as_ref().map(|pr| pr.url.clone()),
            plan: self.plan.clone(),
            retries: self
                .retries
                .iter()
                .map(|(signal, counter)| (signal.as_str().to_string(), counter.attempts))
                .collect(),
            escalation_reasons: self.escalation_reasons.clone(),
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at(),
        }
    }
}

/// Serializable snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: String,
    pub status: SessionStatus,
    pub issue: IssueRef,
    pub project_path: PathBuf,
    pub base_branch: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub branch: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    pub plan: Option<Plan>,
    pub retries: std::collections::BTreeMap<String, u32>,
    pub escalation_reasons: Vec<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SessionStatus; 10] = [
        SessionStatus::Accepted,
        SessionStatus::Planning,
        SessionStatus::Implementing,
        SessionStatus::PrCreated,
        SessionStatus::CiRunning,
        SessionStatus::ReviewRequested,
        SessionStatus::Merged,
        SessionStatus::Failed,
        SessionStatus::Escalated,
        SessionStatus::Cancelled,
    ];

    #[test]
    fn test_escalation_reachable_from_every_active_state() {
        for state in ALL.iter().filter(|s| s.is_active()) {
            assert!(state.targets().contains(&SessionStatus::Escalated), "{}", state);
        }
    }

    #[test]
    fn test_terminal_states() {
        for state in [
            SessionStatus::Merged,
            SessionStatus::Failed,
            SessionStatus::Escalated,
            SessionStatus::Cancelled,
        ] {
            let machine = StateMachine::new(state, "t");
            assert!(ALL.iter().all(|to| !machine.can_transition(*to)));
        }
    }

    #[test]
    fn test_issue_source_precedence() {
        let request = StartSessionRequest::new("/repo")
            .for_issue(7)
            .with_inline_issue("t", "b")
            .with_prompt("p");
        assert_eq!(request.issue_source().unwrap(), IssueSource::Tracker(7));

        let request = StartSessionRequest::new("/repo")
            .with_inline_issue("Fix login", "details")
            .with_prompt("p");
        assert_eq!(
            request.issue_source().unwrap(),
            IssueSource::Inline {
                title: "Fix login".to_string(),
                body: "details".to_string()
            }
        );

        let request = StartSessionRequest::new("/repo").with_prompt("  add dark mode  ");
        assert_eq!(
            request.issue_source().unwrap(),
            IssueSource::Prompt("add dark mode".to_string())
        );

        assert!(StartSessionRequest::new("/repo").issue_source().is_err());
    }

    #[test]
    fn test_prompt_title_is_truncated() {
        let long = "x".repeat(100);
        let issue = IssueSource::Prompt(long).synthetic_ref().unwrap();
        assert!(issue.synthetic);
        assert_eq!(issue.title.chars().count(), 72);
        assert!(issue.title.ends_with("..."));
    }

    #[test]
    fn test_write_once_fields() {
        let issue = IssueSource::Prompt("p".into()).synthetic_ref().unwrap();
        let mut session = Session::new("s1", issue, "/repo");
        assert!(session.set_workspace("conductor/a", "/repo/.worktrees/a"));
        assert!(!session.set_workspace("conductor/b", "/elsewhere"));
        assert_eq!(session.branch(), Some("conductor/a"));

        let pr = PullRequestRef {
            number: 1,
            url: "u1".to_string(),
        };
        assert!(session.set_pull_request(pr.clone()));
        assert!(!session.set_pull_request(PullRequestRef {
            number: 2,
            url: "u2".to_string()
        }));
        assert_eq!(session.pull_request(), Some(&pr));
        assert_eq!(session.view().pr_number, Some(1));
    }

    #[test]
    fn test_activity_stamp_is_shared_with_clones() {
        let issue = IssueSource::Prompt("p".into()).synthetic_ref().unwrap();
        let session = Session::new("s1", issue, "/repo");
        let later = session.created_at + chrono::Duration::minutes(5);
        assert!(session.idle_for(later) >= chrono::Duration::minutes(4));

        let stamp = session.activity();
        std::thread::sleep(std::time::Duration::from_millis(5));
        stamp.touch();
        assert!(session.updated_at() > session.created_at);
        assert_eq!(session.clone().updated_at(), session.updated_at());
    }

    #[test]
    fn test_review_cannot_go_back_to_ci_directly() {
        let issue = IssueSource::Prompt("p".into()).synthetic_ref().unwrap();
        let mut session = Session::new("s1", issue, "/repo");
        for step in [
            SessionStatus::Planning,
            SessionStatus::Implementing,
            SessionStatus::PrCreated,
            SessionStatus::CiRunning,
            SessionStatus::ReviewRequested,
        ] {
            assert!(session.advance(step));
        }
        assert!(!session.advance(SessionStatus::CiRunning));
        assert!(session.advance(SessionStatus::Implementing));
    }
}
