//! End-to-end tests of the session manager against mock collaborators.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use swe_conductor::agents::{AgentExecutor, RoleRegistry};
use swe_conductor::collaborators::{GitOperations, IssueDetail, IssueTracker, PullRequestRef};
use swe_conductor::events::{EventBus, EventType, JsonlEventStore};
use swe_conductor::llm::{
    Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, ModelResolution,
    ProviderRegistry, Usage,
};
use swe_conductor::session::{
    Reaction, SessionConfig, SessionError, SessionManager, SessionStatus, SignalKind,
    StartSessionRequest,
};
use swe_conductor::{CollaboratorError, LlmError};

/// Always reports success and records every request it sees.
#[derive(Default)]
struct MockLlmProvider {
    requests: Mutex<Vec<GenerationRequest>>,
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let model = request.model.clone();
        self.requests.lock().unwrap().push(request);
        Ok(GenerationResponse {
            id: "mock".to_string(),
            model,
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(
                    r#"{"status": "passed", "summary": "done", "findings": []}"#,
                ),
                finish_reason: "stop".to_string(),
            }],
            usage: Usage::default(),
        })
    }
}

#[derive(Default)]
struct MockGit {
    pushes: AtomicUsize,
}

#[async_trait]
impl GitOperations for MockGit {
    async fn create_worktree(&self, project: &Path, branch: &str, _: &str) -> Result<PathBuf, CollaboratorError> {
        Ok(project.join(".worktrees").join(branch.replace('/', "-")))
    }

    async fn commit_and_push(&self, _: &Path, _: &str, _: &str) -> Result<(), CollaboratorError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_pull_request(
        &self,
        _: &Path,
        _: &str,
        _: &str,
        _: &str,
        _: &str,
    ) -> Result<PullRequestRef, CollaboratorError> {
        Ok(PullRequestRef {
            number: 99,
            url: "https://github.com/acme/app/pull/99".to_string(),
        })
    }

    async fn merge_pull_request(&self, _: &Path, _: u64) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[derive(Default)]
struct MockTracker {
    comments: Mutex<Vec<(u64, String)>>,
}

#[async_trait]
impl IssueTracker for MockTracker {
    async fn fetch_issue_detail(&self, number: u64) -> Result<IssueDetail, CollaboratorError> {
        if number == 404 {
            return Err(CollaboratorError::IssueNotFound(number));
        }
        Ok(IssueDetail {
            number,
            title: "Login fails with empty password".to_string(),
            body: "Steps to reproduce...".to_string(),
            labels: vec!["bug".to_string()],
        })
    }

    async fn add_comment(&self, number: u64, body: &str) -> Result<(), CollaboratorError> {
        self.comments.lock().unwrap().push((number, body.to_string()));
        Ok(())
    }
}

struct Harness {
    manager: Arc<SessionManager>,
    llm: Arc<MockLlmProvider>,
    git: Arc<MockGit>,
    tracker: Arc<MockTracker>,
}

fn harness(config: SessionConfig) -> Harness {
    harness_with_bus(config, Arc::new(EventBus::in_memory()))
}

fn harness_with_bus(config: SessionConfig, bus: Arc<EventBus>) -> Harness {
    let llm = Arc::new(MockLlmProvider::default());
    let git = Arc::new(MockGit::default());
    let tracker = Arc::new(MockTracker::default());
    let executor = AgentExecutor::new(
        ProviderRegistry::single("mock", Arc::clone(&llm) as Arc<dyn LlmProvider>),
        ModelResolution::new("mock", "m"),
    );
    let manager = SessionManager::new(
        config,
        executor,
        Arc::new(RoleRegistry::with_defaults()),
        Arc::clone(&git) as Arc<dyn GitOperations>,
        bus,
    )
    .unwrap()
    .with_tracker(Arc::clone(&tracker) as Arc<dyn IssueTracker>);
    Harness {
        manager: Arc::new(manager),
        llm,
        git,
        tracker,
    }
}

async fn wait_for_status(manager: &SessionManager, id: &str, status: SessionStatus) {
    for _ in 0..200 {
        if manager.get(id).map(|v| v.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {} never reached {}", id, status);
}

#[tokio::test]
async fn test_ci_failures_respawn_twice_then_escalate() {
    let h = harness(SessionConfig::default());
    let view = h
        .manager
        .start(StartSessionRequest::new("/repos/app").for_issue(42))
        .await
        .unwrap();
    let id = view.session_id;
    wait_for_status(&h.manager, &id, SessionStatus::CiRunning).await;

    let first = h
        .manager
        .handle_signal(&id, SignalKind::CiFailed, Some("test_login ... FAILED".to_string()))
        .await
        .unwrap();
    assert_eq!(first, Some(Reaction::Respawn { attempt: 1 }));
    assert_eq!(h.manager.get(&id).unwrap().status, SessionStatus::CiRunning);

    // The respawned implementer sees the CI output.
    let prompts: Vec<String> = h
        .llm
        .requests
        .lock()
        .unwrap()
        .last()
        .unwrap()
        .messages
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert!(prompts.iter().any(|p| p.contains("test_login ... FAILED")));
    assert!(prompts.iter().any(|p| p.contains("attempt 1 of 3")));

    let second = h
        .manager
        .handle_signal(&id, SignalKind::CiFailed, None)
        .await
        .unwrap();
    assert_eq!(second, Some(Reaction::Respawn { attempt: 2 }));

    let third = h
        .manager
        .handle_signal(&id, SignalKind::CiFailed, None)
        .await
        .unwrap();
    assert!(matches!(third, Some(Reaction::Escalate { .. })));

    let view = h.manager.get(&id).unwrap();
    assert_eq!(view.status, SessionStatus::Escalated);
    assert_eq!(view.retries.get("ci_failed"), Some(&3));
    assert_eq!(h.git.pushes.load(Ordering::SeqCst), 3);

    let events = h.manager.bus().get_events(&id).await.unwrap();
    let triggered = events
        .iter()
        .filter(|e| e.event_type == EventType::ReactionTriggered)
        .count();
    assert_eq!(triggered, 3);
    assert_eq!(events.last().unwrap().event_type, EventType::ReactionEscalated);

    let comments = h.tracker.comments.lock().unwrap();
    assert!(comments.iter().any(|(n, body)| *n == 42 && body.contains("Escalated")));
}

#[tokio::test]
async fn test_duplicate_issue_is_rejected_while_fresh() {
    let h = harness(SessionConfig::default());
    let first = h
        .manager
        .admit(StartSessionRequest::new("/repos/app").for_issue(7))
        .await
        .unwrap();

    let err = h
        .manager
        .admit(StartSessionRequest::new("/repos/app").for_issue(7))
        .await
        .unwrap_err();
    match err {
        SessionError::Conflict { issue, existing_id } => {
            assert_eq!(issue, 7);
            assert_eq!(existing_id, first.session_id);
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    // Synthetic issues never conflict with each other.
    h.manager
        .admit(StartSessionRequest::new("/repos/app").with_prompt("add dark mode"))
        .await
        .unwrap();
    h.manager
        .admit(StartSessionRequest::new("/repos/app").with_prompt("add dark mode"))
        .await
        .unwrap();
    assert_eq!(h.manager.active_count(), 3);
}

#[tokio::test]
async fn test_stale_session_is_superseded() {
    let h = harness(SessionConfig::default().with_stale_after(Duration::ZERO));
    let old = h
        .manager
        .admit(StartSessionRequest::new("/repos/app").for_issue(7))
        .await
        .unwrap();
    let new = h
        .manager
        .admit(StartSessionRequest::new("/repos/app").for_issue(7))
        .await
        .unwrap();

    assert_ne!(old.session_id, new.session_id);
    assert_eq!(
        h.manager.get(&old.session_id).unwrap().status,
        SessionStatus::Cancelled
    );
    let events = h.manager.bus().get_events(&old.session_id).await.unwrap();
    let cancelled = events.last().unwrap();
    assert_eq!(cancelled.event_type, EventType::SessionCancelled);
    assert_eq!(cancelled.data["superseded_by"], new.session_id.as_str());
    assert_eq!(h.manager.list().len(), 2);
}

#[tokio::test]
async fn test_missing_issue_is_reported() {
    let h = harness(SessionConfig::default());
    let err = h
        .manager
        .admit(StartSessionRequest::new("/repos/app").for_issue(404))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Collaborator(CollaboratorError::IssueNotFound(404))
    ));
    assert!(h.manager.list().is_empty());
}

#[tokio::test]
async fn test_session_model_override_reaches_provider() {
    let h = harness(SessionConfig::default());
    let view = h
        .manager
        .admit(
            StartSessionRequest::new("/repos/app")
                .with_inline_issue("Fix typo", "README says teh")
                .with_model("mock", "big-model"),
        )
        .await
        .unwrap();
    let status = h.manager.run_pipeline(&view.session_id).await.unwrap();
    assert_eq!(status, SessionStatus::CiRunning);

    let requests = h.llm.requests.lock().unwrap();
    assert!(!requests.is_empty());
    assert!(requests.iter().all(|r| r.model == "big-model"));
}

#[tokio::test]
async fn test_finished_sessions_release_their_event_logs() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonlEventStore::new(dir.path()));
    let h = harness_with_bus(
        SessionConfig::default(),
        Arc::new(EventBus::new(store.clone())),
    );

    let merged = h
        .manager
        .admit(StartSessionRequest::new("/repos/app").for_issue(21))
        .await
        .unwrap()
        .session_id;
    h.manager.run_pipeline(&merged).await.unwrap();
    assert!(store.open_handles().await > 0);
    h.manager
        .handle_signal(&merged, SignalKind::CiPassed, None)
        .await
        .unwrap();
    h.manager
        .handle_signal(&merged, SignalKind::Approved, None)
        .await
        .unwrap();
    assert_eq!(h.manager.get(&merged).unwrap().status, SessionStatus::Merged);

    let cancelled = h
        .manager
        .admit(StartSessionRequest::new("/repos/app").for_issue(22))
        .await
        .unwrap()
        .session_id;
    h.manager.cancel(&cancelled, None).await.unwrap();

    let escalated = h
        .manager
        .admit(StartSessionRequest::new("/repos/app").for_issue(23))
        .await
        .unwrap()
        .session_id;
    h.manager.escalate(&escalated, Some("needs a human".to_string())).await.unwrap();
    h.manager.escalate(&escalated, Some("still blocked".to_string())).await.unwrap();

    assert_eq!(store.open_handles().await, 0);

    let replay = EventBus::new(Arc::new(JsonlEventStore::new(dir.path())));
    let events = replay.get_events(&merged).await.unwrap();
    assert_eq!(events.last().unwrap().event_type, EventType::SessionCompleted);
    let events = replay.get_events(&escalated).await.unwrap();
    let escalations = events
        .iter()
        .filter(|e| e.event_type == EventType::ReactionEscalated)
        .count();
    assert_eq!(escalations, 2);
}
