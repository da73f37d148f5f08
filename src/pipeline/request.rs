//! Pipeline requests and their lifecycle states.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::tier::Tier;
use crate::state_machine::Transitions;

/// Lifecycle of one pipeline request.
///
/// `accepted → running → {approved, failed, error}`; `accepted` may also go
/// straight to `failed` or `error` when the run is aborted before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Accepted,
    Running,
    Approved,
    Failed,
    Error,
}

impl Transitions for PipelineStatus {
    fn targets(self) -> &'static [Self] {
        use PipelineStatus::*;
        match self {
            Accepted => &[Running, Failed, Error],
            Running => &[Approved, Failed, Error],
            Approved | Failed | Error => &[],
        }
    }
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Accepted => "accepted",
            PipelineStatus::Running => "running",
            PipelineStatus::Approved => "approved",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Error => "error",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller overrides for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOverrides {
    /// Forced tier; skips classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    /// Explicit agent list; beats the tier default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents: Option<Vec<String>>,
}

/// A request to run the quality pipeline over one branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    /// Correlation key of every event the run publishes.
    pub request_id: String,
    pub branch: String,
    pub base_branch: String,
    pub worktree_path: PathBuf,
    /// Opaque caller data echoed into the `accepted` event.
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub overrides: RunOverrides,
}

impl PipelineRequest {
    /// New request with a generated id against `main`.
    pub fn new(branch: impl Into<String>, worktree_path: impl Into<PathBuf>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            branch: branch.into(),
            base_branch: "main".to_string(),
            worktree_path: worktree_path.into(),
            metadata: Value::Null,
            overrides: RunOverrides::default(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_base_branch(mut self, base_branch: impl Into<String>) -> Self {
        self.base_branch = base_branch.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.overrides.tier = Some(tier);
        self
    }

    pub fn with_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.overrides.agents = Some(agents.into_iter().map(Into::into).collect());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::StateMachine;

    const ALL: [PipelineStatus; 5] = [
        PipelineStatus::Accepted,
        PipelineStatus::Running,
        PipelineStatus::Approved,
        PipelineStatus::Failed,
        PipelineStatus::Error,
    ];

    #[test]
    fn test_can_transition_matches_transition() {
        for from in ALL {
            for to in ALL {
                let mut machine = StateMachine::new(from, "test");
                let allowed = machine.can_transition(to);
                assert_eq!(machine.transition(to).is_ok(), allowed, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        for state in [PipelineStatus::Approved, PipelineStatus::Failed, PipelineStatus::Error] {
            let machine = StateMachine::new(state, "test");
            assert!(machine.is_terminal());
            assert!(ALL.iter().all(|to| !machine.can_transition(*to)));
        }
    }

    #[test]
    fn test_no_way_back_to_running() {
        let mut machine = StateMachine::new(PipelineStatus::Accepted, "req");
        assert!(machine.try_transition(PipelineStatus::Running));
        assert!(!machine.try_transition(PipelineStatus::Accepted));
        assert!(!machine.try_transition(PipelineStatus::Running));
        assert_eq!(machine.current(), PipelineStatus::Running);
    }

    #[test]
    fn test_request_builder() {
        let request = PipelineRequest::new("feature/x", "/tmp/wt")
            .with_request_id("req-1")
            .with_base_branch("develop")
            .with_tier(Tier::Large)
            .with_agents(["security"]);
        assert_eq!(request.request_id, "req-1");
        assert_eq!(request.base_branch, "develop");
        assert_eq!(request.overrides.tier, Some(Tier::Large));
        assert_eq!(request.overrides.agents, Some(vec!["security".to_string()]));

        let generated = PipelineRequest::new("b", "/tmp");
        assert_eq!(generated.request_id.len(), 36);
    }
}
