//! Reaction table and engine: what a session does when an external signal
//! arrives.
//!
//! The table maps each [`SignalKind`] to a [`ReactionRule`]. The engine turns a
//! rule plus the session's retry counter into a [`Reaction`], which the
//! session manager interprets. A YAML file can override rules per signal:
//!
//! ```yaml
//! reactions:
//!   ci_failed:
//!     action: respawn_agent
//!     max_retries: 2
//!     escalate_after_minutes: 90
//!     prompt_template: |
//!       CI failed on {{ branch }}: {{ feedback }}
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::SessionError;
use super::types::RetryCounter;

/// External terminal signals a session reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    CiFailed,
    CiPassed,
    ChangesRequested,
    Approved,
    Stuck,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::CiFailed => "ci_failed",
            SignalKind::CiPassed => "ci_passed",
            SignalKind::ChangesRequested => "changes_requested",
            SignalKind::Approved => "approved",
            SignalKind::Stuck => "stuck",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ci_failed" => Ok(SignalKind::CiFailed),
            "ci_passed" => Ok(SignalKind::CiPassed),
            "changes_requested" => Ok(SignalKind::ChangesRequested),
            "approved" => Ok(SignalKind::Approved),
            "stuck" => Ok(SignalKind::Stuck),
            other => Err(SessionError::InvalidRequest(format!("unknown signal '{}'", other))),
        }
    }
}

/// Configured action for a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    RespawnAgent,
    Notify,
    Escalate,
    AutoMerge,
}

impl ReactionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ReactionAction::RespawnAgent => "respawn_agent",
            ReactionAction::Notify => "notify",
            ReactionAction::Escalate => "escalate",
            ReactionAction::AutoMerge => "auto_merge",
        }
    }

    /// Actions that push to or merge the session's pull request, and so
    /// only apply once it exists and CI has been involved.
    pub fn acts_on_pull_request(self) -> bool {
        matches!(self, ReactionAction::RespawnAgent | ReactionAction::AutoMerge)
    }
}

fn default_max_retries() -> u32 {
    3
}

/// How a session reacts to one signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRule {
    pub action: ReactionAction,
    /// Tera template rendered into the respawn prompt, notification or
    /// escalation reason.
    #[serde(default)]
    pub prompt_template: String,
    /// Respawns allowed before the engine escalates instead.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Escalate once the signal keeps recurring this long after it was first seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_after_minutes: Option<u64>,
}

impl ReactionRule {
    pub fn new(action: ReactionAction) -> Self {
        Self {
            action,
            prompt_template: String::new(),
            max_retries: default_max_retries(),
            escalate_after_minutes: None,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_escalate_after_minutes(mut self, minutes: u64) -> Self {
        self.escalate_after_minutes = Some(minutes);
        self
    }

    fn validate(&self, signal: SignalKind) -> Result<(), SessionError> {
        if self.action == ReactionAction::RespawnAgent && self.max_retries == 0 {
            return Err(SessionError::ReactionConfig(format!(
                "{}: respawn_agent needs max_retries of at least 1",
                signal
            )));
        }
        Ok(())
    }
}

const CI_FAILED_TEMPLATE: &str = "\
CI failed on branch {{ branch }} (attempt {{ attempt }} of {{ max_retries }}).
{% if feedback %}
Failure output:
{{ feedback }}
{% endif %}
Fix the failures without dropping the work done for: {{ issue_title }}";

const CHANGES_REQUESTED_TEMPLATE: &str = "\
A reviewer requested changes on {{ pr_url }} (attempt {{ attempt }} of {{ max_retries }}).
{% if feedback %}
Review comments:
{{ feedback }}
{% endif %}
Address every comment, then stop.";

const CI_PASSED_TEMPLATE: &str = "CI passed for {{ pr_url }}. Ready for review.";

const STUCK_TEMPLATE: &str = "Session made no progress on \"{{ issue_title }}\" and needs a human.";

#[derive(Debug, Deserialize)]
struct ReactionFile {
    #[serde(default)]
    reactions: HashMap<SignalKind, ReactionRule>,
}

/// Signal → rule table.
#[derive(Debug, Clone)]
pub struct ReactionTable {
    rules: HashMap<SignalKind, ReactionRule>,
}

impl Default for ReactionTable {
    fn default() -> Self {
        let mut rules = HashMap::new();
        rules.insert(
            SignalKind::CiFailed,
            ReactionRule::new(ReactionAction::RespawnAgent)
                .with_template(CI_FAILED_TEMPLATE)
                .with_escalate_after_minutes(120),
        );
        rules.insert(
            SignalKind::ChangesRequested,
            ReactionRule::new(ReactionAction::RespawnAgent).with_template(CHANGES_REQUESTED_TEMPLATE),
        );
        rules.insert(
            SignalKind::CiPassed,
            ReactionRule::new(ReactionAction::Notify).with_template(CI_PASSED_TEMPLATE),
        );
        rules.insert(
            SignalKind::Approved,
            ReactionRule::new(ReactionAction::AutoMerge),
        );
        rules.insert(
            SignalKind::Stuck,
            ReactionRule::new(ReactionAction::Escalate).with_template(STUCK_TEMPLATE),
        );
        Self { rules }
    }
}

impl ReactionTable {
    /// Table with no rules; every signal is ignored.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    pub fn get(&self, signal: SignalKind) -> Option<&ReactionRule> {
        self.rules.get(&signal)
    }

    pub fn insert(&mut self, signal: SignalKind, rule: ReactionRule) {
        self.rules.insert(signal, rule);
    }

    pub fn with_rule(mut self, signal: SignalKind, rule: ReactionRule) -> Self {
        self.insert(signal, rule);
        self
    }

    /// Overlays rules from YAML. Unknown signals or actions fail the load.
    pub fn merge_yaml(&mut self, yaml: &str) -> Result<usize, SessionError> {
        let file: ReactionFile = serde_yaml::from_str(yaml)?;
        for (signal, rule) in &file.reactions {
            rule.validate(*signal)?;
        }
        let count = file.reactions.len();
        self.rules.extend(file.reactions);
        Ok(count)
    }

    /// Default table overlaid with the YAML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let yaml = std::fs::read_to_string(path)?;
        let mut table = Self::default();
        table.merge_yaml(&yaml)?;
        Ok(table)
    }
}

/// A decided reaction, interpreted by the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    /// Re-enter `implementing` with the rendered feedback prompt.
    Respawn { attempt: u32 },
    /// Post the rendered message on the tracker issue.
    Notify,
    /// Move to `escalated`.
    Escalate { reason: String },
    /// Merge the pull request.
    AutoMerge,
}

impl Reaction {
    pub fn action(&self) -> ReactionAction {
        match self {
            Reaction::Respawn { .. } => ReactionAction::RespawnAgent,
            Reaction::Notify => ReactionAction::Notify,
            Reaction::Escalate { .. } => ReactionAction::Escalate,
            Reaction::AutoMerge => ReactionAction::AutoMerge,
        }
    }
}

/// Values available to reaction templates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptContext {
    pub signal: String,
    pub issue_number: Option<u64>,
    pub issue_title: String,
    pub issue_body: String,
    pub branch: String,
    pub pr_url: String,
    pub attempt: u32,
    pub max_retries: u32,
    pub feedback: String,
}

/// Decides reactions from the table and a session's retry counters.
#[derive(Debug, Clone, Default)]
pub struct ReactionEngine {
    table: ReactionTable,
}

impl ReactionEngine {
    pub fn new(table: ReactionTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &ReactionTable {
        &self.table
    }

    /// Decides the reaction to `signal` and updates `counter`.
    ///
    /// A respawn increments the counter; reaching `max_retries` escalates
    /// instead, as does a signal still recurring `escalate_after_minutes`
    /// after its first occurrence. Returns `None` when no rule exists.
    pub fn decide(
        &self,
        signal: SignalKind,
        counter: &mut RetryCounter,
        now: DateTime<Utc>,
    ) -> Option<Reaction> {
        let rule = self.table.get(signal)?;
        let first_seen = *counter.first_seen.get_or_insert(now);

        let window_expired = rule
            .escalate_after_minutes
            .map(|minutes| now - first_seen >= chrono::Duration::minutes(minutes as i64))
            .unwrap_or(false);

        match rule.action {
            ReactionAction::RespawnAgent | ReactionAction::Notify if window_expired => {
                Some(Reaction::Escalate {
                    reason: format!(
                        "{} still unresolved after {} minutes",
                        signal,
                        rule.escalate_after_minutes.unwrap_or_default()
                    ),
                })
            }
            ReactionAction::RespawnAgent => {
                let next = counter.attempts + 1;
                if next >= rule.max_retries {
                    counter.attempts = rule.max_retries;
                    Some(Reaction::Escalate {
                        reason: format!("{} persisted after {} attempts", signal, next),
                    })
                } else {
                    counter.attempts = next;
                    Some(Reaction::Respawn { attempt: next })
                }
            }
            ReactionAction::Notify => Some(Reaction::Notify),
            ReactionAction::Escalate => Some(Reaction::Escalate {
                reason: format!("{} reaction", signal),
            }),
            ReactionAction::AutoMerge => Some(Reaction::AutoMerge),
        }
    }

    /// Renders the rule's template for `signal`; empty when there is none.
    pub fn render(&self, signal: SignalKind, context: &PromptContext) -> Result<String, SessionError> {
        let Some(rule) = self.table.get(signal) else {
            return Ok(String::new());
        };
        if rule.prompt_template.trim().is_empty() {
            return Ok(String::new());
        }
        let mut context = context.clone();
        context.max_retries = rule.max_retries;
        render_template(&rule.prompt_template, &context)
    }
}

/// Renders a one-off tera template.
pub fn render_template(template: &str, context: &PromptContext) -> Result<String, SessionError> {
    let context = tera::Context::from_serialize(context)
        .map_err(|e| SessionError::Template(e.to_string()))?;
    tera::Tera::one_off(template, &context, false)
        .map(|s| s.trim().to_string())
        .map_err(|e| SessionError::Template(format!("Failed to render reaction template: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_respawns_then_escalate() {
        let engine = ReactionEngine::default();
        let mut counter = RetryCounter::default();
        let now = Utc::now();

        let decisions: Vec<Reaction> = (0..3)
            .map(|_| engine.decide(SignalKind::CiFailed, &mut counter, now).unwrap())
            .collect();

        assert_eq!(decisions[0], Reaction::Respawn { attempt: 1 });
        assert_eq!(decisions[1], Reaction::Respawn { attempt: 2 });
        assert!(matches!(decisions[2], Reaction::Escalate { .. }));
        assert_eq!(counter.attempts, 3);
    }

    #[test]
    fn test_window_escalates_regardless_of_count() {
        let engine = ReactionEngine::default();
        let now = Utc::now();
        let mut counter = RetryCounter {
            attempts: 0,
            first_seen: Some(now - chrono::Duration::minutes(121)),
        };
        let reaction = engine.decide(SignalKind::CiFailed, &mut counter, now).unwrap();
        match reaction {
            Reaction::Escalate { reason } => assert!(reason.contains("120 minutes")),
            other => panic!("expected escalation, got {:?}", other),
        }
        assert_eq!(counter.attempts, 0);
    }

    #[test]
    fn test_first_seen_is_recorded_once() {
        let engine = ReactionEngine::default();
        let mut counter = RetryCounter::default();
        let first = Utc::now();
        engine.decide(SignalKind::ChangesRequested, &mut counter, first);
        engine.decide(
            SignalKind::ChangesRequested,
            &mut counter,
            first + chrono::Duration::minutes(5),
        );
        assert_eq!(counter.first_seen, Some(first));
    }

    #[test]
    fn test_default_actions() {
        let engine = ReactionEngine::default();
        let now = Utc::now();
        let mut counter = RetryCounter::default();
        assert_eq!(
            engine.decide(SignalKind::Approved, &mut counter, now),
            Some(Reaction::AutoMerge)
        );
        assert_eq!(
            engine.decide(SignalKind::CiPassed, &mut counter, now),
            Some(Reaction::Notify)
        );
        assert!(matches!(
            engine.decide(SignalKind::Stuck, &mut counter, now),
            Some(Reaction::Escalate { .. })
        ));
        let empty = ReactionEngine::new(ReactionTable::empty());
        assert_eq!(empty.decide(SignalKind::CiFailed, &mut counter, now), None);
    }

    #[test]
    fn test_yaml_overrides_and_rejects_unknown_action() {
        let mut table = ReactionTable::default();
        let count = table
            .merge_yaml(
                "reactions:\n  ci_failed:\n    action: notify\n    prompt_template: \"CI red on {{ branch }}\"\n",
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(table.get(SignalKind::CiFailed).unwrap().action, ReactionAction::Notify);

        assert!(table
            .merge_yaml("reactions:\n  ci_failed:\n    action: reboot\n")
            .is_err());
        assert!(table
            .merge_yaml("reactions:\n  deployed:\n    action: notify\n")
            .is_err());
        assert!(table
            .merge_yaml("reactions:\n  stuck:\n    action: respawn_agent\n    max_retries: 0\n")
            .is_err());
    }

    #[test]
    fn test_render_ci_failed_prompt() {
        let engine = ReactionEngine::default();
        let context = PromptContext {
            signal: "ci_failed".to_string(),
            issue_title: "Fix login".to_string(),
            branch: "conductor/issue-7".to_string(),
            attempt: 2,
            feedback: "test_login ... FAILED".to_string(),
            ..PromptContext::default()
        };
        let prompt = engine.render(SignalKind::CiFailed, &context).unwrap();
        assert!(prompt.starts_with("CI failed on branch conductor/issue-7 (attempt 2 of 3)."));
        assert!(prompt.contains("test_login ... FAILED"));
        assert!(prompt.ends_with("Fix login"));

        let without_feedback = PromptContext {
            feedback: String::new(),
            ..context
        };
        let prompt = engine.render(SignalKind::CiFailed, &without_feedback).unwrap();
        assert!(!prompt.contains("Failure output"));
    }

    #[test]
    fn test_render_without_template_is_empty() {
        let engine = ReactionEngine::default();
        let rendered = engine
            .render(SignalKind::Approved, &PromptContext::default())
            .unwrap();
        assert!(rendered.is_empty());
    }

    #[test]
    fn test_bad_template_is_an_error() {
        let err = render_template("{{ unclosed", &PromptContext::default()).unwrap_err();
        assert!(matches!(err, SessionError::Template(_)));
    }

    #[test]
    fn test_signal_from_str() {
        assert_eq!("ci_failed".parse::<SignalKind>().unwrap(), SignalKind::CiFailed);
        assert!("deployed".parse::<SignalKind>().is_err());
    }
}
