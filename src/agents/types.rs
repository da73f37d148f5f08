//! Core types for agent execution.
//!
//! An [`AgentResult`] is the contract between an agent run and everything
//! downstream. Its status comes from the agent's own report; nothing here
//! recomputes it from the findings unless the agent left it out.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::pipeline::Tier;
use crate::utils::json_extraction::extract_json_objects;

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    /// Critical and high findings fail an agent unless fixed.
    pub fn is_blocking(self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Low => write!(f, "low"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// One issue reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Whether the agent already fixed this issue in the worktree.
    #[serde(default)]
    pub fix_applied: bool,
}

impl Finding {
    pub fn new(severity: Severity, description: impl Into<String>) -> Self {
        Self {
            severity,
            description: description.into(),
            file: None,
            line: None,
            fix_applied: false,
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: Option<u32>) -> Self {
        self.file = Some(file.into());
        self.line = line;
        self
    }

    pub fn fixed(mut self) -> Self {
        self.fix_applied = true;
        self
    }
}

/// Outcome of one agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Passed,
    Failed,
    /// The run itself broke: provider failure, unknown role, open breaker.
    Error,
    /// The turn budget ran out before the agent reported.
    Timeout,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Passed => "passed",
            AgentStatus::Failed => "failed",
            AgentStatus::Error => "error",
            AgentStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource accounting for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub duration_ms: u64,
    pub turns_used: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    pub provider: String,
}

/// Immutable result of one agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent: String,
    pub status: AgentStatus,
    pub summary: String,
    pub findings: Vec<Finding>,
    pub fixes_applied: usize,
    pub metadata: ExecutionMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResult {
    /// Result built from an agent's report.
    pub fn from_report(
        agent: impl Into<String>,
        report: AgentReport,
        metadata: ExecutionMetadata,
    ) -> Self {
        let status = report.resolved_status();
        let fixes_applied = report.findings.iter().filter(|f| f.fix_applied).count();
        Self {
            agent: agent.into(),
            status,
            summary: report.summary,
            findings: report.findings,
            fixes_applied,
            metadata,
            error: None,
        }
    }

    /// Result for a run that broke before the agent could report.
    pub fn error(
        agent: impl Into<String>,
        message: impl Into<String>,
        metadata: ExecutionMetadata,
    ) -> Self {
        let message = message.into();
        Self {
            agent: agent.into(),
            status: AgentStatus::Error,
            summary: String::new(),
            findings: Vec::new(),
            fixes_applied: 0,
            metadata,
            error: Some(message),
        }
    }

    /// Result for a run whose turn budget ran out.
    pub fn timeout(agent: impl Into<String>, max_turns: usize, metadata: ExecutionMetadata) -> Self {
        Self {
            agent: agent.into(),
            status: AgentStatus::Timeout,
            summary: String::new(),
            findings: Vec::new(),
            fixes_applied: 0,
            metadata,
            error: Some(format!("turn budget of {} exhausted", max_turns)),
        }
    }

    /// Whether this result fails the pipeline it belongs to.
    pub fn is_failing(&self) -> bool {
        matches!(self.status, AgentStatus::Failed | AgentStatus::Error)
    }

    /// Findings the agent reported as fixed.
    pub fn applied_fixes(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.fix_applied)
    }
}

/// Final report an agent emits as JSON: `{status?, summary, findings[]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AgentStatus>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl AgentReport {
    /// The agent's own status, or `failed` when it omitted one and some
    /// critical or high finding is still unfixed.
    pub fn resolved_status(&self) -> AgentStatus {
        if let Some(status) = self.status {
            return status;
        }
        let blocking = self
            .findings
            .iter()
            .any(|f| f.severity.is_blocking() && !f.fix_applied);
        if blocking {
            AgentStatus::Failed
        } else {
            AgentStatus::Passed
        }
    }

    /// Finds the report in model output: the last JSON object carrying a
    /// `summary` or `findings` key and no `tool` key.
    pub fn parse(text: &str) -> Option<Self> {
        extract_json_objects(text)
            .into_iter()
            .rev()
            .filter(|v| v.get("tool").is_none())
            .filter(|v| v.get("summary").is_some() || v.get("findings").is_some())
            .find_map(|v| serde_json::from_value::<AgentReport>(v).ok())
    }
}

/// Diff statistics of a worktree against its base branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
    pub changed_files: Vec<String>,
}

impl DiffStats {
    pub fn lines_changed(&self) -> usize {
        self.insertions + self.deletions
    }
}

/// Input for one agent run.
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Correlation id the run's events are published under.
    pub correlation_id: String,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    /// Task statement given to the agent as its first user message.
    pub task: String,
    pub diff_stats: Option<DiffStats>,
    pub tier: Option<Tier>,
    /// Results of earlier runs this one builds on, oldest first.
    pub prior_results: Vec<AgentResult>,
}

impl AgentContext {
    pub fn new(
        correlation_id: impl Into<String>,
        worktree_path: impl Into<PathBuf>,
        task: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            worktree_path: worktree_path.into(),
            branch: String::new(),
            base_branch: "main".to_string(),
            task: task.into(),
            diff_stats: None,
            tier: None,
            prior_results: Vec::new(),
        }
    }

    pub fn with_branches(mut self, branch: impl Into<String>, base: impl Into<String>) -> Self {
        self.branch = branch.into();
        self.base_branch = base.into();
        self
    }

    pub fn with_diff_stats(mut self, stats: DiffStats) -> Self {
        self.diff_stats = Some(stats);
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_prior_results(mut self, results: impl IntoIterator<Item = AgentResult>) -> Self {
        self.prior_results.extend(results);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_status_is_not_recomputed() {
        let report = AgentReport {
            status: Some(AgentStatus::Passed),
            summary: "fine".to_string(),
            findings: vec![Finding::new(Severity::Critical, "sql injection")],
        };
        assert_eq!(report.resolved_status(), AgentStatus::Passed);
    }

    #[test]
    fn test_fallback_status_rule() {
        let mut report = AgentReport {
            status: None,
            summary: String::new(),
            findings: vec![
                Finding::new(Severity::High, "unchecked input").fixed(),
                Finding::new(Severity::Low, "naming"),
            ],
        };
        assert_eq!(report.resolved_status(), AgentStatus::Passed);

        report.findings.push(Finding::new(Severity::Critical, "leaked key"));
        assert_eq!(report.resolved_status(), AgentStatus::Failed);
    }

    #[test]
    fn test_parse_report_skips_tool_calls() {
        let text = r#"
            {"tool": "read_file", "arguments": {"path": "src/lib.rs"}}
            Final answer:
            {"status": "failed", "summary": "one issue",
             "findings": [{"severity": "high", "description": "panic on empty input",
                           "file": "src/lib.rs", "line": 12}]}
        "#;
        let report = AgentReport::parse(text).unwrap();
        assert_eq!(report.status, Some(AgentStatus::Failed));
        assert_eq!(report.findings[0].file.as_deref(), Some("src/lib.rs"));
        assert_eq!(report.findings[0].line, Some(12));
        assert!(!report.findings[0].fix_applied);

        assert!(AgentReport::parse(r#"{"tool": "list_files"}"#).is_none());
    }

    #[test]
    fn test_result_from_report_counts_fixes() {
        let report = AgentReport {
            status: None,
            summary: "tidied".to_string(),
            findings: vec![
                Finding::new(Severity::Medium, "unused import").at("a.rs", Some(1)).fixed(),
                Finding::new(Severity::Low, "long line"),
            ],
        };
        let result = AgentResult::from_report("style", report, ExecutionMetadata::default());
        assert_eq!(result.fixes_applied, 1);
        assert_eq!(result.applied_fixes().count(), 1);
        assert!(!result.is_failing());
    }

    #[test]
    fn test_error_and_timeout_are_distinct() {
        let err = AgentResult::error("docs", "boom", ExecutionMetadata::default());
        let timeout = AgentResult::timeout("docs", 5, ExecutionMetadata::default());
        assert_eq!(err.status, AgentStatus::Error);
        assert_eq!(timeout.status, AgentStatus::Timeout);
        assert!(err.is_failing());
        assert!(!timeout.is_failing());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_value(AgentStatus::Timeout).unwrap(), "timeout");
        let finding: Finding =
            serde_json::from_str(r#"{"severity": "critical", "description": "x"}"#).unwrap();
        assert_eq!(finding.severity, Severity::Critical);
    }
}
