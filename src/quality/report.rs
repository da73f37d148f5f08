//! Aggregation of agent results into one quality report.

use serde::{Deserialize, Serialize};

use crate::agents::{AgentResult, AgentStatus, Finding};

/// A finding an agent reports as already fixed in the worktree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedCorrection {
    pub agent: String,
    pub finding: Finding,
}

/// Outcome of one quality-pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// `failed` if any agent failed or errored, `passed` otherwise.
    pub overall_status: AgentStatus,
    /// One result per requested agent, in request order.
    pub agent_results: Vec<AgentResult>,
    pub corrections_applied: Vec<AppliedCorrection>,
    pub duration_ms: u64,
}

impl QualityReport {
    pub fn passed(&self) -> bool {
        self.overall_status == AgentStatus::Passed
    }

    /// Agents whose result failed the run.
    pub fn failing_agents(&self) -> Vec<&str> {
        self.agent_results
            .iter()
            .filter(|r| r.is_failing())
            .map(|r| r.agent.as_str())
            .collect()
    }

    pub fn total_findings(&self) -> usize {
        self.agent_results.iter().map(|r| r.findings.len()).sum()
    }
}

/// Combines settled agent results.
///
/// Timeouts do not fail the run on their own. Corrections are the union of
/// every finding marked `fix_applied`, whatever the reporting agent's status.
pub fn aggregate(agent_results: Vec<AgentResult>, duration_ms: u64) -> QualityReport {
    let overall_status = if agent_results.iter().any(AgentResult::is_failing) {
        AgentStatus::Failed
    } else {
        AgentStatus::Passed
    };

    let corrections_applied = agent_results
        .iter()
        .flat_map(|result| {
            result.applied_fixes().map(move |finding| AppliedCorrection {
                agent: result.agent.clone(),
                finding: finding.clone(),
            })
        })
        .collect();

    QualityReport {
        overall_status,
        agent_results,
        corrections_applied,
        duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentReport, ExecutionMetadata, Severity};

    fn result(agent: &str, status: AgentStatus, findings: Vec<Finding>) -> AgentResult {
        AgentResult::from_report(
            agent,
            AgentReport {
                status: Some(status),
                summary: String::new(),
                findings,
            },
            ExecutionMetadata::default(),
        )
    }

    #[test]
    fn test_one_failure_fails_the_run_and_keeps_only_fixed_findings() {
        let a = result(
            "tests",
            AgentStatus::Passed,
            vec![Finding::new(Severity::Low, "missing edge case").fixed()],
        );
        let b = result(
            "security",
            AgentStatus::Failed,
            vec![Finding::new(Severity::Critical, "sql injection")],
        );
        let c = result("style", AgentStatus::Passed, vec![]);

        let report = aggregate(vec![a, b, c], 10);

        assert_eq!(report.overall_status, AgentStatus::Failed);
        assert_eq!(report.failing_agents(), vec!["security"]);
        assert_eq!(report.corrections_applied.len(), 1);
        assert_eq!(report.corrections_applied[0].agent, "tests");
        assert_eq!(report.total_findings(), 2);
    }

    #[test]
    fn test_failed_agent_fixes_still_count() {
        let b = result(
            "security",
            AgentStatus::Failed,
            vec![
                Finding::new(Severity::High, "weak hash").fixed(),
                Finding::new(Severity::Critical, "open redirect"),
            ],
        );
        let report = aggregate(vec![b], 0);
        assert_eq!(report.corrections_applied.len(), 1);
        assert_eq!(report.corrections_applied[0].finding.description, "weak hash");
    }

    #[test]
    fn test_error_fails_timeout_does_not() {
        let timeout = AgentResult::timeout("docs", 3, ExecutionMetadata::default());
        assert!(aggregate(vec![timeout.clone()], 0).passed());

        let error = AgentResult::error("types", "boom", ExecutionMetadata::default());
        assert!(!aggregate(vec![timeout, error], 0).passed());
    }

    #[test]
    fn test_empty_run_passes() {
        assert!(aggregate(Vec::new(), 0).passed());
    }
}
