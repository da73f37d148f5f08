//! Diff statistics of a worktree against its base branch.

use std::path::Path;

use async_trait::async_trait;

use super::git::run_command;
use crate::agents::DiffStats;
use crate::error::CollaboratorError;

/// Computes `{files_changed, insertions, deletions, changed_files}`.
#[async_trait]
pub trait DiffProvider: Send + Sync {
    async fn diff_stats(&self, worktree: &Path, base_branch: &str) -> Result<DiffStats, CollaboratorError>;
}

/// [`DiffProvider`] running `git diff --numstat <base>...HEAD`.
#[derive(Debug, Clone, Default)]
pub struct GitDiffProvider;

#[async_trait]
impl DiffProvider for GitDiffProvider {
    async fn diff_stats(&self, worktree: &Path, base_branch: &str) -> Result<DiffStats, CollaboratorError> {
        let range = format!("{}...HEAD", base_branch);
        let output = run_command("diff", "git", &["diff", "--numstat", &range], worktree)
            .await
            .map_err(|e| CollaboratorError::Diff(e.to_string()))?;
        Ok(parse_numstat(&output))
    }
}

/// Parses `git diff --numstat` output.
///
/// Binary files report `-` for both counts; they count as changed files with
/// no line changes. Malformed lines are skipped.
pub fn parse_numstat(output: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in output.lines() {
        let mut parts = line.splitn(3, '\t');
        let (Some(added), Some(removed), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let path = path.trim();
        if path.is_empty() {
            continue;
        }
        stats.insertions += added.parse::<usize>().unwrap_or(0);
        stats.deletions += removed.parse::<usize>().unwrap_or(0);
        stats.changed_files.push(path.to_string());
    }
    stats.files_changed = stats.changed_files.len();
    stats
}
