//! Git and pull-request operations used by sessions.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::CollaboratorError;

/// A pull request opened for a session branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: String,
}

/// Branch, worktree, push and pull-request operations.
///
/// Implementations return errors; they never panic on a failed command.
#[async_trait]
pub trait GitOperations: Send + Sync {
    /// Creates `branch` from `base_branch` in a fresh worktree of `project_path`.
    async fn create_worktree(
        &self,
        project_path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<PathBuf, CollaboratorError>;

    /// Commits every change in `worktree` and pushes `branch`.
    async fn commit_and_push(
        &self,
        worktree: &Path,
        branch: &str,
        message: &str,
    ) -> Result<(), CollaboratorError>;

    async fn create_pull_request(
        &self,
        worktree: &Path,
        branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestRef, CollaboratorError>;

    async fn merge_pull_request(&self, worktree: &Path, number: u64) -> Result<(), CollaboratorError>;
}

/// Runs `program args..` in `dir` and returns trimmed stdout.
pub(crate) async fn run_command(
    operation: &str,
    program: &str,
    args: &[&str],
    dir: &Path,
) -> Result<String, CollaboratorError> {
    debug!(operation, program, ?args, dir = %dir.display(), "Running command");
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| CollaboratorError::git(operation, format!("failed to spawn {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CollaboratorError::git(
            operation,
            format!("{} exited with {}: {}", program, output.status, stderr.trim()),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// [`GitOperations`] over the `git` binary and the GitHub `gh` CLI.
///
/// Worktrees are created under `<project>/<worktree_dir>/<branch>` with `/`
/// in branch names replaced by `-`.
#[derive(Debug, Clone)]
pub struct GitCli {
    worktree_dir: String,
    remote: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            worktree_dir: ".worktrees".to_string(),
            remote: "origin".to_string(),
        }
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worktree_dir(mut self, dir: impl Into<String>) -> Self {
        self.worktree_dir = dir.into();
        self
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    fn worktree_path(&self, project_path: &Path, branch: &str) -> PathBuf {
        project_path
            .join(&self.worktree_dir)
            .join(branch.replace('/', "-"))
    }
}

#[async_trait]
impl GitOperations for GitCli {
    async fn create_worktree(
        &self,
        project_path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<PathBuf, CollaboratorError> {
        let path = self.worktree_path(project_path, branch);
        let path_arg = path.to_string_lossy().to_string();
        run_command(
            "worktree",
            "git",
            &["worktree", "add", "-b", branch, &path_arg, base_branch],
            project_path,
        )
        .await?;
        info!(branch, path = %path.display(), "Worktree created");
        Ok(path)
    }

    async fn commit_and_push(
        &self,
        worktree: &Path,
        branch: &str,
        message: &str,
    ) -> Result<(), CollaboratorError> {
        run_command("add", "git", &["add", "--all"], worktree).await?;
        let staged = run_command("diff", "git", &["diff", "--cached", "--name-only"], worktree).await?;
        if staged.is_empty() {
            return Err(CollaboratorError::git("commit", "nothing to commit"));
        }
        run_command("commit", "git", &["commit", "-m", message], worktree).await?;
        run_command("push", "git", &["push", "-u", &self.remote, branch], worktree).await?;
        info!(branch, "Branch pushed");
        Ok(())
    }

    async fn create_pull_request(
        &self,
        worktree: &Path,
        branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestRef, CollaboratorError> {
        let url = run_command(
            "pr create",
            "gh",
            &[
                "pr", "create", "--head", branch, "--base", base_branch, "--title", title, "--body",
                body,
            ],
            worktree,
        )
        .await?;
        let url = url.lines().last().unwrap_or_default().trim().to_string();
        let number = parse_pr_number(&url).ok_or_else(|| {
            CollaboratorError::git("pr create", format!("unexpected output: {}", url))
        })?;
        info!(number, url = %url, "Pull request created");
        Ok(PullRequestRef { number, url })
    }

    async fn merge_pull_request(&self, worktree: &Path, number: u64) -> Result<(), CollaboratorError> {
        let number_arg = number.to_string();
        run_command(
            "pr merge",
            "gh",
            &["pr", "merge", &number_arg, "--squash", "--delete-branch"],
            worktree,
        )
        .await?;
        info!(number, "Pull request merged");
        Ok(())
    }
}

/// Number at the end of a pull request URL (`.../pull/42`).
pub fn parse_pr_number(url: &str) -> Option<u64> {
    url.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pr_number() {
        assert_eq!(
            parse_pr_number("https://github.com/acme/app/pull/42"),
            Some(42)
        );
        assert_eq!(parse_pr_number("https://github.com/acme/app/pull/7/"), Some(7));
        assert_eq!(parse_pr_number("not a url"), None);
    }

    #[test]
    fn test_worktree_path_flattens_branch() {
        let git = GitCli::new().with_worktree_dir("wt");
        assert_eq!(
            git.worktree_path(Path::new("/repo"), "session/issue-7"),
            PathBuf::from("/repo/wt/session-issue-7")
        );
    }

    #[tokio::test]
    async fn test_failed_command_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_command("bad-subcommand", "git", &["not-a-subcommand"], dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Git { .. }));
    }
}
