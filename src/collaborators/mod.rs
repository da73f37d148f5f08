//! External collaborators: diff statistics, git/PR operations, issue tracker.
//!
//! Each collaborator is an async trait so the pipeline runner and session
//! manager can be driven by in-process mocks in tests.

pub mod diff;
pub mod git;
pub mod tracker;

pub use diff::{parse_numstat, DiffProvider, GitDiffProvider};
pub use git::{parse_pr_number, GitCli, GitOperations, PullRequestRef};
pub use tracker::{GitHubTracker, IssueDetail, IssueTracker};
