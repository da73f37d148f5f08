//! Issue tracker collaborator.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CollaboratorError;

/// GitHub REST API base URL.
const GITHUB_API_BASE: &str = "https://api.github.com";

/// An issue as fetched from the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueDetail {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn fetch_issue_detail(&self, number: u64) -> Result<IssueDetail, CollaboratorError>;

    async fn add_comment(&self, number: u64, body: &str) -> Result<(), CollaboratorError>;
}

#[derive(Debug, Deserialize)]
struct GitHubIssue {
    number: u64,
    title: String,
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GitHubLabel>,
}

#[derive(Debug, Deserialize)]
struct GitHubLabel {
    name: String,
}

/// [`IssueTracker`] backed by the GitHub REST API for one repository.
pub struct GitHubTracker {
    http_client: Client,
    api_base: String,
    owner: String,
    repo: String,
    api_token: Option<String>,
}

impl GitHubTracker {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, api_token: Option<String>) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http_client,
            api_base: GITHUB_API_BASE.to_string(),
            owner: owner.into(),
            repo: repo.into(),
            api_token,
        }
    }

    /// Builds a tracker from `owner/repo` and `GITHUB_TOKEN`.
    pub fn from_repo_slug(slug: &str) -> Result<Self, CollaboratorError> {
        let (owner, repo) = slug
            .split_once('/')
            .filter(|(o, r)| !o.is_empty() && !r.is_empty())
            .ok_or_else(|| CollaboratorError::Tracker(format!("invalid repository '{}'", slug)))?;
        Ok(Self::new(owner, repo, std::env::var("GITHUB_TOKEN").ok()))
    }

    /// Points the tracker at a GitHub Enterprise or test server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn issue_url(&self, number: u64) -> String {
        format!(
            "{}/repos/{}/{}/issues/{}",
            self.api_base, self.owner, self.repo, number
        )
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "swe-conductor/0.1")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.api_token {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }
}

#[async_trait]
impl IssueTracker for GitHubTracker {
    async fn fetch_issue_detail(&self, number: u64) -> Result<IssueDetail, CollaboratorError> {
        let url = self.issue_url(number);
        debug!(url = %url, "Fetching issue");
        let response = self
            .request(self.http_client.get(&url))
            .send()
            .await
            .map_err(|e| CollaboratorError::Tracker(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(CollaboratorError::IssueNotFound(number));
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CollaboratorError::Tracker(format!(
                "API returned status {}: {}",
                status, error_text
            )));
        }

        let issue: GitHubIssue = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Tracker(format!("Failed to parse issue: {}", e)))?;
        Ok(issue.into())
    }

    async fn add_comment(&self, number: u64, body: &str) -> Result<(), CollaboratorError> {
        let url = format!("{}/comments", self.issue_url(number));
        let response = self
            .request(self.http_client.post(&url))
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .map_err(|e| CollaboratorError::Tracker(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CollaboratorError::Tracker(format!(
                "comment on #{} returned status {}",
                number, status
            )));
        }
        Ok(())
    }
}

impl From<GitHubIssue> for IssueDetail {
    fn from(issue: GitHubIssue) -> Self {
        Self {
            number: issue.number,
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
        }
    }
}
