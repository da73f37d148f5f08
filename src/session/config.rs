//! Session manager configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::pipeline::config::{parse_env_value, ConfigError};

/// Configuration for the session manager.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum number of non-terminal sessions.
    pub max_parallel: usize,
    /// An active session idle longer than this is superseded by a new
    /// session for the same issue.
    pub stale_after: Duration,
    /// `sweep_stale` raises `stuck` for sessions idle longer than this.
    pub stuck_after: Duration,
    pub default_base_branch: String,
    /// Prefix of session branch names.
    pub branch_prefix: String,
    /// Optional YAML overlay of the reaction table.
    pub reactions_file: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_parallel: 5,
            stale_after: Duration::from_secs(30 * 60),
            stuck_after: Duration::from_secs(10 * 60),
            default_base_branch: "main".to_string(),
            branch_prefix: "conductor/".to_string(),
            reactions_file: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `CONDUCTOR_MAX_SESSIONS` | `max_parallel` |
    /// | `CONDUCTOR_SESSION_STALE_MINUTES` | `stale_after` |
    /// | `CONDUCTOR_SESSION_STUCK_MINUTES` | `stuck_after` |
    /// | `CONDUCTOR_BASE_BRANCH` | `default_base_branch` |
    /// | `CONDUCTOR_BRANCH_PREFIX` | `branch_prefix` |
    /// | `CONDUCTOR_REACTIONS_FILE` | `reactions_file` |
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("CONDUCTOR_MAX_SESSIONS") {
            config.max_parallel = parse_env_value(&val, "CONDUCTOR_MAX_SESSIONS")?;
        }
        if let Ok(val) = std::env::var("CONDUCTOR_SESSION_STALE_MINUTES") {
            let minutes: u64 = parse_env_value(&val, "CONDUCTOR_SESSION_STALE_MINUTES")?;
            config.stale_after = Duration::from_secs(minutes * 60);
        }
        if let Ok(val) = std::env::var("CONDUCTOR_SESSION_STUCK_MINUTES") {
            let minutes: u64 = parse_env_value(&val, "CONDUCTOR_SESSION_STUCK_MINUTES")?;
            config.stuck_after = Duration::from_secs(minutes * 60);
        }
        if let Ok(val) = std::env::var("CONDUCTOR_BASE_BRANCH") {
            config.default_base_branch = val;
        }
        if let Ok(val) = std::env::var("CONDUCTOR_BRANCH_PREFIX") {
            config.branch_prefix = val;
        }
        if let Ok(val) = std::env::var("CONDUCTOR_REACTIONS_FILE") {
            config.reactions_file = Some(PathBuf::from(val));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_parallel must be greater than 0".to_string(),
            ));
        }
        if self.default_base_branch.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "default_base_branch cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_stuck_after(mut self, stuck_after: Duration) -> Self {
        self.stuck_after = stuck_after;
        self
    }

    pub fn with_reactions_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.reactions_file = Some(path.into());
        self
    }
}
