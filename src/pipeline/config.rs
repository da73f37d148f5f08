//! Pipeline configuration.
//!
//! Covers tier thresholds, per-tier agent sets, the circuit breaker guarding
//! agent runs, model defaults and where the event log lives.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use super::registry::DEFAULT_HISTORY_LIMIT;
use super::tier::{TierAgents, TierThresholds};
use crate::agents::ExecutorConfig;
use crate::circuit_breaker::CircuitBreakerConfig;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// Reaction or role table could not be parsed.
    #[error("Invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the pipeline runner and quality pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// File/line limits of the small and medium tiers.
    pub thresholds: TierThresholds,
    /// Agents run per tier unless a request names its own.
    pub tier_agents: TierAgents,

    /// Whether agent runs go through the shared circuit breaker.
    pub breaker_enabled: bool,
    pub breaker: CircuitBreakerConfig,

    /// Provider used by roles without an override.
    pub default_provider: String,
    /// Model used by roles without an override; empty lets the provider choose.
    pub default_model: String,
    pub temperature: f64,
    pub max_tokens: u32,

    /// Directory holding the per-correlation-id event logs.
    pub event_log_dir: PathBuf,
    /// Optional YAML file overlaying the built-in role catalogue.
    pub roles_file: Option<PathBuf>,
    /// Finished pipeline records kept for status queries.
    pub max_finished_records: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            thresholds: TierThresholds::default(),
            tier_agents: TierAgents::default(),
            breaker_enabled: true,
            breaker: CircuitBreakerConfig::default(),
            default_provider: "litellm".to_string(),
            default_model: String::new(),
            temperature: 0.2,
            max_tokens: 4096,
            event_log_dir: PathBuf::from("./conductor-events"),
            roles_file: None,
            max_finished_records: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `CONDUCTOR_*` environment variables on top of
    /// the defaults.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `CONDUCTOR_SMALL_MAX_FILES`, `CONDUCTOR_SMALL_MAX_LINES` | small tier limits |
    /// | `CONDUCTOR_MEDIUM_MAX_FILES`, `CONDUCTOR_MEDIUM_MAX_LINES` | medium tier limits |
    /// | `CONDUCTOR_AGENTS_SMALL`, `_MEDIUM`, `_LARGE` | comma-separated role lists |
    /// | `CONDUCTOR_BREAKER_ENABLED` | breaker on/off |
    /// | `CONDUCTOR_BREAKER_FAILURE_THRESHOLD` | consecutive failures to open |
    /// | `CONDUCTOR_BREAKER_COOLDOWN_SECS` | open-state cooldown |
    /// | `CONDUCTOR_DEFAULT_PROVIDER`, `CONDUCTOR_DEFAULT_MODEL` | model defaults |
    /// | `CONDUCTOR_AGENT_TEMPERATURE`, `CONDUCTOR_AGENT_MAX_TOKENS` | sampling |
    /// | `CONDUCTOR_EVENT_LOG_DIR` | event log directory |
    /// | `CONDUCTOR_ROLES_FILE` | role catalogue overlay |
    /// | `CONDUCTOR_MAX_FINISHED_RECORDS` | finished records kept |
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("CONDUCTOR_SMALL_MAX_FILES") {
            config.thresholds.small_max_files = parse_env_value(&val, "CONDUCTOR_SMALL_MAX_FILES")?;
        }
        if let Ok(val) = std::env::var("CONDUCTOR_SMALL_MAX_LINES") {
            config.thresholds.small_max_lines = parse_env_value(&val, "CONDUCTOR_SMALL_MAX_LINES")?;
        }
        if let Ok(val) = std::env::var("CONDUCTOR_MEDIUM_MAX_FILES") {
            config.thresholds.medium_max_files =
                parse_env_value(&val, "CONDUCTOR_MEDIUM_MAX_FILES")?;
        }
        if let Ok(val) = std::env::var("CONDUCTOR_MEDIUM_MAX_LINES") {
            config.thresholds.medium_max_lines =
                parse_env_value(&val, "CONDUCTOR_MEDIUM_MAX_LINES")?;
        }

        if let Ok(val) = std::env::var("CONDUCTOR_AGENTS_SMALL") {
            config.tier_agents.small = parse_env_list(&val);
        }
        if let Ok(val) = std::env::var("CONDUCTOR_AGENTS_MEDIUM") {
            config.tier_agents.medium = parse_env_list(&val);
        }
        if let Ok(val) = std::env::var("CONDUCTOR_AGENTS_LARGE") {
            config.tier_agents.large = parse_env_list(&val);
        }

        if let Ok(val) = std::env::var("CONDUCTOR_BREAKER_ENABLED") {
            config.breaker_enabled = parse_env_bool(&val, "CONDUCTOR_BREAKER_ENABLED")?;
        }
        if let Ok(val) = std::env::var("CONDUCTOR_BREAKER_FAILURE_THRESHOLD") {
            config.breaker.failure_threshold =
                parse_env_value(&val, "CONDUCTOR_BREAKER_FAILURE_THRESHOLD")?;
        }
        if let Ok(val) = std::env::var("CONDUCTOR_BREAKER_COOLDOWN_SECS") {
            let secs: u64 = parse_env_value(&val, "CONDUCTOR_BREAKER_COOLDOWN_SECS")?;
            config.breaker.cooldown = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("CONDUCTOR_DEFAULT_PROVIDER") {
            config.default_provider = val;
        }
        if let Ok(val) = std::env::var("CONDUCTOR_DEFAULT_MODEL") {
            config.default_model = val;
        }
        if let Ok(val) = std::env::var("CONDUCTOR_AGENT_TEMPERATURE") {
            config.temperature = parse_env_value(&val, "CONDUCTOR_AGENT_TEMPERATURE")?;
        }
        if let Ok(val) = std::env::var("CONDUCTOR_AGENT_MAX_TOKENS") {
            config.max_tokens = parse_env_value(&val, "CONDUCTOR_AGENT_MAX_TOKENS")?;
        }

        if let Ok(val) = std::env::var("CONDUCTOR_EVENT_LOG_DIR") {
            config.event_log_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("CONDUCTOR_ROLES_FILE") {
            config.roles_file = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("CONDUCTOR_MAX_FINISHED_RECORDS") {
            config.max_finished_records =
                parse_env_value(&val, "CONDUCTOR_MAX_FINISHED_RECORDS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;
        if t.small_max_files > t.medium_max_files || t.small_max_lines > t.medium_max_lines {
            return Err(ConfigError::ValidationFailed(
                "small tier limits must not exceed medium tier limits".to_string(),
            ));
        }

        for (tier, agents) in [
            ("small", &self.tier_agents.small),
            ("medium", &self.tier_agents.medium),
            ("large", &self.tier_agents.large),
        ] {
            if agents.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} tier must run at least one agent",
                    tier
                )));
            }
        }

        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "breaker failure_threshold must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationFailed(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if self.max_tokens == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_tokens must be greater than 0".to_string(),
            ));
        }

        if self.max_finished_records == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_finished_records must be greater than 0".to_string(),
            ));
        }

        if self.default_provider.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "default_provider cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Sampling settings for agent executors.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub fn with_thresholds(mut self, thresholds: TierThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_tier_agents(mut self, tier_agents: TierAgents) -> Self {
        self.tier_agents = tier_agents;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self.breaker_enabled = true;
        self
    }

    pub fn without_breaker(mut self) -> Self {
        self.breaker_enabled = false;
        self
    }

    pub fn with_default_model(
        mut self,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        self.default_provider = provider.into();
        self.default_model = model.into();
        self
    }

    pub fn with_event_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.event_log_dir = dir.into();
        self
    }

    pub fn with_roles_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.roles_file = Some(path.into());
        self
    }

    pub fn with_max_finished_records(mut self, limit: usize) -> Self {
        self.max_finished_records = limit;
        self
    }
}

/// Parse an environment variable value.
pub(crate) fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
pub(crate) fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

/// Parse a comma-separated list, dropping empty items.
pub(crate) fn parse_env_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.breaker_enabled);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.default_provider, "litellm");
    }

    #[test]
    fn test_builder_methods() {
        let config = PipelineConfig::new()
            .with_default_model("openrouter", "m1")
            .with_event_log_dir("/tmp/events")
            .without_breaker();
        assert_eq!(config.default_model, "m1");
        assert_eq!(config.event_log_dir, PathBuf::from("/tmp/events"));
        assert!(!config.breaker_enabled);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = PipelineConfig::default();
        config.thresholds.small_max_files = 50;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.tier_agents.medium.clear();
        assert!(matches!(config.validate(), Err(ConfigError::ValidationFailed(msg)) if msg.contains("medium")));

        let mut config = PipelineConfig::default();
        config.temperature = 3.0;
        assert!(config.validate().is_err());

        let config = PipelineConfig::default().with_max_finished_records(0);
        assert!(matches!(config.validate(), Err(ConfigError::ValidationFailed(msg)) if msg.contains("max_finished_records")));
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_env_value::<usize>(" 12 ", "K").unwrap(), 12);
        assert!(parse_env_value::<usize>("x", "K").is_err());
        assert!(parse_env_bool("YES", "K").unwrap());
        assert!(!parse_env_bool("off", "K").unwrap());
        assert!(parse_env_bool("maybe", "K").is_err());
        assert_eq!(parse_env_list("tests, security,,docs "), vec!["tests", "security", "docs"]);
    }
}
