//! Agent role catalogue.
//!
//! A role is a named system prompt plus the tools and turn budget it runs
//! with. The built-in catalogue covers the quality agents and the two session
//! roles; a YAML file can replace or add roles by name:
//!
//! ```yaml
//! roles:
//!   - name: security
//!     description: Security review
//!     system_prompt: |
//!       You review diffs for vulnerabilities...
//!     tools: [read_file, search]
//!     max_turns: 15
//!     model: anthropic/claude-opus-4
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::AgentError;
use crate::llm::ModelChoice;

/// Tools every built-in reviewing role may use.
const REVIEW_TOOLS: &[&str] = &["read_file", "list_files", "search"];
/// Tools for roles allowed to change the worktree.
const EDIT_TOOLS: &[&str] = &["read_file", "write_file", "list_files", "search"];

const DEFAULT_MAX_TURNS: usize = 20;

fn default_max_turns() -> usize {
    DEFAULT_MAX_TURNS
}

/// One agent role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRole {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

impl AgentRole {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            system_prompt: system_prompt.into(),
            model: None,
            provider: None,
            tools: Vec::new(),
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Model/provider the role itself asks for.
    pub fn model_choice(&self) -> ModelChoice {
        ModelChoice {
            model: self.model.clone(),
            provider: self.provider.clone(),
        }
    }
}

fn review_prompt(focus: &str, checklist: &str) -> String {
    format!(
        "You are a {focus} reviewer working inside a git worktree. Inspect the changed \
         files of the current branch against its base and look for problems in your area only.\n\n\
         Checklist:\n{checklist}\n\n\
         You may fix low-risk issues directly with write_file; mark those findings \
         \"fix_applied\": true. Report every other issue without fixing it.\n\n\
         Set \"status\" to \"failed\" if any critical or high finding remains unfixed, \
         otherwise \"passed\"."
    )
}

/// Built-in role catalogue.
pub fn builtin_roles() -> Vec<AgentRole> {
    vec![
        AgentRole::new(
            "tests",
            review_prompt(
                "test coverage",
                "- new behaviour without tests\n- tests that cannot fail\n- removed or weakened assertions",
            ),
        )
        .with_description("Checks that changed behaviour is tested")
        .with_tools(EDIT_TOOLS),
        AgentRole::new(
            "security",
            review_prompt(
                "security",
                "- injection (SQL, shell, path)\n- secrets in code or logs\n- missing authorization checks\n- unsafe deserialization",
            ),
        )
        .with_description("Looks for vulnerabilities in the change")
        .with_tools(REVIEW_TOOLS),
        AgentRole::new(
            "style",
            review_prompt(
                "code style",
                "- naming and formatting inconsistent with the surrounding code\n- dead code and leftover debugging\n- overly long functions",
            ),
        )
        .with_description("Enforces local conventions")
        .with_tools(EDIT_TOOLS)
        .with_max_turns(12),
        AgentRole::new(
            "types",
            review_prompt(
                "type safety",
                "- unchecked casts and conversions\n- nullable values used without checks\n- stringly typed values that deserve a type",
            ),
        )
        .with_description("Checks type usage and conversions")
        .with_tools(REVIEW_TOOLS),
        AgentRole::new(
            "architecture",
            review_prompt(
                "architecture",
                "- layering violations and new circular dependencies\n- logic placed in the wrong module\n- duplicated abstractions",
            ),
        )
        .with_description("Reviews structure and dependencies")
        .with_tools(REVIEW_TOOLS)
        .with_max_turns(25),
        AgentRole::new(
            "performance",
            review_prompt(
                "performance",
                "- accidental quadratic loops\n- blocking calls on async paths\n- unbounded memory growth",
            ),
        )
        .with_description("Spots performance regressions")
        .with_tools(REVIEW_TOOLS),
        AgentRole::new(
            "docs",
            review_prompt(
                "documentation",
                "- public items changed without doc updates\n- stale README or changelog entries",
            ),
        )
        .with_description("Keeps documentation in step with code")
        .with_tools(EDIT_TOOLS)
        .with_max_turns(10),
        AgentRole::new(
            "planner",
            "You plan a code change for an issue. Explore the repository with the tools, then \
             reply with a JSON report whose \"summary\" is a numbered, file-level implementation \
             plan. Do not modify files.",
        )
        .with_description("Turns an issue into an implementation plan")
        .with_tools(REVIEW_TOOLS)
        .with_max_turns(15),
        AgentRole::new(
            "implementer",
            "You implement a planned code change in a git worktree. Edit files with write_file, \
             keep changes minimal, and reply with a JSON report whose \"summary\" describes what \
             you changed. Report anything you could not finish as a finding.",
        )
        .with_description("Implements a plan or addresses feedback")
        .with_tools(EDIT_TOOLS)
        .with_max_turns(40),
    ]
}

#[derive(Debug, Deserialize)]
struct RoleFile {
    #[serde(default)]
    roles: Vec<AgentRole>,
}

/// Roles addressable by name.
#[derive(Debug, Clone, Default)]
pub struct RoleRegistry {
    roles: BTreeMap<String, AgentRole>,
}

impl RoleRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding [`builtin_roles`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for role in builtin_roles() {
            registry.insert(role);
        }
        registry
    }

    /// Adds or replaces a role.
    pub fn insert(&mut self, role: AgentRole) {
        self.roles.insert(role.name.clone(), role);
    }

    /// Overlays roles parsed from YAML onto this registry.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed YAML or a role with an empty name,
    /// empty prompt or zero turn budget.
    pub fn merge_yaml(&mut self, yaml: &str) -> Result<usize, AgentError> {
        let file: RoleFile = serde_yaml::from_str(yaml)?;
        for role in &file.roles {
            if role.name.trim().is_empty() {
                return Err(AgentError::RoleConfig("role with empty name".to_string()));
            }
            if role.system_prompt.trim().is_empty() {
                return Err(AgentError::RoleConfig(format!(
                    "role '{}' has an empty system prompt",
                    role.name
                )));
            }
            if role.max_turns == 0 {
                return Err(AgentError::RoleConfig(format!(
                    "role '{}' has a zero turn budget",
                    role.name
                )));
            }
        }
        let count = file.roles.len();
        for role in file.roles {
            self.insert(role);
        }
        Ok(count)
    }

    /// Built-in roles overlaid with the roles in `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        let mut registry = Self::with_defaults();
        let count = registry.merge_yaml(&yaml)?;
        tracing::info!(path = %path.as_ref().display(), count, "Loaded agent roles");
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&AgentRole> {
        self.roles.get(name)
    }

    /// Like [`get`](Self::get), as an error.
    pub fn require(&self, name: &str) -> Result<&AgentRole, AgentError> {
        self.get(name)
            .ok_or_else(|| AgentError::UnknownRole(name.to_string()))
    }

    /// Role names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.roles.keys().map(String::as_str).collect()
    }

    pub fn roles(&self) -> impl Iterator<Item = &AgentRole> {
        self.roles.values()
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}
