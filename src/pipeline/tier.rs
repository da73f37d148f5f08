//! Change-size tiers and their default agent sets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::agents::DiffStats;

/// Size class of a change, computed once per pipeline request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Small,
    Medium,
    Large,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Small => "small",
            Tier::Medium => "medium",
            Tier::Large => "large",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "small" => Ok(Tier::Small),
            "medium" => Ok(Tier::Medium),
            "large" => Ok(Tier::Large),
            other => Err(format!("unknown tier '{}', expected small, medium or large", other)),
        }
    }
}

/// Upper bounds (inclusive) of the small and medium tiers.
///
/// A change lands in the smallest tier whose file *and* line limits it fits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub small_max_files: usize,
    pub small_max_lines: usize,
    pub medium_max_files: usize,
    pub medium_max_lines: usize,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            small_max_files: 3,
            small_max_lines: 100,
            medium_max_files: 10,
            medium_max_lines: 500,
        }
    }
}

impl TierThresholds {
    pub fn classify(&self, stats: &DiffStats) -> Tier {
        let files = stats.files_changed;
        let lines = stats.lines_changed();
        if files <= self.small_max_files && lines <= self.small_max_lines {
            Tier::Small
        } else if files <= self.medium_max_files && lines <= self.medium_max_lines {
            Tier::Medium
        } else {
            Tier::Large
        }
    }
}

/// Agent roles run for each tier when the request does not name its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierAgents {
    pub small: Vec<String>,
    pub medium: Vec<String>,
    pub large: Vec<String>,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for TierAgents {
    fn default() -> Self {
        Self {
            small: names(&["tests", "style"]),
            medium: names(&["tests", "security", "style", "types"]),
            large: names(&[
                "tests",
                "security",
                "style",
                "types",
                "architecture",
                "performance",
                "docs",
            ]),
        }
    }
}

impl TierAgents {
    pub fn for_tier(&self, tier: Tier) -> &[String] {
        match tier {
            Tier::Small => &self.small,
            Tier::Medium => &self.medium,
            Tier::Large => &self.large,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(files: usize, insertions: usize, deletions: usize) -> DiffStats {
        DiffStats {
            files_changed: files,
            insertions,
            deletions,
            changed_files: Vec::new(),
        }
    }

    #[test]
    fn test_classify_boundaries() {
        let t = TierThresholds::default();
        assert_eq!(t.classify(&stats(0, 0, 0)), Tier::Small);
        assert_eq!(t.classify(&stats(3, 60, 40)), Tier::Small);
        assert_eq!(t.classify(&stats(3, 60, 41)), Tier::Medium);
        assert_eq!(t.classify(&stats(4, 1, 0)), Tier::Medium);
        assert_eq!(t.classify(&stats(10, 500, 0)), Tier::Medium);
        assert_eq!(t.classify(&stats(11, 1, 0)), Tier::Large);
        assert_eq!(t.classify(&stats(2, 400, 200)), Tier::Large);
    }

    #[test]
    fn test_tier_parse_and_agents() {
        assert_eq!("Large".parse::<Tier>().unwrap(), Tier::Large);
        assert!("huge".parse::<Tier>().is_err());

        let agents = TierAgents::default();
        assert_eq!(agents.for_tier(Tier::Small).len(), 2);
        assert!(agents.for_tier(Tier::Large).contains(&"architecture".to_string()));
    }
}
