//! Named model providers and per-role model resolution.
//!
//! Every agent runs with its own `(provider, model)` pair. The pair is looked
//! up in a [`ModelResolution`] table: a per-role override wins, then whatever
//! the role definition itself asks for, then the table default.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::litellm::LlmProvider;
use crate::error::LlmError;

/// Providers addressable by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding one provider that is also the default.
    pub fn single(name: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        let name = name.into();
        let mut registry = Self::new();
        registry.register(name.clone(), provider);
        registry.default_provider = Some(name);
        registry
    }

    /// Adds or replaces a provider. The first registered provider becomes the default.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        let name = name.into();
        if self.default_provider.is_none() {
            self.default_provider = Some(name.clone());
        }
        self.providers.insert(name, provider);
    }

    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default_provider = Some(name.into());
        self
    }

    pub fn default_provider(&self) -> Option<&str> {
        self.default_provider.as_deref()
    }

    /// Looks up a provider by name.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::UnknownProvider` when nothing is registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn LlmProvider>, LlmError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| LlmError::UnknownProvider(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Model/provider choice for one role; unset fields fall through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelChoice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Concrete pair an agent runs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedModel {
    pub model: String,
    pub provider: String,
}

/// Per-role resolution table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelResolution {
    /// Model used when neither an override nor the role names one. Empty lets
    /// the provider choose its own default.
    #[serde(default)]
    pub default_model: String,
    #[serde(default)]
    pub default_provider: String,
    #[serde(default)]
    pub overrides: HashMap<String, ModelChoice>,
}

impl ModelResolution {
    pub fn new(default_provider: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            default_provider: default_provider.into(),
            overrides: HashMap::new(),
        }
    }

    /// Adds a per-role override.
    pub fn with_override(mut self, role: impl Into<String>, choice: ModelChoice) -> Self {
        self.overrides.insert(role.into(), choice);
        self
    }

    /// Resolves the pair for `role`, consulting the role's own preference
    /// between the override and the default.
    pub fn resolve(&self, role: &str, role_choice: &ModelChoice) -> ResolvedModel {
        let table = self.overrides.get(role);
        let pick = |from_table: Option<&String>, from_role: Option<&String>, default: &str| {
            from_table
                .or(from_role)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        ResolvedModel {
            model: pick(
                table.and_then(|c| c.model.as_ref()),
                role_choice.model.as_ref(),
                &self.default_model,
            ),
            provider: pick(
                table.and_then(|c| c.provider.as_ref()),
                role_choice.provider.as_ref(),
                &self.default_provider,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerationRequest, GenerationResponse};
    use async_trait::async_trait;

    struct NullProvider;

    #[async_trait]
    impl LlmProvider for NullProvider {
        async fn generate(&self, _r: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            Err(LlmError::RequestFailed("null".to_string()))
        }
    }

    #[test]
    fn test_first_registered_is_default() {
        let mut registry = ProviderRegistry::new();
        registry.register("openrouter", Arc::new(NullProvider));
        registry.register("local", Arc::new(NullProvider));

        assert_eq!(registry.default_provider(), Some("openrouter"));
        assert_eq!(registry.names(), vec!["local", "openrouter"]);
        assert!(registry.get("local").is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(LlmError::UnknownProvider(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_resolution_precedence() {
        let table = ModelResolution::new("openrouter", "base-model").with_override(
            "security",
            ModelChoice {
                model: Some("strong-model".to_string()),
                provider: None,
            },
        );

        let role_pref = ModelChoice {
            model: Some("role-model".to_string()),
            provider: Some("local".to_string()),
        };

        let security = table.resolve("security", &role_pref);
        assert_eq!(security.model, "strong-model");
        assert_eq!(security.provider, "local");

        let style = table.resolve("style", &role_pref);
        assert_eq!(style.model, "role-model");

        let docs = table.resolve("docs", &ModelChoice::default());
        assert_eq!(
            docs,
            ResolvedModel {
                model: "base-model".to_string(),
                provider: "openrouter".to_string()
            }
        );
    }
}
