//! Model execution: the provider seam, an OpenAI-compatible client, and
//! per-role provider/model resolution.
//!
//! ```ignore
//! use std::sync::Arc;
//! use swe_conductor::llm::{LiteLlmClient, ModelResolution, ProviderRegistry};
//!
//! let client = Arc::new(LiteLlmClient::from_env()?);
//! let providers = ProviderRegistry::single("litellm", client);
//! let resolution = ModelResolution::new("litellm", "anthropic/claude-sonnet-4");
//! ```

pub mod litellm;
pub mod registry;

pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
};
pub use registry::{ModelChoice, ModelResolution, ProviderRegistry, ResolvedModel};
