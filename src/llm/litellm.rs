//! OpenAI-compatible chat-completions client.
//!
//! [`LlmProvider`] is the model-execution seam used by agents. [`LiteLlmClient`]
//! talks to a LiteLLM proxy (or any endpoint exposing `/chat/completions`), so
//! every vendor the proxy fronts is reachable through one provider name.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::LlmError;

const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// "system", "user" or "assistant".
    pub role: String,
    pub content: String,
}

impl Message {
    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }
}

/// One model call: the whole conversation so far plus sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Model identifier. Empty means the provider's default model.
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Provider reply, normalised to the chat-completions shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub id: String,
    /// Model that actually answered; proxies may rewrite the requested name.
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl GenerationResponse {
    /// Text of the first choice, if any.
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    /// Reason the generation stopped ("stop", "length").
    pub finish_reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Model-execution capability.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError>;
}

/// [`LlmProvider`] over HTTP against a LiteLLM-compatible endpoint.
pub struct LiteLlmClient {
    api_base: String,
    api_key: Option<String>,
    default_model: String,
    timeout: Duration,
    http_client: Client,
}

fn build_http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Falling back to default HTTP client");
            Client::new()
        })
}

impl LiteLlmClient {
    /// Client for `api_base` (e.g. `http://localhost:4000`). `default_model`
    /// is sent when a request leaves `model` empty.
    pub fn new(api_base: impl Into<String>, api_key: Option<String>, default_model: impl Into<String>) -> Self {
        let api_base: String = api_base.into();
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            default_model: default_model.into(),
            timeout: DEFAULT_TIMEOUT,
            http_client: build_http_client(DEFAULT_TIMEOUT),
        }
    }

    /// Replaces the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.http_client = build_http_client(timeout);
        self
    }

    /// Create a client from environment variables.
    ///
    /// - `LITELLM_API_BASE`: base URL (required)
    /// - `LITELLM_API_KEY`: bearer token (optional)
    /// - `LITELLM_DEFAULT_MODEL`: model for requests that name none
    /// - `LITELLM_TIMEOUT_SECS`: per-request timeout, default 300
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingApiBase` if `LITELLM_API_BASE` is not set.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_base = env::var("LITELLM_API_BASE").map_err(|_| LlmError::MissingApiBase)?;
        let api_key = env::var("LITELLM_API_KEY").ok().filter(|k| !k.is_empty());
        let default_model =
            env::var("LITELLM_DEFAULT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        let mut client = Self::new(api_base, api_key, default_model);
        if let Some(secs) = env::var("LITELLM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            client = client.with_timeout(Duration::from_secs(secs));
        }
        Ok(client)
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    #[serde(default)]
    index: u32,
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    role: String,
    // Tool-call-only replies carry a null content.
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl From<ApiResponse> for GenerationResponse {
    fn from(api: ApiResponse) -> Self {
        GenerationResponse {
            id: api.id,
            model: api.model,
            choices: api
                .choices
                .into_iter()
                .map(|choice| Choice {
                    index: choice.index,
                    message: Message {
                        role: choice.message.role,
                        content: choice.message.content.unwrap_or_default(),
                    },
                    finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
                })
                .collect(),
            usage: api.usage.unwrap_or_default(),
        }
    }
}

/// Maps a non-success HTTP reply to the matching [`LlmError`].
fn classify_error(status: StatusCode, body: String) -> LlmError {
    let (message, code) = match serde_json::from_str::<ApiErrorResponse>(&body) {
        Ok(parsed) => (parsed.error.message, parsed.error.code),
        Err(_) => (body, None),
    };

    let context_exceeded = code
        .as_ref()
        .and_then(|c| c.as_str())
        .is_some_and(|c| c == "context_length_exceeded")
        || message.contains("maximum context length");

    match status {
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited(message),
        StatusCode::BAD_REQUEST if context_exceeded => LlmError::ContextLengthExceeded {
            limit: first_number(&message).unwrap_or(0),
        },
        StatusCode::NOT_FOUND if message.contains("model") => LlmError::InvalidModel(message),
        _ => LlmError::ApiError {
            code: status.as_u16(),
            message,
        },
    }
}

/// First run of ASCII digits in `text`, e.g. the limit in "maximum context
/// length is 128000 tokens".
fn first_number(text: &str) -> Option<u32> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: String = text[start..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[async_trait]
impl LlmProvider for LiteLlmClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let model = if request.model.is_empty() {
            self.default_model.as_str()
        } else {
            request.model.as_str()
        };
        let body = ApiRequest {
            model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut http_request = self
            .http_client
            .post(format!("{}/chat/completions", self.api_base))
            .header("X-Title", "swe-conductor")
            .json(&body);
        if let Some(api_key) = &self.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        let http_response = http_request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::RequestFailed(format!("timed out after {}s", self.timeout.as_secs()))
            } else {
                LlmError::RequestFailed(e.to_string())
            }
        })?;

        let status = http_response.status();
        if !status.is_success() {
            let text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(classify_error(status, text));
        }

        let api_response: ApiResponse = http_response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))?;
        Ok(api_response.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roles() {
        assert_eq!(Message::system("s").role, "system");
        assert_eq!(Message::user("u").role, "user");
        assert_eq!(Message::assistant("a").content, "a");
    }

    #[test]
    fn test_client_normalises_base_and_timeout() {
        let client = LiteLlmClient::new("http://localhost:4000/", Some("k".to_string()), "gpt-4")
            .with_timeout(Duration::from_secs(30));

        assert_eq!(client.api_base(), "http://localhost:4000");
        assert_eq!(client.default_model(), "gpt-4");
        assert_eq!(client.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_api_response_with_null_content_and_no_usage() {
        let raw = r#"{
            "id": "gen-1",
            "model": "m",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": null}}]
        }"#;
        let api: ApiResponse = serde_json::from_str(raw).unwrap();
        let response: GenerationResponse = api.into();

        assert_eq!(response.first_content(), Some(""));
        assert_eq!(response.choices[0].finish_reason, "stop");
        assert_eq!(response.usage.total_tokens, 0);
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            classify_error(StatusCode::TOO_MANY_REQUESTS, "slow down".to_string()),
            LlmError::RateLimited(m) if m == "slow down"
        ));
        assert!(matches!(
            classify_error(
                StatusCode::BAD_REQUEST,
                r#"{"error": {"message": "too long", "code": "context_length_exceeded"}}"#.to_string()
            ),
            LlmError::ContextLengthExceeded { limit: 0 }
        ));
        assert!(matches!(
            classify_error(
                StatusCode::BAD_REQUEST,
                "This model's maximum context length is 128000 tokens".to_string()
            ),
            LlmError::ContextLengthExceeded { limit: 128000 }
        ));
        assert!(matches!(
            classify_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"error": {"message": "upstream down"}}"#.to_string()
            ),
            LlmError::ApiError { code: 500, message } if message == "upstream down"
        ));
    }

    #[tokio::test]
    async fn test_generate_connection_error() {
        let client = LiteLlmClient::new("http://localhost:65535", None, "gpt-4");

        let request = GenerationRequest::new("", vec![Message::user("test")]);
        let result = client.generate(request).await;

        assert!(matches!(result, Err(LlmError::RequestFailed(_))));
    }
}
