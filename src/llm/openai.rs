use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{ChatMessage, LlmBackend, OutputMode};
use crate::error::LlmError;
use crate::models::ProviderConfig;
use crate::utils::{RetryPolicy, with_retry};

/// Chat-completions client for any OpenAI-compatible endpoint (Groq, OpenRouter,
/// vLLM, llama.cpp server, ...).
#[derive(Clone)]
pub struct OpenAiCompatibleBackend {
    client: Client,
    config: ProviderConfig,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for OpenAiCompatibleBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleBackend")
            .field("name", &self.config.name)
            .field("endpoint", &self.config.endpoint)
            .field("model", &self.config.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl OpenAiCompatibleBackend {
    /// Resolves the API key from `api_key_env` now; a missing key only fails
    /// when the provider is actually called.
    pub fn new(config: ProviderConfig) -> Result<Self, LlmError> {
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.trim().is_empty());
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: ProviderConfig, api_key: Option<String>) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Configuration(format!("failed to create HTTP client: {}", e)))?;
        let retry = RetryPolicy::with_retries(config.max_retries);

        Ok(Self {
            client,
            config,
            api_key,
            retry,
        })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.endpoint.trim_end_matches('/')
        )
    }

    async fn execute(&self, request: &ChatRequest<'_>) -> Result<String, LlmError> {
        let mut builder = self.client.post(self.completions_url()).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited(body),
                _ => LlmError::Api {
                    status: status.as_u16(),
                    message: body,
                },
            });
        }

        let completion: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("completion has no content".to_string()))
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        mode: OutputMode,
    ) -> Result<String, LlmError> {
        if self.api_key.is_none()
            && let Some(var) = &self.config.api_key_env
        {
            return Err(LlmError::Configuration(format!("{} is not set", var)));
        }

        let request = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            response_format: match mode {
                OutputMode::Structured => Some(ResponseFormat {
                    kind: "json_object",
                }),
                OutputMode::FreeForm => None,
            },
        };

        let outcome = with_retry(&self.retry, &self.config.name, || self.execute(&request)).await;
        tracing::debug!(
            provider = %self.config.name,
            model = %self.config.model,
            attempts = outcome.attempts(),
            "chat completion finished"
        );
        outcome.into_result()
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_provider() -> ProviderConfig {
        ProviderConfig {
            name: "local".to_string(),
            endpoint: "http://127.0.0.1:9/v1/".to_string(),
            model: "test-model".to_string(),
            api_key_env: None,
            temperature: 0.3,
            max_tokens: 64,
            timeout_secs: 2,
            max_retries: 0,
        }
    }

    #[test]
    fn test_request_shape() {
        let messages = vec![ChatMessage::system("s"), ChatMessage::user("u")];
        let request = ChatRequest {
            model: "m",
            messages: &messages,
            temperature: 0.3,
            max_tokens: 10,
            response_format: Some(ResponseFormat {
                kind: "json_object",
            }),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][1]["role"], "user");

        let free = ChatRequest {
            response_format: None,
            ..request
        };
        let json = serde_json::to_value(&free).unwrap();
        assert!(json.get("response_format").is_none());
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"{\"response\":\"ok\"}"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some(r#"{"response":"ok"}"#)
        );
    }

    #[test]
    fn test_url_and_debug_redaction() {
        let backend =
            OpenAiCompatibleBackend::with_api_key(local_provider(), Some("sk-secret".into()))
                .unwrap();
        assert_eq!(backend.completions_url(), "http://127.0.0.1:9/v1/chat/completions");
        let debug = format!("{:?}", backend);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_missing_key_is_configuration_error() {
        let mut config = local_provider();
        config.api_key_env = Some("CRAG_TEST_KEY_THAT_IS_NOT_SET".to_string());
        let backend = OpenAiCompatibleBackend::new(config).unwrap();
        let err = backend
            .complete(&[ChatMessage::user("hi")], OutputMode::Structured)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Configuration(_)));
        assert!(err.is_provider_failure());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_provider_failure() {
        let backend = OpenAiCompatibleBackend::new(local_provider()).unwrap();
        let err = backend
            .complete(&[ChatMessage::user("hi")], OutputMode::FreeForm)
            .await
            .unwrap_err();
        assert!(err.is_provider_failure());
    }
}
