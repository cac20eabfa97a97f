use std::sync::Arc;

use super::{ChatMessage, OutputMode, OpenAiCompatibleBackend, SharedBackend};
use crate::error::{GenerationError, LlmError};
use crate::models::GenerationConfig;

/// Ordered provider list. A provider that cannot serve the request at all
/// (unreachable, rate limited, misconfigured, 5xx) hands the same prompt to
/// the next one; any other error is returned as is.
#[derive(Clone)]
pub struct ProviderChain {
    backends: Vec<SharedBackend>,
}

impl ProviderChain {
    pub fn new(backends: Vec<SharedBackend>) -> Self {
        Self { backends }
    }

    pub fn from_config(config: &GenerationConfig) -> Result<Self, LlmError> {
        let backends = config
            .providers
            .iter()
            .cloned()
            .map(|p| OpenAiCompatibleBackend::new(p).map(|b| Arc::new(b) as SharedBackend))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(backends))
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// `name/model` labels in failover order.
    pub fn describe(&self) -> Vec<String> {
        self.backends
            .iter()
            .map(|b| format!("{}/{}", b.name(), b.model_name()))
            .collect()
    }

    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        mode: OutputMode,
    ) -> Result<String, GenerationError> {
        let mut failures = Vec::new();

        for (position, backend) in self.backends.iter().enumerate() {
            match backend.complete(messages, mode).await {
                Ok(text) => {
                    if position > 0 {
                        tracing::info!(
                            provider = backend.name(),
                            model = backend.model_name(),
                            "served by failover provider"
                        );
                    }
                    return Ok(text);
                }
                Err(e) if e.is_provider_failure() => {
                    tracing::warn!(
                        provider = backend.name(),
                        error = %e,
                        "provider unavailable, trying next"
                    );
                    failures.push(format!("{}: {}", backend.name(), e));
                }
                Err(e) => return Err(GenerationError::Provider(e)),
            }
        }

        if failures.is_empty() {
            failures.push("no providers configured".to_string());
        }
        Err(GenerationError::Exhausted(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::llm::LlmBackend;

    struct Fixed {
        name: &'static str,
        outcome: fn() -> Result<String, LlmError>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(name: &'static str, outcome: fn() -> Result<String, LlmError>) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcome,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmBackend for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn model_name(&self) -> &str {
            "fixed"
        }

        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _mode: OutputMode,
        ) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)()
        }
    }

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage::user("q")]
    }

    #[tokio::test]
    async fn test_fails_over_when_primary_unreachable() {
        let primary = Fixed::new("primary", || Err(LlmError::Network("refused".into())));
        let fallback = Fixed::new("fallback", || Ok("answer".into()));
        let chain = ProviderChain::new(vec![primary.clone() as SharedBackend, fallback.clone()]);

        let text = chain
            .complete(&messages(), OutputMode::Structured)
            .await
            .unwrap();
        assert_eq!(text, "answer");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_does_not_fail_over_on_bad_output() {
        let primary = Fixed::new("primary", || Err(LlmError::InvalidResponse("junk".into())));
        let fallback = Fixed::new("fallback", || Ok("answer".into()));
        let chain = ProviderChain::new(vec![primary as SharedBackend, fallback.clone()]);

        let err = chain
            .complete(&messages(), OutputMode::Structured)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Provider(LlmError::InvalidResponse(_))));
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exhausted_lists_every_provider() {
        let a = Fixed::new("a", || Err(LlmError::Timeout));
        let b = Fixed::new("b", || {
            Err(LlmError::Api {
                status: 503,
                message: "down".into(),
            })
        });
        let chain = ProviderChain::new(vec![a as SharedBackend, b]);

        let err = chain
            .complete(&messages(), OutputMode::FreeForm)
            .await
            .unwrap_err();
        let GenerationError::Exhausted(failures) = &err else {
            panic!("expected exhaustion, got {err:?}");
        };
        assert_eq!(failures.len(), 2);
        assert!(failures[0].starts_with("a: "));
        assert!(err.to_string().starts_with("all providers failed"));
    }

    #[tokio::test]
    async fn test_empty_chain() {
        let chain = ProviderChain::new(Vec::new());
        assert!(chain.is_empty());
        let err = chain
            .complete(&messages(), OutputMode::Structured)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Exhausted(_)));
    }

    #[test]
    fn test_from_default_config() {
        let chain = ProviderChain::from_config(&GenerationConfig::default()).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(
            chain.describe(),
            vec![
                "groq/llama-3.3-70b-versatile",
                "openrouter/google/gemini-2.0-flash-exp:free"
            ]
        );
    }
}
