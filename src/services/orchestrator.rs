//! One query, one answer: fast path, then strict generation, then lenient
//! recovery, then a safe fallback that never fails.

use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::error::GenerationError;
use crate::llm::prompt::build_messages;
use crate::llm::{ChatMessage, OutputMode, ProviderChain};
use crate::models::{
    AnswerPath, Assessment, ComplianceStatus, ConversationType, Persona, SearchHit,
};
use crate::services::followup::FollowUpSuggester;
use crate::services::knowledge_base;
use crate::services::token_budget::TokenBudget;

pub const NO_DOCUMENTS_MARKER: &str = "No specific regulatory documents were found. Provide a helpful response based on general knowledge.";

pub const SAFE_FALLBACK_RESPONSE: &str = "I apologize, but I encountered a technical issue processing your request. Please try rephrasing your question or contact support if the issue persists.";

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FastPathCheck,
    StandardGeneration,
    RecoveryParse,
    SafeFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub assessment: Assessment,
    pub path: AnswerPath,
}

pub struct AnswerOrchestrator {
    providers: ProviderChain,
    budget: TokenBudget,
    followups: Arc<FollowUpSuggester>,
}

impl AnswerOrchestrator {
    pub fn new(
        providers: ProviderChain,
        budget: TokenBudget,
        followups: Arc<FollowUpSuggester>,
    ) -> Self {
        Self {
            providers,
            budget,
            followups,
        }
    }

    pub fn providers(&self) -> &ProviderChain {
        &self.providers
    }

    pub fn followups(&self) -> &FollowUpSuggester {
        &self.followups
    }

    /// Always returns an assessment with a non-empty `response`.
    pub async fn answer(
        &self,
        query: &str,
        history: &str,
        persona: Persona,
        hits: &[SearchHit],
    ) -> Answer {
        let mut stage = Stage::FastPathCheck;
        let mut messages: Vec<ChatMessage> = Vec::new();
        let mut generation_error: Option<GenerationError> = None;
        let mut recovery_error: Option<GenerationError> = None;

        loop {
            tracing::debug!(?stage, "answer stage");
            match stage {
                Stage::FastPathCheck => match knowledge_base::fast_path(hits, &self.followups) {
                    Some(assessment) => return self.finish(assessment, AnswerPath::FastPath, hits),
                    None => stage = Stage::StandardGeneration,
                },
                Stage::StandardGeneration => {
                    messages = self.prompt(query, history, persona, hits);
                    tracing::info!("[STANDARD PATH] invoking model");
                    match self.standard_generation(&messages).await {
                        Ok(assessment) => {
                            return self.finish(assessment, AnswerPath::Generated, hits);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "[RECOVERY] strict generation failed, retrying without schema enforcement");
                            generation_error = Some(e);
                            stage = Stage::RecoveryParse;
                        }
                    }
                }
                Stage::RecoveryParse => match self.recovery_parse(&messages).await {
                    Ok(assessment) => {
                        tracing::info!("[RECOVERY] recovered assessment from free-form output");
                        return self.finish(assessment, AnswerPath::Recovered, hits);
                    }
                    Err(e) => {
                        recovery_error = Some(e);
                        stage = Stage::SafeFallback;
                    }
                },
                Stage::SafeFallback => {
                    let describe = |e: Option<GenerationError>| {
                        e.map_or_else(|| "unknown".to_string(), |e| e.to_string())
                    };
                    let primary = describe(generation_error.take());
                    let recovery = describe(recovery_error.take());
                    tracing::error!(
                        primary_error = %primary,
                        recovery_error = %recovery,
                        "[SAFE FALLBACK] both generation attempts failed"
                    );
                    return Answer {
                        assessment: safe_fallback(&primary, &recovery),
                        path: AnswerPath::SafeFallback,
                    };
                }
            }
        }
    }

    fn prompt(
        &self,
        query: &str,
        history: &str,
        persona: Persona,
        hits: &[SearchHit],
    ) -> Vec<ChatMessage> {
        let documents = hits
            .iter()
            .map(|h| h.chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let mut context = self.budget.fit(history, &documents, query);
        if context.trim().is_empty() {
            context = NO_DOCUMENTS_MARKER.to_string();
        }
        build_messages(persona, &context, query)
    }

    async fn standard_generation(
        &self,
        messages: &[ChatMessage],
    ) -> Result<Assessment, GenerationError> {
        let raw = self
            .providers
            .complete(messages, OutputMode::Structured)
            .await?;
        let assessment: Assessment = serde_json::from_str(raw.trim())
            .map_err(|e| GenerationError::MalformedOutput(e.to_string()))?;
        if assessment.response.trim().is_empty() {
            return Err(GenerationError::EmptyOutput);
        }
        Ok(assessment)
    }

    async fn recovery_parse(&self, messages: &[ChatMessage]) -> Result<Assessment, GenerationError> {
        let raw = self
            .providers
            .complete(messages, OutputMode::FreeForm)
            .await?;
        let json = extract_json(&raw).ok_or_else(|| {
            GenerationError::MalformedOutput("no JSON object in model output".to_string())
        })?;
        let assessment: Assessment = serde_json::from_str(json)
            .map_err(|e| GenerationError::MalformedOutput(e.to_string()))?;
        if assessment.is_blank() {
            return Err(GenerationError::EmptyOutput);
        }
        Ok(assessment)
    }

    fn finish(&self, mut assessment: Assessment, path: AnswerPath, hits: &[SearchHit]) -> Answer {
        if path != AnswerPath::FastPath {
            self.followups.enrich(&mut assessment, hits);
        }
        assessment.ensure_response();
        tracing::info!(
            path = %path,
            status = ?assessment.status,
            conversation_type = ?assessment.conversation_type,
            "answer ready"
        );
        Answer { assessment, path }
    }
}

/// JSON object inside a markdown code fence, or the outermost `{...}` span.
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(caps) = FENCED_JSON.captures(text)
        && let Some(m) = caps.get(1)
    {
        return Some(m.as_str());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// User-safe terminal answer; the underlying errors stay in `reasoning`.
pub fn safe_fallback(primary_error: &str, recovery_error: &str) -> Assessment {
    Assessment {
        response: SAFE_FALLBACK_RESPONSE.to_string(),
        status: Some(ComplianceStatus::NeedsReview),
        reasoning: Some(format!(
            "System Error: {} | Fallback Error: {}",
            primary_error, recovery_error
        )),
        relevant_clauses: Vec::new(),
        sources: Vec::new(),
        conversation_type: ConversationType::Error,
        follow_up_questions: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::error::LlmError;
    use crate::llm::{LlmBackend, SharedBackend};
    use crate::models::{Chunk, ChunkMetadata, FollowUpConfig, TokenBudgetConfig};
    use crate::services::followup::FollowUpCatalog;

    /// Replays canned outcomes and records what it was asked.
    struct ScriptedBackend {
        name: &'static str,
        script: Mutex<VecDeque<Result<String, LlmError>>>,
        calls: AtomicUsize,
        modes: Mutex<Vec<OutputMode>>,
        prompts: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedBackend {
        fn new(name: &'static str, script: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                modes: Mutex::new(Vec::new()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmBackend for ScriptedBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            messages: &[ChatMessage],
            mode: OutputMode,
        ) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.modes.lock().push(mode);
            self.prompts.lock().push(messages.to_vec());
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::InvalidResponse("script exhausted".into())))
        }
    }

    fn shared(backend: &Arc<ScriptedBackend>) -> SharedBackend {
        backend.clone()
    }

    fn orchestrator(backends: Vec<SharedBackend>) -> AnswerOrchestrator {
        AnswerOrchestrator::new(
            ProviderChain::new(backends),
            TokenBudget::from_config(&TokenBudgetConfig::default()),
            Arc::new(FollowUpSuggester::new(
                FollowUpCatalog::default(),
                &FollowUpConfig::default(),
            )),
        )
    }

    fn doc_hit(text: &str) -> SearchHit {
        SearchHit {
            chunk: Chunk::new(
                text.to_string(),
                ChunkMetadata::document("gdpr.pdf", "pdf"),
                0,
            ),
            score: 0.8,
        }
    }

    const VALID: &str = r#"{"response":"Retention must be limited.","status":"Compliant","reasoning":"Art.5(1)(e)","relevant_clauses":["Art.5"],"sources":[],"conversation_type":"analysis","follow_up_questions":[]}"#;

    #[tokio::test]
    async fn test_fast_path_makes_no_model_call() {
        let backend = ScriptedBackend::new("primary", vec![Ok(VALID.into())]);
        let orch = orchestrator(vec![shared(&backend)]);
        let hits = vec![SearchHit {
            chunk: Chunk::new(
                "CONTENT: Entities must retain data for 90 days.\n\nCLAUSE: Art.5".into(),
                ChunkMetadata::kb_entry("KB-001", "Data Retention"),
                0,
            ),
            score: 0.3,
        }];

        let answer = orch
            .answer("how long should I retain data?", "", Persona::default(), &hits)
            .await;
        assert_eq!(answer.path, AnswerPath::FastPath);
        assert_eq!(answer.assessment.response, "Entities must retain data for 90 days.");
        assert_eq!(answer.assessment.conversation_type, ConversationType::KbDirect);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_standard_generation_success() {
        let backend = ScriptedBackend::new("primary", vec![Ok(VALID.into())]);
        let orch = orchestrator(vec![shared(&backend)]);
        let hits = vec![doc_hit("Art.5 text")];
        let answer = orch
            .answer("Is our retention policy compliant?", "", Persona::Educational, &hits)
            .await;

        assert_eq!(answer.path, AnswerPath::Generated);
        assert_eq!(answer.assessment.status, Some(ComplianceStatus::Compliant));
        assert_eq!(answer.assessment.follow_up_questions.len(), 2);
        assert_eq!(*backend.modes.lock(), vec![OutputMode::Structured]);

        let prompts = backend.prompts.lock();
        assert!(prompts[0][0].content.contains(Persona::Educational.instruction()));
        assert!(prompts[0][1].content.contains("Art.5 text"));
    }

    #[tokio::test]
    async fn test_model_follow_ups_are_kept() {
        let raw = r#"{"response":"Yes.","follow_up_questions":["What about backups?"]}"#;
        let backend = ScriptedBackend::new("primary", vec![Ok(raw.into())]);
        let orch = orchestrator(vec![shared(&backend)]);
        let answer = orch.answer("q", "", Persona::default(), &[]).await;
        assert_eq!(answer.assessment.follow_up_questions, vec!["What about backups?"]);
    }

    #[tokio::test]
    async fn test_empty_retrieval_uses_no_documents_marker() {
        let backend = ScriptedBackend::new("primary", vec![Ok(VALID.into())]);
        let orch = orchestrator(vec![shared(&backend)]);
        orch.answer("anything", "", Persona::default(), &[]).await;
        assert!(backend.prompts.lock()[0][1].content.contains(NO_DOCUMENTS_MARKER));
    }

    #[tokio::test]
    async fn test_recovery_strips_code_fence() {
        let fenced = format!("Here you go:\n```json\n{}\n```\nThanks", VALID);
        let backend = ScriptedBackend::new(
            "primary",
            vec![Ok("definitely not json".into()), Ok(fenced)],
        );
        let orch = orchestrator(vec![shared(&backend)]);
        let answer = orch.answer("q", "", Persona::default(), &[]).await;

        assert_eq!(answer.path, AnswerPath::Recovered);
        assert_eq!(answer.assessment.response, "Retention must be limited.");
        assert_eq!(
            *backend.modes.lock(),
            vec![OutputMode::Structured, OutputMode::FreeForm]
        );
        assert_eq!(answer.assessment.follow_up_questions.len(), 2);
    }

    #[tokio::test]
    async fn test_recovery_backfills_response_from_reasoning() {
        let backend = ScriptedBackend::new(
            "primary",
            vec![
                Ok(r#"{"response":"","reasoning":"Clause 4 is met."}"#.into()),
                Ok(r#"{"reasoning":"Clause 4 is met.","conversation_type":"expansion"}"#.into()),
            ],
        );
        let orch = orchestrator(vec![shared(&backend)]);
        let answer = orch.answer("q", "", Persona::default(), &[]).await;
        assert_eq!(answer.path, AnswerPath::Recovered);
        assert_eq!(answer.assessment.response, "Clause 4 is met.");
        assert_eq!(answer.assessment.conversation_type, ConversationType::FollowUp);
    }

    #[tokio::test]
    async fn test_safe_fallback_when_everything_fails() {
        let primary = ScriptedBackend::new(
            "primary",
            vec![
                Err(LlmError::Network("connection refused".into())),
                Err(LlmError::Network("connection refused".into())),
            ],
        );
        let fallback = ScriptedBackend::new(
            "fallback",
            vec![Err(LlmError::Timeout), Err(LlmError::Timeout)],
        );
        let orch = orchestrator(vec![shared(&primary), shared(&fallback)]);
        let answer = orch.answer("q", "", Persona::default(), &[doc_hit("x")]).await;

        assert_eq!(answer.path, AnswerPath::SafeFallback);
        let a = &answer.assessment;
        assert_eq!(a.response, SAFE_FALLBACK_RESPONSE);
        assert_eq!(a.status, Some(ComplianceStatus::NeedsReview));
        assert_eq!(a.conversation_type, ConversationType::Error);
        let reasoning = a.reasoning.as_deref().unwrap();
        assert!(reasoning.starts_with("System Error: all providers failed"));
        assert!(reasoning.contains(" | Fallback Error: "));
        assert!(!a.response.contains("connection refused"));
        assert_eq!(primary.calls(), 2);
        assert_eq!(fallback.calls(), 2);
    }

    #[tokio::test]
    async fn test_failover_to_alternate_provider() {
        let primary = ScriptedBackend::new(
            "primary",
            vec![Err(LlmError::Api {
                status: 503,
                message: "overloaded".into(),
            })],
        );
        let alternate = ScriptedBackend::new("alternate", vec![Ok(VALID.into())]);
        let orch = orchestrator(vec![shared(&primary), shared(&alternate)]);
        let answer = orch.answer("q", "", Persona::default(), &[]).await;

        assert_eq!(answer.path, AnswerPath::Generated);
        assert_eq!(primary.calls(), 1);
        assert_eq!(alternate.calls(), 1);
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), Some("{\"a\":1}"));
        assert_eq!(extract_json("```\n{\"a\":1}\n```"), Some("{\"a\":1}"));
        assert_eq!(extract_json("prefix {\"a\":{\"b\":2}} suffix"), Some("{\"a\":{\"b\":2}}"));
        assert_eq!(extract_json("no braces"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }
}
