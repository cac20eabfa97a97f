use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use compliance_rag::error::{IngestError, LlmError};
use compliance_rag::llm::{ChatMessage, LlmBackend, OutputMode, ProviderChain, SharedBackend};
use compliance_rag::models::{
    AnswerPath, Chunk, ChunkMetadata, ComplianceStatus, Config, ConversationType, EntryKind,
};
use compliance_rag::services::orchestrator::SAFE_FALLBACK_RESPONSE;
use compliance_rag::services::{
    AnswerOrchestrator, AskRequest, ComplianceService, EmbeddingIndex, FollowUpSuggester,
    HashingEmbedder, InMemoryHistoryStore, TokenBudget,
};

struct Scripted {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: AtomicUsize,
}

impl Scripted {
    fn new(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmBackend for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted-1"
    }

    async fn complete(&self, _messages: &[ChatMessage], _mode: OutputMode) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Network("connection refused".into())))
    }
}

fn config_in(dir: &Path) -> Config {
    let mut config = Config::default();
    config.index.path = Some(dir.join("index"));
    config.history.path = Some(dir.join("history.db"));
    config.metrics.path = Some(dir.join("metrics.db"));
    config.followups.catalog_path = Some(dir.join("followups.json"));
    config.daemon.socket_path = Some(dir.join("crag.sock"));
    config.daemon.auto_start = false;
    config
}

fn service_with(backends: Vec<SharedBackend>, config: &Config) -> ComplianceService {
    let index = EmbeddingIndex::load(&config.index_dir(), Arc::new(HashingEmbedder::new(256)));
    let followups = Arc::new(FollowUpSuggester::load(
        &config.followups_path(),
        &config.followups,
    ));
    let orchestrator = AnswerOrchestrator::new(
        ProviderChain::new(backends),
        TokenBudget::from_config(&config.token_budget),
        followups,
    );
    ComplianceService::new(
        Arc::new(index),
        Arc::new(InMemoryHistoryStore::default()),
        orchestrator,
        config,
    )
}

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[tokio::test]
async fn test_curated_entry_answers_without_model() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let backend = Scripted::new(Vec::new());
    let service = service_with(vec![backend.clone() as SharedBackend], &config);

    let path = write_file(
        dir.path(),
        "kb-001.txt",
        "CONTENT: Entities must retain data for 90 days.\n\nCLAUSE: Art.5",
    );
    let added = service
        .ingest_file(&path, &ChunkMetadata::kb_entry("KB-001", "Data retention"))
        .await
        .unwrap();
    assert_eq!(added, 1);

    let response = service
        .ask(AskRequest::new("how long should I retain data?"))
        .await;

    assert_eq!(response.data.response, "Entities must retain data for 90 days.");
    assert_eq!(response.data.conversation_type, ConversationType::KbDirect);
    assert_eq!(response.data.sources[0].document_name, "Data retention");
    assert_eq!(response.path, Some(AnswerPath::FastPath));
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_empty_index_still_answers() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let service = service_with(Vec::new(), &config);

    let hits = service.search("anything at all", Some(5)).await.unwrap();
    assert!(hits.is_empty());

    let response = service.ask(AskRequest::new("Do we need a DPO?")).await;
    assert!(!response.data.response.is_empty());
    assert_eq!(response.path, Some(AnswerPath::SafeFallback));
}

#[tokio::test]
async fn test_both_providers_down_gives_safe_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let primary = Scripted::new(vec![Err(LlmError::Network("primary down".into()))]);
    let fallback = Scripted::new(vec![Err(LlmError::Timeout)]);
    let service = service_with(
        vec![primary.clone() as SharedBackend, fallback.clone() as SharedBackend],
        &config,
    );

    let response = service.ask(AskRequest::new("Is our vendor compliant?")).await;

    assert_eq!(response.data.status, Some(ComplianceStatus::NeedsReview));
    assert_eq!(response.data.conversation_type, ConversationType::Error);
    assert_eq!(response.data.response, SAFE_FALLBACK_RESPONSE);
    assert!(!response.data.response.contains("primary down"));
    assert!(primary.calls() >= 1);
    assert!(fallback.calls() >= 1);
}

#[tokio::test]
async fn test_failover_provider_serves_answer() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let primary = Scripted::new(vec![Err(LlmError::RateLimited("slow down".into()))]);
    let fallback = Scripted::new(vec![Ok(serde_json::json!({
        "response": "Yes, with a signed DPA.",
        "status": "Compliant",
        "conversation_type": "analysis"
    })
    .to_string())]);
    let service = service_with(
        vec![primary as SharedBackend, fallback.clone() as SharedBackend],
        &config,
    );

    let response = service.ask(AskRequest::new("Can we use this processor?")).await;
    assert_eq!(response.data.response, "Yes, with a signed DPA.");
    assert_eq!(response.path, Some(AnswerPath::Generated));
    assert_eq!(fallback.calls(), 1);
}

#[tokio::test]
async fn test_missing_file_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let service = service_with(Vec::new(), &config);

    let err = service
        .ingest_file(
            &dir.path().join("absent.pdf"),
            &ChunkMetadata::document("absent.pdf", "pdf"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::NotFound(_)));
}

#[tokio::test]
async fn test_batch_reports_per_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let service = service_with(Vec::new(), &config);

    let docs = dir.path().join("docs");
    std::fs::create_dir(&docs).unwrap();
    write_file(
        &docs,
        "policy.md",
        "# Retention\n\nPersonal data is deleted after 30 days unless a legal hold applies.",
    );
    write_file(&docs, "blank.txt", "   \n\n  ");

    let mut seen = Vec::new();
    let report = service
        .ingest_paths(
            &[docs.clone(), dir.path().join("gone.txt")],
            &[],
            |outcome| seen.push(outcome.path.clone()),
        )
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 2);
    assert_eq!(seen.len(), 3);
    assert!(report.chunks_added >= 1);

    let hits = service.search("legal hold", Some(1)).await.unwrap();
    assert_eq!(hits.results[0].chunk.metadata.source_name, "policy.md");
}

#[tokio::test]
async fn test_batch_with_no_valid_files_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let service = service_with(Vec::new(), &config);
    write_file(dir.path(), "image.png", "not really a png");

    let err = service
        .ingest_paths(&[dir.path().join("image.png")], &[], |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::NoValidFiles));
}

#[tokio::test]
async fn test_reload_reproduces_search() {
    let dir = tempfile::tempdir().unwrap();
    let index_dir = dir.path().join("index");
    let embedder = Arc::new(HashingEmbedder::new(128));

    let index = EmbeddingIndex::load(&index_dir, embedder.clone());
    let chunks = [
        "Breach notification is due within 72 hours.",
        "Access reviews run every quarter.",
        "Encryption at rest uses AES-256.",
    ]
    .iter()
    .enumerate()
    .map(|(i, text)| Chunk::new(text.to_string(), ChunkMetadata::document("controls.txt", "txt"), i))
    .collect();
    index.add(chunks).await.unwrap();
    let before = index.search("how fast must a breach be reported", 2).await.unwrap();
    drop(index);

    let reloaded = EmbeddingIndex::load(&index_dir, embedder);
    let after = reloaded
        .search("how fast must a breach be reported", 2)
        .await
        .unwrap();

    assert_eq!(reloaded.len(), 3);
    assert_eq!(before, after);
    assert_eq!(after[0].chunk.metadata.entry_kind, EntryKind::RegulatoryChunk);
}
