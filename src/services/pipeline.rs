//! The assembled service: one shared index, one history store, one
//! orchestrator. Both the CLI (in-process) and the daemon drive this.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, HistoryError, IndexError, IngestError};
use crate::llm::ProviderChain;
use crate::models::{
    ChunkMetadata, Config, ConversationTurn, IngestConfig, Persona, QueryResponse, SearchHit,
    SearchResults, SessionSummary, TurnRole, format_history,
};
use crate::services::chunker::TextChunker;
use crate::services::embedding::create_embedder;
use crate::services::followup::FollowUpSuggester;
use crate::services::history::{SharedHistory, open_history};
use crate::services::index::{EmbeddingIndex, IndexStats};
use crate::services::ingest::{FileOutcome, IngestReport, Ingestor};
use crate::services::knowledge_base::{entry_to_chunk, load_entries};
use crate::services::orchestrator::AnswerOrchestrator;
use crate::services::reranker::create_reranker;
use crate::services::token_budget::TokenBudget;

/// Query boundary input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AskRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<Persona>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl AskRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub entries: usize,
    pub chunks_added: usize,
    /// Entries already indexed under the same id, or repeated within the file
    #[serde(default)]
    pub chunks_skipped: usize,
    pub followups_merged: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub index: IndexStats,
    /// `name/model` in failover order
    pub providers: Vec<String>,
    pub default_persona: Persona,
    pub curated_followups: usize,
}

pub struct ComplianceService {
    index: Arc<EmbeddingIndex>,
    history: SharedHistory,
    orchestrator: AnswerOrchestrator,
    chunker: TextChunker,
    ingest: IngestConfig,
    top_k: usize,
    fetch_limit: usize,
    default_persona: Persona,
}

impl ComplianceService {
    pub fn new(
        index: Arc<EmbeddingIndex>,
        history: SharedHistory,
        orchestrator: AnswerOrchestrator,
        config: &Config,
    ) -> Self {
        Self {
            index,
            history,
            orchestrator,
            chunker: TextChunker::new(&config.chunking),
            ingest: config.ingest.clone(),
            top_k: config.retrieval.top_k,
            fetch_limit: config.history.fetch_limit,
            default_persona: config.generation.default_persona,
        }
    }

    /// Wire every component from config. The persisted index is loaded once
    /// here and shared for the lifetime of the service.
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let embedder = create_embedder(&config.embedding)?;
        let reranker = create_reranker(&config.retrieval.rerank)?;
        let index = EmbeddingIndex::load(&config.index_dir(), embedder)
            .with_reranker(reranker, config.retrieval.rerank.oversample);

        let history = open_history(&config.history, &config.history_db_path())?;
        let followups = Arc::new(FollowUpSuggester::load(
            &config.followups_path(),
            &config.followups,
        ));
        let providers = ProviderChain::from_config(&config.generation)?;
        let budget = TokenBudget::from_config(&config.token_budget);
        let orchestrator = AnswerOrchestrator::new(providers, budget, followups);

        Ok(Self::new(Arc::new(index), history, orchestrator, config))
    }

    pub fn index(&self) -> &Arc<EmbeddingIndex> {
        &self.index
    }

    /// Answer one question. Never fails: retrieval and history problems are
    /// logged and the orchestrator degrades to a safe answer on its own.
    pub async fn ask(&self, request: AskRequest) -> QueryResponse {
        let start = Instant::now();
        let query = request.query.trim();
        let session_id = request
            .session_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let persona = request.persona.unwrap_or(self.default_persona);
        let user_id = request.user_id.as_deref();

        let turns = match self.history.fetch(&session_id, self.fetch_limit).await {
            Ok(turns) => turns,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "failed to load history");
                Vec::new()
            }
        };

        let hits = self.retrieve(query).await;
        let answer = self
            .orchestrator
            .answer(query, &format_history(&turns), persona, &hits)
            .await;

        self.record_turn(&session_id, TurnRole::User, query, user_id)
            .await;
        self.record_turn(
            &session_id,
            TurnRole::Assistant,
            &answer.assessment.response,
            user_id,
        )
        .await;

        tracing::info!(
            session_id = %session_id,
            path = %answer.path,
            hits = hits.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "query answered"
        );

        QueryResponse {
            session_id,
            data: answer.assessment,
            path: Some(answer.path),
        }
    }

    async fn retrieve(&self, query: &str) -> Vec<SearchHit> {
        match self.index.search(query, self.top_k).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "retrieval failed, answering without documents");
                Vec::new()
            }
        }
    }

    async fn record_turn(
        &self,
        session_id: &str,
        role: TurnRole,
        content: &str,
        user_id: Option<&str>,
    ) {
        if let Err(e) = self.history.append(session_id, role, content, user_id).await {
            tracing::warn!(session_id, role = role.as_str(), error = %e, "failed to save turn");
        }
    }

    pub async fn search(&self, query: &str, limit: Option<usize>) -> Result<SearchResults, IndexError> {
        let start = Instant::now();
        let hits = self.index.search(query, limit.unwrap_or(self.top_k)).await?;
        Ok(SearchResults::new(
            query.to_string(),
            hits,
            self.index.is_reranking(),
            start.elapsed().as_millis() as u64,
        ))
    }

    /// Ingestion boundary for one file with caller-supplied provenance.
    pub async fn ingest_file(&self, path: &Path, metadata: &ChunkMetadata) -> Result<usize, IngestError> {
        Ingestor::new(&self.chunker, &self.index, &self.ingest)
            .ingest_file(path, metadata)
            .await
    }

    pub async fn ingest_paths(
        &self,
        paths: &[PathBuf],
        exclude: &[String],
        on_file: impl FnMut(&FileOutcome),
    ) -> Result<IngestReport, IngestError> {
        Ingestor::new(&self.chunker, &self.index, &self.ingest)
            .ingest_batch(paths, exclude, on_file)
            .await
    }

    /// Import curated entries: each becomes one `kb_entry` chunk, and its
    /// follow-up questions join the catalog.
    pub async fn import_entries(&self, path: &Path) -> Result<ImportReport, IngestError> {
        let entries = load_entries(path).await?;
        let chunks = entries.iter().map(entry_to_chunk).collect();
        let write = self.index.add(chunks).await?;

        let followups_merged = match self.orchestrator.followups().merge_entries(&entries) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "failed to save follow-up catalog");
                0
            }
        };

        tracing::info!(
            path = %path.display(),
            entries = entries.len(),
            added = write.added,
            skipped = write.skipped,
            followups = followups_merged,
            "imported knowledge-base entries"
        );
        Ok(ImportReport {
            entries: entries.len(),
            chunks_added: write.added,
            chunks_skipped: write.skipped,
            followups_merged,
        })
    }

    pub async fn history(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationTurn>, HistoryError> {
        self.history
            .fetch(session_id, limit.unwrap_or(self.fetch_limit))
            .await
    }

    pub async fn sessions(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>, HistoryError> {
        self.history.recent_sessions(user_id, limit).await
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            index: self.index.stats(),
            providers: self.orchestrator.providers().describe(),
            default_persona: self.default_persona,
            curated_followups: self.orchestrator.followups().curated_count(),
        }
    }
}
