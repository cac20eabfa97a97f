pub mod chunker;
pub mod embedding;
pub mod followup;
pub mod history;
pub mod index;
pub mod ingest;
pub mod knowledge_base;
mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod reranker;
pub mod token_budget;

pub use chunker::{TextChunker, provenance_header};
pub use embedding::{Embedder, HashingEmbedder, SharedEmbedder, create_embedder};
pub use followup::{FollowUpCatalog, FollowUpSuggester};
pub use history::{HistoryStore, InMemoryHistoryStore, SharedHistory, SqliteHistoryStore};
pub use index::{EmbeddingIndex, IndexStats, IndexWrite};
pub use ingest::{FileOutcome, IngestReport, Ingestor};
pub use metrics::{MetricsStore, MetricsSummary};
pub use orchestrator::{Answer, AnswerOrchestrator};
pub use pipeline::{AskRequest, ComplianceService, ImportReport, ServiceStatus};
pub use reranker::{Reranker, SharedReranker, create_reranker};
pub use token_budget::TokenBudget;
