mod assessment;
mod chunk;
mod config;
mod conversation;
mod persona;
mod search;

pub use assessment::{
    AnswerPath, Assessment, ComplianceStatus, ConversationType, EMPTY_RESPONSE_PLACEHOLDER,
    QueryResponse, SourceCitation,
};
pub use chunk::{Chunk, ChunkMetadata, EntryKind, KnowledgeEntry};
pub use config::{
    APP_DIR_NAME, ChunkingConfig, Config, DEFAULT_EMBEDDING_DIMENSION, DEFAULT_EMBEDDING_MODEL,
    DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_METRICS_RETENTION_DAYS, DaemonConfig, EmbeddingConfig,
    EmbeddingProvider, FollowUpConfig, GenerationConfig, HistoryBackend, HistoryConfig,
    IndexConfig, IngestConfig, LogConfig, MetricsConfig, Pooling, ProviderConfig, RerankConfig,
    RerankerKind, RetrievalConfig, TokenBudgetConfig,
};
pub use conversation::{ConversationTurn, SessionSummary, TurnRole, format_history};
pub use persona::Persona;
pub use search::{OutputFormat, SearchHit, SearchResults};
