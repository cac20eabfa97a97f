use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::persona::Persona;
use super::search::OutputFormat;
use crate::error::ConfigError;

pub const APP_DIR_NAME: &str = "compliance-rag";
pub const CONFIG_ENV_VAR: &str = "CRAG_CONFIG";
pub const DEFAULT_EMBEDDING_URL: &str = "http://localhost:11411";
pub const DEFAULT_EMBEDDING_MODEL: &str = "BAAI/bge-small-en-v1.5";
pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 384;
pub const DEFAULT_QUERY_INSTRUCTION: &str =
    "Represent this sentence for searching relevant passages: ";
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_METRICS_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub token_budget: TokenBudgetConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub followups: FollowUpConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    /// Config file location: `$CRAG_CONFIG` if set, otherwise the per-user config dir.
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR)
            && !path.trim().is_empty()
        {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|p| p.join(APP_DIR_NAME).join("config.toml"))
    }

    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|p| p.join(APP_DIR_NAME))
    }

    pub fn models_dir() -> Option<PathBuf> {
        Self::data_dir().map(|p| p.join("models"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::config_path().ok_or_else(|| {
            ConfigError::PathError("could not determine config directory".to_string())
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "chunking.chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(ConfigError::ValidationError(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            )));
        }
        if self.embedding.dimension == 0 {
            return Err(ConfigError::ValidationError(
                "embedding.dimension must be greater than zero".to_string(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(ConfigError::ValidationError(
                "retrieval.top_k must be at least 1".to_string(),
            ));
        }
        if self.retrieval.rerank.oversample == 0 {
            return Err(ConfigError::ValidationError(
                "retrieval.rerank.oversample must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn data_file(name: &str) -> PathBuf {
        Self::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(name)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.index
            .path
            .clone()
            .unwrap_or_else(|| Self::data_file("index"))
    }

    pub fn history_db_path(&self) -> PathBuf {
        self.history
            .path
            .clone()
            .unwrap_or_else(|| Self::data_file("history.db"))
    }

    pub fn metrics_db_path(&self) -> PathBuf {
        self.metrics
            .path
            .clone()
            .unwrap_or_else(|| Self::data_file("metrics.db"))
    }

    pub fn followups_path(&self) -> PathBuf {
        self.followups
            .catalog_path
            .clone()
            .unwrap_or_else(|| Self::data_file("followups.json"))
    }

    pub fn socket_path(&self) -> PathBuf {
        self.daemon
            .socket_path
            .clone()
            .unwrap_or_else(|| Self::data_file("crag.sock"))
    }

    pub fn pid_path(&self) -> PathBuf {
        self.socket_path().with_extension("pid")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// Deterministic feature hashing, no model required
    #[default]
    Hashing,
    /// Remote embedding server exposing `/embed`
    Http,
    /// Local ONNX sentence model
    Onnx,
}

impl std::fmt::Display for EmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingProvider::Hashing => write!(f, "hashing"),
            EmbeddingProvider::Http => write!(f, "http"),
            EmbeddingProvider::Onnx => write!(f, "onnx"),
        }
    }
}

/// How token states are reduced to one sentence vector by ONNX models.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pooling {
    /// First token (BERT/BGE style)
    #[default]
    Cls,
    Mean,
    /// Last non-padding token (decoder style)
    LastToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProvider,

    #[serde(default = "default_embedding_url")]
    pub url: String,

    #[serde(default = "default_embedding_model")]
    pub model_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,

    #[serde(default = "default_embedding_dimension")]
    pub dimension: u32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub pooling: Pooling,

    #[serde(default = "default_query_instruction")]
    pub query_instruction: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_embedding_url() -> String {
    DEFAULT_EMBEDDING_URL.to_string()
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_embedding_dimension() -> u32 {
    DEFAULT_EMBEDDING_DIMENSION
}

fn default_max_tokens() -> u32 {
    512
}

fn default_query_instruction() -> String {
    DEFAULT_QUERY_INSTRUCTION.to_string()
}

fn default_timeout() -> u64 {
    120
}

fn default_batch_size() -> u32 {
    16
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            url: default_embedding_url(),
            model_id: default_embedding_model(),
            model_path: None,
            dimension: default_embedding_dimension(),
            max_tokens: default_max_tokens(),
            pooling: Pooling::default(),
            query_instruction: default_query_instruction(),
            timeout_secs: default_timeout(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Target chunk length in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Characters shared between consecutive chunks
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Binary used to extract text from PDF files
    #[serde(default = "default_pdftotext")]
    pub pdftotext: String,
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        "**/.git/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/target/**".to_string(),
        "**/__pycache__/**".to_string(),
        "**/.venv/**".to_string(),
        "**/*.lock".to_string(),
    ]
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}

fn default_pdftotext() -> String {
    "pdftotext".to_string()
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: default_exclude_patterns(),
            max_file_size: default_max_file_size(),
            pdftotext: default_pdftotext(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default)]
    pub rerank: RerankConfig,
}

fn default_top_k() -> usize {
    5
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            rerank: RerankConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankerKind {
    #[default]
    Keyword,
    CrossEncoder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub kind: RerankerKind,

    /// Directory holding `model.onnx` and `tokenizer.json` for the cross-encoder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,

    /// Candidates fetched per requested result before rescoring
    #[serde(default = "default_oversample")]
    pub oversample: usize,

    #[serde(default = "default_max_tokens")]
    pub max_seq_len: u32,
}

fn default_oversample() -> usize {
    3
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: RerankerKind::default(),
            model_path: None,
            oversample: default_oversample(),
            max_seq_len: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,

    /// Base URL of an OpenAI-compatible API
    pub endpoint: String,

    pub model: String,

    /// Environment variable holding the API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_completion_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_temperature() -> f32 {
    0.3
}

fn default_completion_tokens() -> u32 {
    1024
}

fn default_provider_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

impl ProviderConfig {
    pub fn groq() -> Self {
        Self {
            name: "groq".to_string(),
            endpoint: "https://api.groq.com/openai/v1".to_string(),
            model: "llama-3.3-70b-versatile".to_string(),
            api_key_env: Some("GROQ_API_KEY".to_string()),
            temperature: default_temperature(),
            max_tokens: default_completion_tokens(),
            timeout_secs: default_provider_timeout(),
            max_retries: default_max_retries(),
        }
    }

    pub fn openrouter() -> Self {
        Self {
            name: "openrouter".to_string(),
            endpoint: "https://openrouter.ai/api/v1".to_string(),
            model: "google/gemini-2.0-flash-exp:free".to_string(),
            api_key_env: Some("OPENROUTER_API_KEY".to_string()),
            temperature: default_temperature(),
            max_tokens: default_completion_tokens(),
            timeout_secs: default_provider_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Tried in order; later entries are used when earlier providers are unreachable
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub default_persona: Persona,
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![ProviderConfig::groq(), ProviderConfig::openrouter()]
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            default_persona: Persona::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudgetConfig {
    /// HuggingFace `tokenizer.json`; the built-in word/punctuation counter is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_path: Option<PathBuf>,

    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,

    #[serde(default = "default_safety_margin")]
    pub safety_margin: usize,

    #[serde(default = "default_min_context_tokens")]
    pub min_context_tokens: usize,

    #[serde(default = "default_history_tail_chars")]
    pub history_tail_chars: usize,
}

fn default_max_input_tokens() -> usize {
    6000
}

fn default_safety_margin() -> usize {
    500
}

fn default_min_context_tokens() -> usize {
    1000
}

fn default_history_tail_chars() -> usize {
    2000
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        Self {
            tokenizer_path: None,
            max_input_tokens: default_max_input_tokens(),
            safety_margin: default_safety_margin(),
            min_context_tokens: default_min_context_tokens(),
            history_tail_chars: default_history_tail_chars(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default)]
    pub backend: HistoryBackend,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Turns loaded as conversational context per query
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
}

fn default_fetch_limit() -> usize {
    20
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: HistoryBackend::default(),
            path: None,
            fetch_limit: default_fetch_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_path: Option<PathBuf>,

    #[serde(default = "default_max_curated")]
    pub max_curated: usize,

    #[serde(default = "default_max_general")]
    pub max_general: usize,
}

fn default_max_curated() -> usize {
    3
}

fn default_max_general() -> usize {
    2
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            catalog_path: None,
            max_curated: default_max_curated(),
            max_general: default_max_general(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub auto_start: bool,
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            idle_timeout_secs: default_idle_timeout(),
            auto_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    DEFAULT_METRICS_RETENTION_DAYS
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub default_format: OutputFormat,
}
