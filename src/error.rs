//! Error types for the compliance assistant.

use std::path::PathBuf;

use thiserror::Error;

use crate::utils::retry::Retryable;

/// Errors related to embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("failed to connect to embedding server: {0}")]
    ConnectionError(String),

    #[error("embedding server error: {0}")]
    ServerError(String),

    #[error("embedding request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("embedding model error: {0}")]
    Model(#[from] ModelError),

    #[error("embedding timeout")]
    Timeout,
}

impl Retryable for EmbeddingError {
    fn is_retryable(&self) -> bool {
        match self {
            EmbeddingError::ConnectionError(_) | EmbeddingError::Timeout => true,
            EmbeddingError::ServerError(msg) => {
                msg.contains("503")
                    || msg.contains("502")
                    || msg.contains("504")
                    || msg.contains("429")
                    || msg.to_lowercase().contains("unavailable")
                    || msg.to_lowercase().contains("too many requests")
            }
            EmbeddingError::RequestError(e) => e.is_timeout() || e.is_connect(),
            EmbeddingError::InvalidResponse(_) | EmbeddingError::Model(_) => false,
        }
    }
}

/// Errors raised while loading or running local ONNX models.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model not found: {0}")]
    NotFound(String),

    #[error("failed to load model: {0}")]
    LoadError(String),

    #[error("tokenizer error: {0}")]
    TokenizerError(String),

    #[error("inference error: {0}")]
    InferenceError(String),
}

#[derive(Debug, Error)]
pub enum RerankError {
    #[error("reranker model error: {0}")]
    Model(#[from] ModelError),

    #[error("reranker returned {actual} scores for {expected} passages")]
    ScoreCount { expected: usize, actual: usize },

    #[error("reranker task failed: {0}")]
    Task(String),
}

/// Errors related to the embedding index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("embedding dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedder returned {actual} vectors for {expected} chunks")]
    VectorCountMismatch { expected: usize, actual: usize },

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt index: {0}")]
    Corrupt(String),

    #[error("index write task failed: {0}")]
    Task(String),
}

/// Errors related to document ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("unsupported file type: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("no valid files to ingest")]
    NoValidFiles,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

/// Errors reported by a single LLM provider.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider unreachable: {0}")]
    Network(String),

    #[error("provider timed out")]
    Timeout,

    #[error("provider rate limited: {0}")]
    RateLimited(String),

    #[error("provider API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("provider configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

impl LlmError {
    /// The provider could not serve the request at all; another provider may.
    pub fn is_provider_failure(&self) -> bool {
        match self {
            LlmError::Network(_)
            | LlmError::Timeout
            | LlmError::RateLimited(_)
            | LlmError::Configuration(_) => true,
            LlmError::Api { status, .. } => *status >= 500 || *status == 401 || *status == 403,
            LlmError::InvalidResponse(_) => false,
        }
    }
}

impl Retryable for LlmError {
    fn is_retryable(&self) -> bool {
        match self {
            LlmError::Network(_) | LlmError::Timeout | LlmError::RateLimited(_) => true,
            LlmError::Api { status, .. } => matches!(status, 502..=504),
            LlmError::InvalidResponse(_) | LlmError::Configuration(_) => false,
        }
    }
}

/// Errors from one generation attempt of the answer pipeline.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{0}")]
    Provider(#[from] LlmError),

    #[error("all providers failed: {}", .0.join("; "))]
    Exhausted(Vec<String>),

    #[error("model output did not match the assessment schema: {0}")]
    MalformedOutput(String),

    #[error("model returned an empty answer")]
    EmptyOutput,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("history IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("history task failed: {0}")]
    Task(String),

    #[error("corrupt history record: {0}")]
    Corrupt(String),
}

/// Errors related to configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("path error: {0}")]
    PathError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

/// Errors talking to the local daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon is not running")]
    NotRunning,

    #[error("failed to spawn daemon: {0}")]
    SpawnError(String),

    #[error("timed out waiting for daemon")]
    Timeout,

    #[error("failed to connect to daemon: {0}")]
    ConnectionFailed(String),

    #[error("socket error: {0}")]
    SocketError(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("daemon error: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application-level errors that wrap domain errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("history error: {0}")]
    History(#[from] HistoryError),

    #[error("provider error: {0}")]
    Llm(#[from] LlmError),

    #[error("daemon error: {0}")]
    Daemon(#[from] DaemonError),

    #[error("{0}")]
    Other(String),
}
