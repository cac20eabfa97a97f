//! Second-stage relevance scoring of retrieved candidates.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use ndarray::{ArrayViewD, IxDyn};
use ort::session::Session;
use parking_lot::Mutex;
use tokenizers::Tokenizer;

use crate::error::{ModelError, RerankError};
use crate::models::{Config, RerankConfig, RerankerKind};
use crate::server::embedding::{EncodedBatch, load_session};

/// Scores `(query, passage)` pairs; higher is more relevant.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, RerankError>;
}

pub type SharedReranker = Arc<dyn Reranker>;

/// Build the reranker selected in config, or `None` when reranking is disabled.
pub fn create_reranker(config: &RerankConfig) -> Result<Option<SharedReranker>, ModelError> {
    if !config.enabled {
        return Ok(None);
    }
    match config.kind {
        RerankerKind::Keyword => Ok(Some(Arc::new(KeywordReranker))),
        RerankerKind::CrossEncoder => {
            let dir = config
                .model_path
                .clone()
                .or_else(|| Config::models_dir().map(|d| d.join("reranker")))
                .ok_or_else(|| {
                    ModelError::NotFound("could not determine reranker model directory".into())
                })?;
            let model = CrossEncoderReranker::load(&dir, config.max_seq_len as usize)?;
            Ok(Some(Arc::new(model)))
        }
    }
}

/// Term-overlap scorer: stopword-filtered query terms, sqrt term frequency,
/// length-derived specificity, position and coverage weighting, squashed to 0..1.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordReranker;

impl KeywordReranker {
    const STOPWORDS: &'static [&'static str] = &[
        "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has",
        "had", "do", "does", "did", "will", "would", "could", "should", "may", "might", "must",
        "shall", "can", "to", "of", "in", "for", "on", "with", "at", "by", "from", "as", "into",
        "about", "and", "or", "but", "if", "then", "than", "so", "not", "no", "how", "what",
        "which", "who", "whom", "when", "where", "why", "this", "that", "these", "those", "it",
        "its", "i", "me", "my", "we", "our", "us", "you", "your", "they", "them", "their",
    ];

    fn terms(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn score_pair(query: &str, passage: &str) -> f32 {
        let stopwords: HashSet<&str> = Self::STOPWORDS.iter().copied().collect();
        let query_terms: Vec<String> = Self::terms(query)
            .into_iter()
            .filter(|w| w.len() > 1 && !stopwords.contains(w.as_str()))
            .collect();
        if query_terms.is_empty() {
            return 0.0;
        }

        let doc_terms = Self::terms(passage);
        let doc_len = doc_terms.len().max(1) as f32;
        let length_norm = 1.0 / (1.0 + (doc_len / 50.0).sqrt());

        let mut total = 0.0f32;
        let mut matched = 0usize;
        for (pos, term) in query_terms.iter().enumerate() {
            let tf = doc_terms.iter().filter(|w| *w == term).count() as f32;
            if tf > 0.0 {
                matched += 1;
                let specificity = (1.0 + term.len() as f32).ln();
                let position_weight = 1.0 / (1.0 + pos as f32 * 0.1);
                total += tf.sqrt() * specificity * position_weight * length_norm;
            }
        }

        let coverage = matched as f32 / query_terms.len() as f32;
        let raw = total + coverage * 0.3;
        (raw / (raw + 1.0)).min(1.0)
    }
}

#[async_trait]
impl Reranker for KeywordReranker {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, RerankError> {
        Ok(passages
            .iter()
            .map(|p| Self::score_pair(query, p))
            .collect())
    }
}

/// ONNX cross-encoder (e.g. `BAAI/bge-reranker-base`) producing one logit per pair.
pub struct CrossEncoderReranker {
    inner: Arc<CrossEncoderModel>,
}

struct CrossEncoderModel {
    session: Mutex<Session>,
    input_names: Vec<String>,
    tokenizer: Tokenizer,
}

impl CrossEncoderReranker {
    pub fn load(model_dir: &Path, max_seq_len: usize) -> Result<Self, ModelError> {
        let (session, tokenizer) = load_session(model_dir, max_seq_len)?;
        let input_names = session.inputs.iter().map(|i| i.name.clone()).collect();
        tracing::info!(dir = %model_dir.display(), "loaded cross-encoder reranker");
        Ok(Self {
            inner: Arc::new(CrossEncoderModel {
                session: Mutex::new(session),
                input_names,
                tokenizer,
            }),
        })
    }
}

impl CrossEncoderModel {
    fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, ModelError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        let pairs: Vec<(String, String)> = passages
            .iter()
            .map(|p| (query.to_string(), p.clone()))
            .collect();
        let encodings = self
            .tokenizer
            .encode_batch(pairs, true)
            .map_err(|e| ModelError::TokenizerError(e.to_string()))?;
        let batch = EncodedBatch::from_encodings(&encodings);
        let inputs = batch.session_inputs(&self.input_names)?;

        let mut session = self.session.lock();
        let outputs = session
            .run(inputs)
            .map_err(|e: ort::Error| ModelError::InferenceError(e.to_string()))?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e: ort::Error| ModelError::InferenceError(e.to_string()))?;
        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        let logits = ArrayViewD::from_shape(IxDyn(&dims), data)
            .map_err(|e| ModelError::InferenceError(e.to_string()))?;

        // [batch] or [batch, 1]: single relevance logit. [batch, 2]: take the positive class.
        let scores = (0..batch.batch_size)
            .map(|i| match dims.as_slice() {
                [_] => logits[[i].as_slice()],
                [_, 1] => logits[[i, 0].as_slice()],
                [_, n] => logits[[i, n - 1].as_slice()],
                _ => f32::NAN,
            })
            .map(sigmoid)
            .collect::<Vec<_>>();

        if scores.iter().any(|s| s.is_nan()) {
            return Err(ModelError::InferenceError(format!(
                "unexpected logits shape: {:?}",
                dims
            )));
        }
        Ok(scores)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    fn name(&self) -> &str {
        "cross_encoder"
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, RerankError> {
        let model = Arc::clone(&self.inner);
        let query = query.to_string();
        let passages = passages.to_vec();
        let scores = tokio::task::spawn_blocking(move || model.score(&query, &passages))
            .await
            .map_err(|e| RerankError::Task(e.to_string()))??;
        Ok(scores)
    }
}
