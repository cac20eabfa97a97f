use std::borrow::Cow;
use std::path::Path;

use ndarray::{ArrayViewD, IxDyn};
use ort::session::{Session, SessionInputValue, builder::GraphOptimizationLevel};
use ort::value::Tensor;
use parking_lot::Mutex;
use tokenizers::Tokenizer;
use tokenizers::{Encoding, PaddingParams, PaddingStrategy, TruncationParams, TruncationStrategy};

use crate::error::ModelError;
use crate::models::{EmbeddingConfig, Pooling};

/// Sentence embedding model loaded from `model.onnx` + `tokenizer.json`.
pub struct EmbeddingModel {
    session: Mutex<Session>,
    input_names: Vec<String>,
    tokenizer: Tokenizer,
    dimension: usize,
    pooling: Pooling,
}

impl EmbeddingModel {
    pub fn load(config: &EmbeddingConfig, model_dir: &Path) -> Result<Self, ModelError> {
        let (session, tokenizer) = load_session(model_dir, config.max_tokens as usize)?;
        let input_names = session.inputs.iter().map(|i| i.name.clone()).collect();
        tracing::info!(
            model = %config.model_id,
            dir = %model_dir.display(),
            dimension = config.dimension,
            "loaded ONNX embedding model"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_names,
            tokenizer,
            dimension: config.dimension as usize,
            pooling: config.pooling,
        })
    }

    pub fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
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
        let hidden = ArrayViewD::from_shape(IxDyn(&dims), data)
            .map_err(|e| ModelError::InferenceError(e.to_string()))?;

        match dims.len() {
            3 => Ok((0..batch.batch_size)
                .map(|i| normalize(&self.pool(&hidden, &batch, i)))
                .collect()),
            2 => Ok((0..batch.batch_size)
                .map(|i| {
                    let row: Vec<f32> = (0..self.dimension.min(dims[1]))
                        .map(|d| hidden[[i, d].as_slice()])
                        .collect();
                    normalize(&row)
                })
                .collect()),
            _ => Err(ModelError::InferenceError(format!(
                "unexpected output shape: {:?}",
                dims
            ))),
        }
    }

    fn pool(&self, hidden: &ArrayViewD<f32>, batch: &EncodedBatch, row: usize) -> Vec<f32> {
        let dim = self.dimension.min(hidden.shape()[2]);
        let seq_len = batch.lengths[row];
        match self.pooling {
            Pooling::Cls => (0..dim).map(|d| hidden[[row, 0, d].as_slice()]).collect(),
            Pooling::LastToken => {
                let last = seq_len.saturating_sub(1);
                (0..dim).map(|d| hidden[[row, last, d].as_slice()]).collect()
            }
            Pooling::Mean => {
                let count = seq_len.max(1) as f32;
                (0..dim)
                    .map(|d| {
                        (0..seq_len)
                            .map(|t| hidden[[row, t, d].as_slice()])
                            .sum::<f32>()
                            / count
                    })
                    .collect()
            }
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Open an ONNX session and its tokenizer with truncation and batch padding configured.
pub(crate) fn load_session(
    model_dir: &Path,
    max_tokens: usize,
) -> Result<(Session, Tokenizer), ModelError> {
    let model_path = model_dir.join("model.onnx");
    let tokenizer_path = model_dir.join("tokenizer.json");

    if !model_path.exists() {
        return Err(ModelError::NotFound(model_path.display().to_string()));
    }

    let session = Session::builder()
        .map_err(|e: ort::Error| ModelError::LoadError(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e: ort::Error| ModelError::LoadError(e.to_string()))?
        .with_intra_threads(num_cpus())
        .map_err(|e: ort::Error| ModelError::LoadError(e.to_string()))?
        .commit_from_file(&model_path)
        .map_err(|e: ort::Error| ModelError::LoadError(e.to_string()))?;

    let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| ModelError::TokenizerError(e.to_string()))?;

    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: max_tokens,
            strategy: TruncationStrategy::LongestFirst,
            ..Default::default()
        }))
        .map_err(|e| ModelError::TokenizerError(e.to_string()))?;

    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::BatchLongest,
        ..Default::default()
    }));

    Ok((session, tokenizer))
}

/// Padded `[batch, seq]` id/mask/type tensors for BERT-family models.
pub(crate) struct EncodedBatch {
    pub batch_size: usize,
    pub max_len: usize,
    /// Unpadded token count per row
    pub lengths: Vec<usize>,
    input_ids: Vec<i64>,
    attention_mask: Vec<i64>,
    token_type_ids: Vec<i64>,
}

impl EncodedBatch {
    pub fn from_encodings(encodings: &[Encoding]) -> Self {
        let batch_size = encodings.len();
        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0);

        let mut input_ids = vec![0i64; batch_size * max_len];
        let mut attention_mask = vec![0i64; batch_size * max_len];
        let mut token_type_ids = vec![0i64; batch_size * max_len];
        let mut lengths = Vec::with_capacity(batch_size);

        for (i, encoding) in encodings.iter().enumerate() {
            let mask = encoding.get_attention_mask();
            lengths.push(mask.iter().filter(|&&m| m == 1).count());
            for (j, ((&id, &m), &t)) in encoding
                .get_ids()
                .iter()
                .zip(mask)
                .zip(encoding.get_type_ids())
                .enumerate()
            {
                input_ids[i * max_len + j] = i64::from(id);
                attention_mask[i * max_len + j] = i64::from(m);
                token_type_ids[i * max_len + j] = i64::from(t);
            }
        }

        Self {
            batch_size,
            max_len,
            lengths,
            input_ids,
            attention_mask,
            token_type_ids,
        }
    }

    /// Feed only the inputs the graph declares, matched by name.
    pub fn session_inputs(
        &self,
        input_names: &[String],
    ) -> Result<Vec<(Cow<'static, str>, SessionInputValue<'static>)>, ModelError> {
        let shape = [self.batch_size, self.max_len];
        input_names
            .iter()
            .map(|name| {
                let data = match name.as_str() {
                    "input_ids" => self.input_ids.clone(),
                    "attention_mask" => self.attention_mask.clone(),
                    "token_type_ids" => self.token_type_ids.clone(),
                    "position_ids" => (0..self.batch_size)
                        .flat_map(|_| 0..self.max_len as i64)
                        .collect(),
                    other => {
                        return Err(ModelError::InferenceError(format!(
                            "unsupported model input: {}",
                            other
                        )));
                    }
                };
                let tensor = Tensor::from_array((shape, data))
                    .map_err(|e: ort::Error| ModelError::InferenceError(e.to_string()))?;
                Ok((Cow::Owned(name.clone()), tensor.into()))
            })
            .collect()
    }
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_model_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = EmbeddingModel::load(&EmbeddingConfig::default(), dir.path())
            .err()
            .unwrap();
        assert!(matches!(err, ModelError::NotFound(_)));
    }

    #[test]
    fn test_normalize() {
        let v = normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
