//! Brute-force cosine index over chunk embeddings, persisted to a directory.
//!
//! On-disk layout:
//!
//! ```text
//! <dir>/manifest.json        version, model, dimension, count, generation, checksum
//! <dir>/vectors-<gen>.bin    count * dimension little-endian f32, row-major
//! <dir>/chunks-<gen>.json    chunk records in row order
//! ```
//!
//! Data files for a new generation are written first; the manifest is swapped
//! in last with a rename, so a reader only ever sees a complete generation.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::IndexError;
use crate::models::{Chunk, EntryKind, SearchHit};
use crate::services::embedding::SharedEmbedder;
use crate::services::reranker::SharedReranker;
use crate::utils::calculate_checksum;

pub const INDEX_FORMAT_VERSION: u32 = 1;
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    embedding_model: String,
    dimension: usize,
    count: usize,
    generation: u64,
    vectors_file: String,
    chunks_file: String,
    vectors_sha256: String,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct IndexState {
    /// Row-major, L2-normalised
    vectors: Vec<f32>,
    chunks: Vec<Chunk>,
    rows_by_id: HashMap<String, usize>,
    generation: u64,
}

impl IndexState {
    fn row(&self, i: usize, dim: usize) -> &[f32] {
        &self.vectors[i * dim..(i + 1) * dim]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub chunks: usize,
    pub kb_entries: usize,
    pub sources: usize,
    pub dimension: usize,
    pub embedding_model: String,
    pub reranker: Option<String>,
    pub generation: u64,
}

/// Outcome of one `add` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexWrite {
    pub added: usize,
    /// Chunks whose id was already indexed or repeated later in the batch
    pub skipped: usize,
}

pub struct EmbeddingIndex {
    dir: Option<PathBuf>,
    embedder: SharedEmbedder,
    reranker: Option<SharedReranker>,
    oversample: usize,
    state: Arc<RwLock<IndexState>>,
    /// Serialises writers so each persisted generation extends the previous one
    write_lock: Mutex<()>,
}

impl EmbeddingIndex {
    /// Empty index that lives only in memory.
    pub fn in_memory(embedder: SharedEmbedder) -> Self {
        Self {
            dir: None,
            embedder,
            reranker: None,
            oversample: 3,
            state: Arc::new(RwLock::new(IndexState::default())),
            write_lock: Mutex::new(()),
        }
    }

    /// Open the index persisted in `dir`. A missing, corrupt, or incompatible
    /// index is logged and replaced by an empty one; this never fails.
    pub fn load(dir: &Path, embedder: SharedEmbedder) -> Self {
        let state = match read_persisted(dir, embedder.model_name(), embedder.dimension()) {
            Ok(Some(state)) => {
                tracing::info!(
                    dir = %dir.display(),
                    chunks = state.chunks.len(),
                    generation = state.generation,
                    "loaded embedding index"
                );
                state
            }
            Ok(None) => {
                tracing::debug!(dir = %dir.display(), "no persisted index, starting empty");
                IndexState::default()
            }
            Err(e) => {
                tracing::warn!(
                    dir = %dir.display(),
                    error = %e,
                    "persisted index unusable, starting empty"
                );
                IndexState::default()
            }
        };

        Self {
            dir: Some(dir.to_path_buf()),
            embedder,
            reranker: None,
            oversample: 3,
            state: Arc::new(RwLock::new(state)),
            write_lock: Mutex::new(()),
        }
    }

    /// Enable second-stage reranking over `oversample * k` embedding candidates.
    #[must_use]
    pub fn with_reranker(mut self, reranker: Option<SharedReranker>, oversample: usize) -> Self {
        self.reranker = reranker;
        self.oversample = oversample.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.state.read().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    pub fn is_reranking(&self) -> bool {
        self.reranker.is_some()
    }

    pub fn stats(&self) -> IndexStats {
        let state = self.state.read();
        let sources: HashSet<&str> = state
            .chunks
            .iter()
            .map(|c| c.metadata.source_name.as_str())
            .collect();
        IndexStats {
            chunks: state.chunks.len(),
            kb_entries: state
                .chunks
                .iter()
                .filter(|c| c.metadata.entry_kind == EntryKind::KbEntry)
                .count(),
            sources: sources.len(),
            dimension: self.embedder.dimension(),
            embedding_model: self.embedder.model_name().to_string(),
            reranker: self.reranker.as_ref().map(|r| r.name().to_string()),
            generation: state.generation,
        }
    }

    /// Embed and append chunks. The index is append-only: a chunk whose id is
    /// already indexed is skipped, and within one batch the last chunk carrying
    /// an id wins. Memory and disk always receive the same rows.
    pub async fn add(&self, chunks: Vec<Chunk>) -> Result<IndexWrite, IndexError> {
        let offered = chunks.len();
        let fresh = {
            let state = self.state.read();
            last_per_id(chunks)
                .into_iter()
                .filter(|c| !state.rows_by_id.contains_key(&c.id))
                .collect::<Vec<_>>()
        };
        if fresh.is_empty() {
            return Ok(IndexWrite {
                added: 0,
                skipped: offered,
            });
        }

        let texts: Vec<String> = fresh.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_documents(&texts).await?;
        if vectors.len() != fresh.len() {
            return Err(IndexError::VectorCountMismatch {
                expected: fresh.len(),
                actual: vectors.len(),
            });
        }
        let dim = self.embedder.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
            return Err(IndexError::DimensionMismatch {
                expected: dim,
                actual: bad.len(),
            });
        }

        let pending: Vec<(Chunk, Vec<f32>)> = fresh
            .into_iter()
            .zip(vectors.into_iter().map(normalized))
            .collect();

        let _writer = self.write_lock.lock().await;
        let state = Arc::clone(&self.state);
        let dir = self.dir.clone();
        let model = self.embedder.model_name().to_string();
        let (added, generation) = tokio::task::spawn_blocking(move || {
            commit(&state, dir.as_deref(), pending, &model, dim)
        })
        .await
        .map_err(|e| IndexError::Task(e.to_string()))??;

        let write = IndexWrite {
            added,
            skipped: offered - added,
        };
        tracing::debug!(added, skipped = write.skipped, generation, "index updated");
        Ok(write)
    }

    /// Persist the live rows as a new generation. Every `add` already persists;
    /// this rewrites the data files for the current state.
    pub async fn save(&self) -> Result<(), IndexError> {
        let Some(dir) = self.dir.clone() else {
            return Ok(());
        };
        let _writer = self.write_lock.lock().await;
        let state = Arc::clone(&self.state);
        let model = self.embedder.model_name().to_string();
        let dim = self.embedder.dimension();
        let generation = tokio::task::spawn_blocking(move || {
            let previous = state.read().generation;
            let next = previous + 1;
            persist_generation(&dir, &state.read(), &[], next, &model, dim)?;
            state.write().generation = next;
            remove_generation(&dir, previous);
            Ok::<_, IndexError>(next)
        })
        .await
        .map_err(|e| IndexError::Task(e.to_string()))??;
        tracing::debug!(generation, "index saved");
        Ok(())
    }

    /// Top-`k` chunks for `query`, best first. An empty index yields no results.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, IndexError> {
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = normalized(self.embedder.embed_query(query).await?);
        let dim = self.embedder.dimension();
        if query_vector.len() != dim {
            return Err(IndexError::DimensionMismatch {
                expected: dim,
                actual: query_vector.len(),
            });
        }

        let candidate_count = match self.reranker {
            Some(_) => k.saturating_mul(self.oversample),
            None => k,
        };

        let candidates: Vec<SearchHit> = {
            let state = self.state.read();
            let mut scored: Vec<(usize, f32)> = (0..state.chunks.len())
                .map(|i| (i, dot(&query_vector, state.row(i, dim))))
                .collect();
            scored.sort_by(|a, b| b.1.total_cmp(&a.1));
            scored.truncate(candidate_count);
            scored
                .into_iter()
                .map(|(i, score)| SearchHit {
                    chunk: state.chunks[i].clone(),
                    score,
                })
                .collect()
        };

        match &self.reranker {
            Some(reranker) => Ok(rerank(reranker, query, candidates, k).await),
            None => Ok(candidates),
        }
    }
}

async fn rerank(
    reranker: &SharedReranker,
    query: &str,
    mut candidates: Vec<SearchHit>,
    k: usize,
) -> Vec<SearchHit> {
    let passages: Vec<String> = candidates.iter().map(|h| h.chunk.text.clone()).collect();
    match reranker.score(query, &passages).await {
        Ok(scores) if scores.len() == candidates.len() => {
            for (hit, score) in candidates.iter_mut().zip(scores) {
                hit.score = score;
            }
            candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        }
        Ok(scores) => tracing::warn!(
            reranker = reranker.name(),
            expected = candidates.len(),
            actual = scores.len(),
            "reranker returned wrong score count, keeping embedding order"
        ),
        Err(e) => tracing::warn!(
            reranker = reranker.name(),
            error = %e,
            "reranking failed, keeping embedding order"
        ),
    }
    candidates.truncate(k);
    candidates
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalized(mut v: Vec<f32>) -> Vec<f32> {
    let norm = dot(&v, &v).sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

fn vectors_file(generation: u64) -> String {
    format!("vectors-{generation}.bin")
}

fn chunks_file(generation: u64) -> String {
    format!("chunks-{generation}.json")
}

/// Keep the last chunk for each id, in the order those last chunks appear.
fn last_per_id(chunks: Vec<Chunk>) -> Vec<Chunk> {
    let last: HashMap<String, usize> = chunks
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.clone(), i))
        .collect();
    chunks
        .into_iter()
        .enumerate()
        .filter(|(i, c)| last.get(&c.id) == Some(i))
        .map(|(_, c)| c)
        .collect()
}

/// Append `pending` to the index: persist the next generation first when the
/// index is directory-backed, then publish the rows in memory. Blocking; the
/// caller holds the write lock. Returns rows appended and the live generation.
fn commit(
    state: &RwLock<IndexState>,
    dir: Option<&Path>,
    pending: Vec<(Chunk, Vec<f32>)>,
    model: &str,
    dim: usize,
) -> Result<(usize, u64), IndexError> {
    let (pending, previous) = {
        let current = state.read();
        let pending: Vec<_> = pending
            .into_iter()
            .filter(|(chunk, _)| !current.rows_by_id.contains_key(&chunk.id))
            .collect();
        (pending, current.generation)
    };
    if pending.is_empty() {
        return Ok((0, previous));
    }

    let generation = match dir {
        Some(dir) => {
            let next = previous + 1;
            persist_generation(dir, &state.read(), &pending, next, model, dim)?;
            next
        }
        None => previous,
    };

    let added = pending.len();
    {
        let mut current = state.write();
        for (chunk, vector) in pending {
            let row = current.chunks.len();
            current.rows_by_id.insert(chunk.id.clone(), row);
            current.vectors.extend_from_slice(&vector);
            current.chunks.push(chunk);
        }
        current.generation = generation;
    }

    if let Some(dir) = dir
        && previous != generation
    {
        remove_generation(dir, previous);
    }
    Ok((added, generation))
}

/// Write the rows of `state` followed by `appended` as generation `generation`.
fn persist_generation(
    dir: &Path,
    state: &IndexState,
    appended: &[(Chunk, Vec<f32>)],
    generation: u64,
    model: &str,
    dim: usize,
) -> Result<(), IndexError> {
    fs::create_dir_all(dir)?;

    let count = state.chunks.len() + appended.len();
    let mut bytes = Vec::with_capacity(count * dim * 4);
    let mut records: Vec<&Chunk> = Vec::with_capacity(count);

    for (row, chunk) in state.chunks.iter().enumerate() {
        records.push(chunk);
        bytes.extend(state.row(row, dim).iter().flat_map(|x| x.to_le_bytes()));
    }
    for (chunk, vector) in appended {
        records.push(chunk);
        bytes.extend(vector.iter().flat_map(|x| x.to_le_bytes()));
    }

    let manifest = Manifest {
        version: INDEX_FORMAT_VERSION,
        embedding_model: model.to_string(),
        dimension: dim,
        count: records.len(),
        generation,
        vectors_file: vectors_file(generation),
        chunks_file: chunks_file(generation),
        vectors_sha256: calculate_checksum(&bytes),
        updated_at: Utc::now(),
    };

    write_atomic(&dir.join(&manifest.vectors_file), &bytes)?;
    write_atomic(
        &dir.join(&manifest.chunks_file),
        &serde_json::to_vec(&records)?,
    )?;
    write_atomic(
        &dir.join(MANIFEST_FILE),
        &serde_json::to_vec_pretty(&manifest)?,
    )?;
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), IndexError> {
    let tmp = path.with_extension(format!(
        "{}.tmp",
        path.extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default()
    ));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_generation(dir: &Path, generation: u64) {
    if generation == 0 {
        return;
    }
    for file in [vectors_file(generation), chunks_file(generation)] {
        if let Err(e) = fs::remove_file(dir.join(&file))
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::debug!(file, error = %e, "failed to remove old index generation");
        }
    }
}

fn read_persisted(
    dir: &Path,
    model: &str,
    dim: usize,
) -> Result<Option<IndexState>, IndexError> {
    let manifest_path = dir.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Ok(None);
    }

    let manifest: Manifest = serde_json::from_slice(&fs::read(&manifest_path)?)?;
    if manifest.version != INDEX_FORMAT_VERSION {
        return Err(IndexError::Corrupt(format!(
            "unsupported index version {}",
            manifest.version
        )));
    }
    if manifest.dimension != dim {
        return Err(IndexError::DimensionMismatch {
            expected: dim,
            actual: manifest.dimension,
        });
    }
    if manifest.embedding_model != model {
        return Err(IndexError::Corrupt(format!(
            "index was built with '{}' but the configured embedder is '{}'",
            manifest.embedding_model, model
        )));
    }

    let bytes = fs::read(dir.join(&manifest.vectors_file))?;
    if calculate_checksum(&bytes) != manifest.vectors_sha256 {
        return Err(IndexError::Corrupt("vector checksum mismatch".to_string()));
    }
    if bytes.len() != manifest.count * dim * 4 {
        return Err(IndexError::Corrupt(format!(
            "vector file holds {} bytes, expected {}",
            bytes.len(),
            manifest.count * dim * 4
        )));
    }

    let chunks: Vec<Chunk> = serde_json::from_slice(&fs::read(dir.join(&manifest.chunks_file))?)?;
    if chunks.len() != manifest.count {
        return Err(IndexError::Corrupt(format!(
            "chunk file holds {} records, expected {}",
            chunks.len(),
            manifest.count
        )));
    }

    let vectors = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let rows_by_id = chunks
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.clone(), i))
        .collect();

    Ok(Some(IndexState {
        vectors,
        chunks,
        rows_by_id,
        generation: manifest.generation,
    }))
}
