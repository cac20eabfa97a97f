//! Write path: files on disk to chunks in the index.

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::chunker::TextChunker;
use super::index::EmbeddingIndex;
use crate::error::IngestError;
use crate::models::{ChunkMetadata, IngestConfig};
use crate::utils::detect_format;
use crate::utils::file::file_display_name;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub chunks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileOutcome {
    fn ok(path: &Path, chunks: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            chunks,
            error: None,
        }
    }

    fn failed(path: &Path, error: &IngestError) -> Self {
        Self {
            path: path.to_path_buf(),
            chunks: 0,
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub files: Vec<FileOutcome>,
    /// Files found while walking directories but not in a readable format
    pub skipped: usize,
    pub chunks_added: usize,
    pub duration_ms: u64,
}

impl IngestReport {
    pub fn succeeded(&self) -> usize {
        self.files.iter().filter(|f| f.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.files.len() - self.succeeded()
    }
}

/// Files that will actually be ingested, plus inputs that could not be used.
#[derive(Debug, Default)]
pub struct Collected {
    pub files: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
    pub skipped: usize,
}

/// Expand the inputs into ingestible files. Directories are walked with the
/// configured excludes; an explicitly named file in an unknown format is
/// counted as skipped like any other.
pub fn collect_files(inputs: &[PathBuf], exclude: &[String], config: &IngestConfig) -> Collected {
    let patterns: Vec<glob::Pattern> = exclude
        .iter()
        .chain(config.exclude_patterns.iter())
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::warn!(pattern = %p, error = %e, "ignoring invalid exclude pattern");
                None
            }
        })
        .collect();

    let mut collected = Collected::default();
    for input in inputs {
        if !input.exists() {
            collected.missing.push(input.clone());
            continue;
        }

        let candidates: Vec<PathBuf> = if input.is_file() {
            vec![input.clone()]
        } else {
            WalkDir::new(input)
                .follow_links(false)
                .into_iter()
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to read directory entry");
                        None
                    }
                })
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|path| {
                    let path_str = path.to_string_lossy();
                    !patterns.iter().any(|p| p.matches(&path_str))
                })
                .collect()
        };

        for path in candidates {
            if detect_format(&path).is_some() {
                collected.files.push(path);
            } else {
                tracing::debug!(path = %path.display(), "skipping unsupported file");
                collected.skipped += 1;
            }
        }
    }

    collected.files.sort();
    collected.files.dedup();
    collected
}

pub struct Ingestor<'a> {
    chunker: &'a TextChunker,
    index: &'a EmbeddingIndex,
    config: &'a IngestConfig,
}

impl<'a> Ingestor<'a> {
    pub fn new(chunker: &'a TextChunker, index: &'a EmbeddingIndex, config: &'a IngestConfig) -> Self {
        Self {
            chunker,
            index,
            config,
        }
    }

    /// Chunk one file with the given provenance and add it to the index.
    pub async fn ingest_file(&self, path: &Path, metadata: &ChunkMetadata) -> Result<usize, IngestError> {
        let chunks = self.chunker.process_path(path, metadata, self.config).await?;
        if chunks.is_empty() {
            return Err(IngestError::Parse {
                path: path.to_path_buf(),
                message: "no text content".to_string(),
            });
        }
        let write = self.index.add(chunks).await?;
        tracing::info!(
            path = %path.display(),
            chunks = write.added,
            already_indexed = write.skipped,
            "ingested document"
        );
        Ok(write.added)
    }

    /// Ingest every file under `inputs`. One bad file never aborts the batch;
    /// the batch is rejected only when it contains nothing ingestible.
    pub async fn ingest_batch(
        &self,
        inputs: &[PathBuf],
        exclude: &[String],
        mut on_file: impl FnMut(&FileOutcome),
    ) -> Result<IngestReport, IngestError> {
        let start = Instant::now();
        let collected = collect_files(inputs, exclude, self.config);

        if collected.files.is_empty() {
            return Err(match collected.missing.into_iter().next() {
                Some(path) => IngestError::NotFound(path),
                None => IngestError::NoValidFiles,
            });
        }

        let mut report = IngestReport {
            skipped: collected.skipped,
            ..Default::default()
        };

        for path in &collected.missing {
            let outcome = FileOutcome::failed(path, &IngestError::NotFound(path.clone()));
            on_file(&outcome);
            report.files.push(outcome);
        }

        for path in &collected.files {
            let metadata = document_metadata(path);
            let outcome = match self.ingest_file(path, &metadata).await {
                Ok(chunks) => {
                    report.chunks_added += chunks;
                    FileOutcome::ok(path, chunks)
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to ingest file");
                    FileOutcome::failed(path, &e)
                }
            };
            on_file(&outcome);
            report.files.push(outcome);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            files = report.succeeded(),
            failed = report.failed(),
            chunks = report.chunks_added,
            "ingestion finished"
        );
        Ok(report)
    }
}

/// Provenance for an ordinary document: file name plus detected format.
pub fn document_metadata(path: &Path) -> ChunkMetadata {
    let document_type = detect_format(path).map_or("text", |f| f.as_str());
    ChunkMetadata::document(file_display_name(path), document_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::models::ChunkingConfig;
    use crate::services::embedding::HashingEmbedder;
    use crate::services::knowledge_base::extract_content;

    fn index() -> EmbeddingIndex {
        EmbeddingIndex::in_memory(Arc::new(HashingEmbedder::new(64)))
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let index = index();
        let chunker = TextChunker::with_defaults();
        let config = IngestConfig::default();
        let ingestor = Ingestor::new(&chunker, &index, &config);

        let missing = PathBuf::from("/definitely/not/here.pdf");
        let err = ingestor
            .ingest_file(&missing, &document_metadata(&missing))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));

        let err = ingestor.ingest_batch(&[missing], &[], |_| {}).await.unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_multi_chunk_kb_document_keeps_every_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb-9.txt");
        let text = format!(
            "CONTENT: Keep records.\n\n{}",
            "Further detail paragraph. ".repeat(20)
        );
        std::fs::write(&path, text).unwrap();

        let index = index();
        let chunker = TextChunker::new(&ChunkingConfig {
            chunk_size: 100,
            chunk_overlap: 20,
        });
        let config = IngestConfig::default();
        let ingestor = Ingestor::new(&chunker, &index, &config);
        let meta = ChunkMetadata::kb_entry("KB-9", "Records");

        let expected = chunker.process_path(&path, &meta, &config).await.unwrap().len();
        assert!(expected > 1);

        let added = ingestor.ingest_file(&path, &meta).await.unwrap();
        assert_eq!(added, expected);
        assert_eq!(index.len(), expected);

        let hits = index.search("Keep records", expected).await.unwrap();
        assert!(hits.iter().any(|h| {
            extract_content(&h.chunk.text)
                .map(str::trim_start)
                .is_some_and(|c| c.starts_with("Keep records."))
        }));
    }

    #[tokio::test]
    async fn test_batch_reports_per_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("policy.md"), "Retention is 90 days.\n\nBackups weekly.").unwrap();
        std::fs::write(dir.path().join("empty.txt"), "   \n").unwrap();
        std::fs::write(dir.path().join("logo.png"), [0x89u8, 0x50, 0x4e, 0x47]).unwrap();

        let index = index();
        let chunker = TextChunker::with_defaults();
        let config = IngestConfig::default();
        let ingestor = Ingestor::new(&chunker, &index, &config);

        let mut seen = 0;
        let report = ingestor
            .ingest_batch(&[dir.path().to_path_buf()], &[], |_| seen += 1)
            .await
            .unwrap();

        assert_eq!(seen, 2);
        assert_eq!(report.files.len(), 2);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.chunks_added, index.len());
        assert!(report.chunks_added >= 1);
    }

    #[tokio::test]
    async fn test_batch_without_valid_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("image.png"), [0u8; 8]).unwrap();

        let index = index();
        let chunker = TextChunker::with_defaults();
        let config = IngestConfig::default();
        let ingestor = Ingestor::new(&chunker, &index, &config);

        let err = ingestor
            .ingest_batch(&[dir.path().to_path_buf()], &[], |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::NoValidFiles));
    }

    #[test]
    fn test_collect_files_applies_excludes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("drafts")).unwrap();
        std::fs::write(dir.path().join("a.md"), "a").unwrap();
        std::fs::write(dir.path().join("drafts").join("b.md"), "b").unwrap();

        let config = IngestConfig::default();
        let collected = collect_files(
            &[dir.path().to_path_buf(), dir.path().join("nope.md")],
            &["**/drafts/**".to_string()],
            &config,
        );
        assert_eq!(collected.files, vec![dir.path().join("a.md")]);
        assert_eq!(collected.missing, vec![dir.path().join("nope.md")]);
    }

    #[test]
    fn test_document_metadata() {
        let meta = document_metadata(Path::new("/docs/GDPR.pdf"));
        assert_eq!(meta.source_name, "GDPR.pdf");
        assert_eq!(meta.document_type, "pdf");
        assert!(!meta.is_kb_entry());
    }
}
