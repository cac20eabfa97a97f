//! Recursive, separator-aware chunking with overlap and a provenance header.

use std::collections::VecDeque;
use std::path::Path;

use crate::error::IngestError;
use crate::models::{Chunk, ChunkMetadata, ChunkingConfig, IngestConfig};
use crate::utils::file::{DocumentFormat, detect_format, extract_pdf_text, read_text_file};
use crate::utils::{has_meaningful_content, split_pages};

/// Paragraph, line, word, then character boundaries.
pub const DEFAULT_SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Provenance block prepended to every chunk so the model always sees where text came from.
pub fn provenance_header(metadata: &ChunkMetadata) -> String {
    format!(
        "DOMAIN: REGULATORY_COMPLIANCE\nSOURCE_DOC: {}\nDOC_TYPE: {}\nCONTEXT_LAYER: Global\n---\n",
        metadata.source_name, metadata.document_type
    )
}

#[derive(Debug, Clone)]
pub struct TextChunker {
    /// Maximum chunk length in characters, header excluded
    chunk_size: usize,
    /// Characters carried over between consecutive chunks
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl TextChunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        let chunk_size = config.chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: config.chunk_overlap.min(chunk_size - 1),
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(&ChunkingConfig::default())
    }

    #[must_use]
    pub fn with_separators(mut self, separators: Vec<String>) -> Self {
        self.separators = separators;
        self
    }

    /// Split raw text and wrap each piece with the provenance header.
    pub fn process(&self, raw_document: &str, metadata: &ChunkMetadata) -> Vec<Chunk> {
        self.process_from(raw_document, metadata, 0)
    }

    fn process_from(&self, raw: &str, metadata: &ChunkMetadata, first_index: usize) -> Vec<Chunk> {
        let header = provenance_header(metadata);
        self.split_text(raw)
            .into_iter()
            .filter(|piece| has_meaningful_content(piece))
            .enumerate()
            .map(|(i, piece)| {
                Chunk::new(
                    format!("{}{}", header, piece),
                    metadata.clone(),
                    first_index + i,
                )
            })
            .collect()
    }

    /// Read a file from disk and chunk it. PDF pages are chunked separately so
    /// every chunk records the page it came from.
    pub async fn process_path(
        &self,
        path: &Path,
        metadata: &ChunkMetadata,
        ingest: &IngestConfig,
    ) -> Result<Vec<Chunk>, IngestError> {
        if !path.exists() {
            return Err(IngestError::NotFound(path.to_path_buf()));
        }

        match detect_format(path) {
            Some(DocumentFormat::Pdf) => {
                let text = extract_pdf_text(path, &ingest.pdftotext).await?;
                let mut chunks = Vec::new();
                for (page, page_text) in split_pages(&text) {
                    let page_meta = metadata.clone().with_page(page);
                    let next = chunks.len();
                    chunks.extend(self.process_from(page_text, &page_meta, next));
                }
                Ok(chunks)
            }
            Some(DocumentFormat::Text) => {
                let text = read_text_file(path, ingest.max_file_size)?;
                Ok(self.process(&text, metadata))
            }
            None => Err(IngestError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    /// Split text into pieces of at most `chunk_size` characters, preferring the
    /// coarsest separator that occurs in the text.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &self.separators)
    }

    fn split_recursive(&self, text: &str, separators: &[String]) -> Vec<String> {
        let (position, separator) = separators
            .iter()
            .enumerate()
            .find(|(_, s)| s.is_empty() || text.contains(s.as_str()))
            .map_or((separators.len(), ""), |(i, s)| (i, s.as_str()));
        let finer = separators.get(position + 1..).unwrap_or(&[]);

        let pieces: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(separator).collect()
        };

        let mut chunks = Vec::new();
        let mut pending: Vec<&str> = Vec::new();

        for piece in pieces.into_iter().filter(|p| !p.is_empty()) {
            if char_len(piece) < self.chunk_size {
                pending.push(piece);
                continue;
            }
            if !pending.is_empty() {
                chunks.extend(self.merge(&pending, separator));
                pending.clear();
            }
            if finer.is_empty() {
                chunks.push(piece.trim().to_string());
            } else {
                chunks.extend(self.split_recursive(piece, finer));
            }
        }

        if !pending.is_empty() {
            chunks.extend(self.merge(&pending, separator));
        }

        chunks
    }

    /// Greedily join small pieces up to `chunk_size`, keeping up to
    /// `chunk_overlap` characters of the previous window at the start of the next.
    fn merge(&self, pieces: &[&str], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut out = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for &piece in pieces {
            let len = char_len(piece);
            let joiner = if window.is_empty() { 0 } else { sep_len };

            if total + len + joiner > self.chunk_size && !window.is_empty() {
                push_joined(&mut out, &window, separator);

                while total > self.chunk_overlap
                    || (total > 0
                        && total + len + if window.is_empty() { 0 } else { sep_len }
                            > self.chunk_size)
                {
                    let Some(front) = window.pop_front() else {
                        break;
                    };
                    let dropped = char_len(front) + if window.is_empty() { 0 } else { sep_len };
                    total = total.saturating_sub(dropped);
                }
            }

            total += len + if window.is_empty() { 0 } else { sep_len };
            window.push_back(piece);
        }

        push_joined(&mut out, &window, separator);
        out
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn push_joined(out: &mut Vec<String>, window: &VecDeque<&str>, separator: &str) {
    let joined = window.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntryKind;

    fn chunker(size: usize, overlap: usize) -> TextChunker {
        TextChunker::new(&ChunkingConfig {
            chunk_size: size,
            chunk_overlap: overlap,
        })
    }

    #[test]
    fn test_short_document_single_chunk_with_header() {
        let meta = ChunkMetadata::document("gdpr.txt", "text");
        let chunks = TextChunker::with_defaults().process("Data must be minimised.", &meta);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.starts_with("DOMAIN: REGULATORY_COMPLIANCE\nSOURCE_DOC: gdpr.txt\nDOC_TYPE: text\nCONTEXT_LAYER: Global\n---\n"));
        assert!(chunks[0].text.ends_with("Data must be minimised."));
        assert_eq!(chunks[0].metadata, meta);
    }

    #[test]
    fn test_empty_document_produces_no_chunks() {
        let meta = ChunkMetadata::document("empty.txt", "text");
        assert!(TextChunker::with_defaults().process("", &meta).is_empty());
        assert!(TextChunker::with_defaults().process(" \n\n ", &meta).is_empty());
    }

    #[test]
    fn test_pieces_respect_chunk_size() {
        let text = (0..200)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let pieces = chunker(100, 20).split_text(&text);
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(piece.chars().count() <= 100, "piece too long: {}", piece.len());
        }
    }

    #[test]
    fn test_consecutive_pieces_overlap() {
        let text = (0..60)
            .map(|i| format!("w{:02}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let pieces = chunker(40, 12).split_text(&text);
        assert!(pieces.len() > 2);
        for pair in pieces.windows(2) {
            let last_word = pair[0].split(' ').next_back().unwrap();
            assert!(
                pair[1].contains(last_word),
                "expected '{}' carried into '{}'",
                last_word,
                pair[1]
            );
        }
    }

    #[test]
    fn test_prefers_paragraph_boundaries() {
        let para_a = "a".repeat(60);
        let para_b = "b".repeat(60);
        let text = format!("{}\n\n{}", para_a, para_b);
        let pieces = chunker(100, 0).split_text(&text);
        assert_eq!(pieces, vec![para_a, para_b]);
    }

    #[test]
    fn test_unbroken_text_falls_back_to_characters() {
        let text = "x".repeat(250);
        let pieces = chunker(100, 0).split_text(&text);
        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().all(|p| p.chars().count() <= 100));
    }

    #[test]
    fn test_chunk_ids_unique_within_document() {
        let text = (0..500)
            .map(|i| format!("term{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let meta = ChunkMetadata::document("long.txt", "text");
        let chunks = chunker(200, 50).process(&text, &meta);
        let mut ids: Vec<_> = chunks.iter().map(|c| c.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), chunks.len());
    }

    #[test]
    fn test_kb_metadata_preserved() {
        let meta = ChunkMetadata::kb_entry("KB-001", "Data retention");
        let chunks = TextChunker::with_defaults().process(
            "CONTENT: Entities must retain data for 90 days.\n\nCLAUSE: Art.5",
            &meta,
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.entry_kind, EntryKind::KbEntry);
        assert_eq!(chunks[0].metadata.kb_id.as_deref(), Some("KB-001"));
        assert!(chunks[0].text.contains("SOURCE_DOC: Knowledge Base"));
    }

    #[tokio::test]
    async fn test_process_path_missing_file() {
        let meta = ChunkMetadata::document("missing.txt", "text");
        let err = TextChunker::with_defaults()
            .process_path(
                Path::new("/no/such/missing.txt"),
                &meta,
                &IngestConfig::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_process_path_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.md");
        std::fs::write(&path, "# Policy\n\nLogs are kept for one year.").unwrap();
        let meta = ChunkMetadata::document("policy.md", "markdown");
        let chunks = TextChunker::with_defaults()
            .process_path(&path, &meta, &IngestConfig::default())
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("Logs are kept for one year."));
    }

    #[tokio::test]
    async fn test_process_path_rejects_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.png");
        std::fs::write(&path, [0x89u8, 0x50, 0x4e, 0x47]).unwrap();
        let meta = ChunkMetadata::document("image.png", "image");
        let err = TextChunker::with_defaults()
            .process_path(&path, &meta, &IngestConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedFormat(_)));
    }
}
