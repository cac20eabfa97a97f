//! Curated knowledge-base entries: chunk rendering, import parsing and the
//! retrieval-only fast path.
//!
//! A KB chunk carries labeled sections:
//!
//! ```text
//! TITLE: Data retention
//!
//! CONTENT: Entities must retain data for 90 days.
//!
//! CLAUSE: Art.5
//! ```
//!
//! The fast path answers with the `CONTENT:` body verbatim. The body runs to the
//! next blank-line-separated all-caps label or the end of the text.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::IngestError;
use crate::models::{
    Assessment, Chunk, ChunkMetadata, ConversationType, KnowledgeEntry, SearchHit,
    SourceCitation,
};
use crate::services::chunker::provenance_header;
use crate::services::followup::FollowUpSuggester;
use crate::utils::excerpt;

const CONTENT_LABEL: &str = "CONTENT:";
const EXCERPT_CHARS: usize = 200;

static NEXT_LABEL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\n[A-Z_]+:").unwrap());

/// Body of the `CONTENT:` section, trimmed. `None` when absent or empty.
pub fn extract_content(text: &str) -> Option<&str> {
    let start = text.find(CONTENT_LABEL)? + CONTENT_LABEL.len();
    let body = &text[start..];
    let end = NEXT_LABEL.find(body).map_or(body.len(), |m| m.start());
    let content = body[..end].trim();
    (!content.is_empty()).then_some(content)
}

/// Direct answer from the top hit when it is a curated entry with a parseable body.
pub fn fast_path(hits: &[SearchHit], followups: &FollowUpSuggester) -> Option<Assessment> {
    let top = hits.first()?;
    let meta = &top.chunk.metadata;
    if !meta.is_kb_entry() {
        return None;
    }
    let answer = extract_content(&top.chunk.text)?;

    let kb_id = meta.kb_id.as_deref().unwrap_or("Unknown");
    let kb_title = meta.kb_title.as_deref().unwrap_or("Knowledge Base Entry");
    let follow_up_questions = followups.for_entry(Some(kb_id));

    tracing::info!(
        kb_id,
        follow_ups = follow_up_questions.len(),
        "[FAST PATH] returning knowledge-base answer"
    );

    Some(Assessment {
        response: answer.to_string(),
        status: None,
        reasoning: Some(format!("Source: {} ({})", kb_title, kb_id)),
        relevant_clauses: Vec::new(),
        sources: vec![SourceCitation {
            document_name: kb_title.to_string(),
            excerpt: excerpt(answer, EXCERPT_CHARS),
            relevance_score: 1.0,
        }],
        conversation_type: ConversationType::KbDirect,
        follow_up_questions,
    })
}

/// Render an entry as a single `kb_entry` chunk.
pub fn entry_to_chunk(entry: &KnowledgeEntry) -> Chunk {
    let metadata = ChunkMetadata::kb_entry(&entry.id, &entry.title);
    let mut text = provenance_header(&metadata);
    text.push_str(&format!(
        "TITLE: {}\n\n{} {}",
        entry.title.trim(),
        CONTENT_LABEL,
        entry.content.trim()
    ));
    if let Some(clause) = entry.clause.as_deref().filter(|c| !c.trim().is_empty()) {
        text.push_str(&format!("\n\nCLAUSE: {}", clause.trim()));
    }
    if let Some(category) = entry.category.as_deref().filter(|c| !c.trim().is_empty()) {
        text.push_str(&format!("\n\nCATEGORY: {}", category.trim()));
    }
    Chunk::for_entry(text, metadata)
}

/// Parse a JSON array or JSON Lines document of entries.
pub fn parse_entries(raw: &str, path: &Path) -> Result<Vec<KnowledgeEntry>, IngestError> {
    let parse_error = |message: String| IngestError::Parse {
        path: path.to_path_buf(),
        message,
    };

    let trimmed = raw.trim_start();
    let entries: Vec<KnowledgeEntry> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|e| parse_error(e.to_string()))?
    } else {
        trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| parse_error(format!("line {}: {}", n + 1, e)))
            })
            .collect::<Result<_, _>>()?
    };

    for entry in &entries {
        if entry.id.trim().is_empty() {
            return Err(parse_error("entry with empty id".to_string()));
        }
        if entry.content.trim().is_empty() {
            return Err(parse_error(format!("entry {} has no content", entry.id)));
        }
    }
    Ok(entries)
}

pub async fn load_entries(path: &Path) -> Result<Vec<KnowledgeEntry>, IngestError> {
    if !path.exists() {
        return Err(IngestError::NotFound(path.to_path_buf()));
    }
    let raw = tokio::fs::read_to_string(path).await?;
    parse_entries(&raw, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FollowUpConfig;
    use crate::services::followup::FollowUpCatalog;

    fn suggester() -> FollowUpSuggester {
        FollowUpSuggester::new(FollowUpCatalog::default(), &FollowUpConfig::default())
    }

    fn kb_hit(text: &str) -> SearchHit {
        SearchHit {
            chunk: Chunk::new(
                text.to_string(),
                ChunkMetadata::kb_entry("KB-001", "Data Retention"),
                0,
            ),
            score: 0.4,
        }
    }

    #[test]
    fn test_extract_content_stops_at_next_label() {
        let text = "CONTENT: Entities must retain data for 90 days.\n\nCLAUSE: Art.5";
        assert_eq!(
            extract_content(text),
            Some("Entities must retain data for 90 days.")
        );
    }

    #[test]
    fn test_extract_content_runs_to_end() {
        let text = "TITLE: X\n\nCONTENT:\n  Keep logs.\nAlso keep receipts.\n";
        assert_eq!(
            extract_content(text),
            Some("Keep logs.\nAlso keep receipts.")
        );
    }

    #[test]
    fn test_extract_content_ignores_lowercase_labels() {
        let text = "CONTENT: Retain data.\n\nnote: not a label\n\nSOURCE_REF: x";
        assert_eq!(
            extract_content(text),
            Some("Retain data.\n\nnote: not a label")
        );
    }

    #[test]
    fn test_extract_content_missing_or_empty() {
        assert_eq!(extract_content("TITLE: nothing here"), None);
        assert_eq!(extract_content("CONTENT:   \n\nCLAUSE: Art.5"), None);
    }

    #[test]
    fn test_fast_path_builds_direct_answer() {
        let hits = vec![kb_hit(
            "CONTENT: Entities must retain data for 90 days.\n\nCLAUSE: Art.5",
        )];
        let assessment = fast_path(&hits, &suggester()).unwrap();
        assert_eq!(assessment.response, "Entities must retain data for 90 days.");
        assert_eq!(assessment.conversation_type, ConversationType::KbDirect);
        assert!(assessment.status.is_none());
        assert_eq!(
            assessment.reasoning.as_deref(),
            Some("Source: Data Retention (KB-001)")
        );
        assert_eq!(assessment.sources.len(), 1);
        assert_eq!(assessment.sources[0].document_name, "Data Retention");
        assert_eq!(assessment.sources[0].relevance_score, 1.0);
        assert!(!assessment.follow_up_questions.is_empty());
    }

    #[test]
    fn test_fast_path_truncates_long_excerpt() {
        let body = "x".repeat(250);
        let hits = vec![kb_hit(&format!("CONTENT: {}", body))];
        let assessment = fast_path(&hits, &suggester()).unwrap();
        assert_eq!(assessment.sources[0].excerpt.chars().count(), 203);
        assert!(assessment.sources[0].excerpt.ends_with("..."));
    }

    #[test]
    fn test_fast_path_skips_regular_chunks_and_unparseable_entries() {
        let regular = SearchHit {
            chunk: Chunk::new(
                "CONTENT: looks curated".to_string(),
                ChunkMetadata::document("policy.txt", "text"),
                0,
            ),
            score: 0.9,
        };
        assert!(fast_path(&[regular], &suggester()).is_none());
        assert!(fast_path(&[kb_hit("TITLE: no body")], &suggester()).is_none());
        assert!(fast_path(&[], &suggester()).is_none());
    }

    #[test]
    fn test_fast_path_only_considers_top_hit() {
        let regular = SearchHit {
            chunk: Chunk::new(
                "Some regulation".to_string(),
                ChunkMetadata::document("policy.txt", "text"),
                0,
            ),
            score: 0.9,
        };
        let hits = vec![regular, kb_hit("CONTENT: curated")];
        assert!(fast_path(&hits, &suggester()).is_none());
    }

    #[test]
    fn test_entry_chunk_round_trips_through_fast_path() {
        let entry = KnowledgeEntry {
            id: "KB-002".to_string(),
            title: "Breach notification".to_string(),
            content: "Notify the authority within 72 hours.".to_string(),
            clause: Some("Art.33".to_string()),
            category: Some("Incident".to_string()),
            follow_up_questions: Vec::new(),
        };
        let chunk = entry_to_chunk(&entry);
        assert_eq!(chunk.id, "kb-KB-002");
        assert!(chunk.text.starts_with("DOMAIN: REGULATORY_COMPLIANCE"));
        assert!(chunk.text.contains("\n\nCLAUSE: Art.33\n\nCATEGORY: Incident"));

        let hits = vec![SearchHit { chunk, score: 0.7 }];
        let assessment = fast_path(&hits, &suggester()).unwrap();
        assert_eq!(assessment.response, "Notify the authority within 72 hours.");
        assert_eq!(assessment.sources[0].document_name, "Breach notification");
    }

    #[test]
    fn test_parse_entries_array_and_jsonl() {
        let path = Path::new("kb.json");
        let array = r#"[{"id":"KB-1","title":"A","content":"a"},{"id":"KB-2","title":"B","content":"b","follow_up_questions":["q?"]}]"#;
        let entries = parse_entries(array, path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].follow_up_questions, vec!["q?"]);

        let jsonl = "{\"id\":\"KB-1\",\"title\":\"A\",\"content\":\"a\"}\n\n{\"id\":\"KB-2\",\"title\":\"B\",\"content\":\"b\",\"clause\":\"Art.1\"}\n";
        let entries = parse_entries(jsonl, path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].clause.as_deref(), Some("Art.1"));
    }

    #[test]
    fn test_parse_entries_rejects_bad_records() {
        let path = Path::new("kb.jsonl");
        let err = parse_entries("{\"id\":\"KB-1\"}\n", path).unwrap_err();
        assert!(matches!(err, IngestError::Parse { .. }));
        let err = parse_entries(r#"[{"id":"KB-1","title":"A","content":"  "}]"#, path).unwrap_err();
        assert!(err.to_string().contains("KB-1"));
    }

    #[tokio::test]
    async fn test_load_entries_missing_file() {
        let err = load_entries(Path::new("/nonexistent/kb.json")).await.unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }
}
