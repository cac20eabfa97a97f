use serde::{Deserialize, Serialize};

/// Distinguishes ordinary document passages from curated knowledge-base entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    #[default]
    RegulatoryChunk,
    KbEntry,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::RegulatoryChunk => write!(f, "regulatory_chunk"),
            EntryKind::KbEntry => write!(f, "kb_entry"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source_name: String,
    pub document_type: String,
    #[serde(default)]
    pub entry_kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kb_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kb_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
}

impl ChunkMetadata {
    pub fn document(source_name: impl Into<String>, document_type: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            document_type: document_type.into(),
            ..Default::default()
        }
    }

    pub fn kb_entry(kb_id: impl Into<String>, kb_title: impl Into<String>) -> Self {
        Self {
            source_name: "Knowledge Base".to_string(),
            document_type: "kb_entry".to_string(),
            entry_kind: EntryKind::KbEntry,
            kb_id: Some(kb_id.into()),
            kb_title: Some(kb_title.into()),
            page_number: None,
        }
    }

    #[must_use]
    pub fn with_page(mut self, page_number: u32) -> Self {
        self.page_number = Some(page_number);
        self
    }

    pub fn is_kb_entry(&self) -> bool {
        self.entry_kind == EntryKind::KbEntry
    }

    /// Display name used when citing this chunk.
    pub fn display_name(&self) -> &str {
        match (&self.entry_kind, &self.kb_title) {
            (EntryKind::KbEntry, Some(title)) if !title.is_empty() => title,
            _ => &self.source_name,
        }
    }
}

/// A unit of retrievable text. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn new(text: String, metadata: ChunkMetadata, index: usize) -> Self {
        let id = Self::generate_id(&metadata, index, &text);
        Self { id, text, metadata }
    }

    /// The single chunk that stands for a whole curated entry, keyed by its entry id.
    pub fn for_entry(text: String, metadata: ChunkMetadata) -> Self {
        let id = match metadata.kb_id.as_deref() {
            Some(kb_id) => format!("kb-{}", kb_id),
            None => Self::generate_id(&metadata, 0, &text),
        };
        Self { id, text, metadata }
    }

    pub fn generate_id(metadata: &ChunkMetadata, index: usize, text: &str) -> String {
        use sha2::{Digest, Sha256};
        if let Some(kb_id) = metadata.kb_id.as_deref()
            && metadata.is_kb_entry()
        {
            return format!("kb-{}-{}", kb_id, index);
        }
        let input = format!(
            "{}:{}:{}:{}",
            metadata.source_name,
            metadata.page_number.unwrap_or(0),
            index,
            text
        );
        let hash = Sha256::digest(input.as_bytes());
        hex::encode(&hash[..16])
    }
}

/// A curated knowledge-base record as supplied for import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub follow_up_questions: Vec<String>,
}
