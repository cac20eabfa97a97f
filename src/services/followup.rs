//! Related-question suggestions keyed by knowledge-base entry.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::models::{Assessment, FollowUpConfig, KnowledgeEntry, SearchHit};

pub const GENERAL_FOLLOW_UPS: &[&str] = &[
    "What documentation do I need to demonstrate compliance?",
    "What are the penalties for non-compliance?",
    "How often should this requirement be reviewed?",
    "Which teams are responsible for implementing this control?",
];

/// On-disk catalog: curated questions per KB id plus an optional general pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FollowUpCatalog {
    #[serde(default)]
    pub curated: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub general: Vec<String>,
}

pub struct FollowUpSuggester {
    catalog: RwLock<FollowUpCatalog>,
    path: Option<PathBuf>,
    max_curated: usize,
    max_general: usize,
}

impl FollowUpSuggester {
    pub fn new(catalog: FollowUpCatalog, config: &FollowUpConfig) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            path: None,
            max_curated: config.max_curated,
            max_general: config.max_general,
        }
    }

    /// Load the catalog at `path`. A missing or unreadable file yields an empty catalog.
    pub fn load(path: &Path, config: &FollowUpConfig) -> Self {
        let catalog = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable follow-up catalog");
                FollowUpCatalog::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FollowUpCatalog::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read follow-up catalog");
                FollowUpCatalog::default()
            }
        };
        let mut suggester = Self::new(catalog, config);
        suggester.path = Some(path.to_path_buf());
        suggester
    }

    pub fn curated_count(&self) -> usize {
        self.catalog.read().curated.len()
    }

    /// Curated questions for `kb_id` when the catalog has them, otherwise the general pool.
    pub fn for_entry(&self, kb_id: Option<&str>) -> Vec<String> {
        let catalog = self.catalog.read();
        if let Some(id) = kb_id
            && let Some(questions) = catalog.curated.get(id)
            && !questions.is_empty()
        {
            return questions.iter().take(self.max_curated).cloned().collect();
        }
        if catalog.general.is_empty() {
            GENERAL_FOLLOW_UPS
                .iter()
                .take(self.max_general)
                .map(|q| q.to_string())
                .collect()
        } else {
            catalog
                .general
                .iter()
                .take(self.max_general)
                .cloned()
                .collect()
        }
    }

    /// Suggestions for an answer built from `hits`, keyed by the first KB entry among them.
    pub fn suggest(&self, hits: &[SearchHit]) -> Vec<String> {
        let kb_id = hits
            .iter()
            .filter(|h| h.chunk.metadata.is_kb_entry())
            .find_map(|h| h.chunk.metadata.kb_id.as_deref());
        self.for_entry(kb_id)
    }

    /// Fill `follow_up_questions` when the model produced none.
    pub fn enrich(&self, assessment: &mut Assessment, hits: &[SearchHit]) {
        if assessment.follow_up_questions.is_empty() {
            assessment.follow_up_questions = self.suggest(hits);
        }
    }

    /// Merge curated questions from imported entries and persist the catalog.
    /// Returns the number of entries that carried questions.
    pub fn merge_entries(&self, entries: &[KnowledgeEntry]) -> std::io::Result<usize> {
        let mut merged = 0;
        {
            let mut catalog = self.catalog.write();
            for entry in entries.iter().filter(|e| !e.follow_up_questions.is_empty()) {
                catalog
                    .curated
                    .insert(entry.id.clone(), entry.follow_up_questions.clone());
                merged += 1;
            }
        }
        if merged > 0 {
            self.save()?;
        }
        Ok(merged)
    }

    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&*self.catalog.read())?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }
}
