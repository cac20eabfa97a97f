//! The structured answer returned for every query.

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComplianceStatus {
    Compliant,
    #[serde(rename = "Non-Compliant")]
    NonCompliant,
    #[serde(rename = "Needs Review")]
    NeedsReview,
}

impl ComplianceStatus {
    /// Lenient parse of model-produced labels ("non_compliant", "needs review", ...).
    pub fn parse_lenient(s: &str) -> Option<Self> {
        let normalized: String = s
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .collect();
        match normalized.as_str() {
            "compliant" => Some(ComplianceStatus::Compliant),
            "noncompliant" => Some(ComplianceStatus::NonCompliant),
            "needsreview" | "review" => Some(ComplianceStatus::NeedsReview),
            _ => None,
        }
    }
}

impl std::fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComplianceStatus::Compliant => write!(f, "Compliant"),
            ComplianceStatus::NonCompliant => write!(f, "Non-Compliant"),
            ComplianceStatus::NeedsReview => write!(f, "Needs Review"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    #[default]
    Analysis,
    FollowUp,
    Clarification,
    KbDirect,
    Error,
}

impl ConversationType {
    fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "follow_up" | "followup" | "expansion" => ConversationType::FollowUp,
            "clarification" => ConversationType::Clarification,
            "kb_direct" => ConversationType::KbDirect,
            "error" => ConversationType::Error,
            _ => ConversationType::Analysis,
        }
    }
}

impl<'de> Deserialize<'de> for ConversationType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = Option::<String>::deserialize(deserializer)?;
        Ok(label
            .as_deref()
            .map(ConversationType::from_label)
            .unwrap_or_default())
    }
}

fn deserialize_status<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<ComplianceStatus>, D::Error> {
    let label = Option::<String>::deserialize(deserializer)?;
    Ok(label.as_deref().and_then(ComplianceStatus::parse_lenient))
}

fn deserialize_string_list<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCitation {
    #[serde(default)]
    pub document_name: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub relevance_score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    #[serde(default)]
    pub response: String,

    #[serde(default, deserialize_with = "deserialize_status")]
    pub status: Option<ComplianceStatus>,

    #[serde(default)]
    pub reasoning: Option<String>,

    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub relevant_clauses: Vec<String>,

    #[serde(default)]
    pub sources: Vec<SourceCitation>,

    #[serde(default)]
    pub conversation_type: ConversationType,

    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub follow_up_questions: Vec<String>,
}

/// Placeholder used when neither a response nor reasoning was produced.
pub const EMPTY_RESPONSE_PLACEHOLDER: &str =
    "The request was processed but no answer text was produced. Please review the cited sources or rephrase the question.";

impl Assessment {
    /// True when the model produced neither an answer nor reasoning.
    pub fn is_blank(&self) -> bool {
        self.response.trim().is_empty()
            && self
                .reasoning
                .as_deref()
                .is_none_or(|r| r.trim().is_empty())
    }

    /// Guarantee a non-empty `response`, backfilling from reasoning first.
    pub fn ensure_response(&mut self) {
        if !self.response.trim().is_empty() {
            return;
        }
        self.response = match self.reasoning.as_deref().map(str::trim) {
            Some(reasoning) if !reasoning.is_empty() => reasoning.to_string(),
            _ => EMPTY_RESPONSE_PLACEHOLDER.to_string(),
        };
    }
}

/// Which stage of the answer pipeline produced the assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerPath {
    FastPath,
    Generated,
    Recovered,
    SafeFallback,
}

impl AnswerPath {
    pub fn as_str(self) -> &'static str {
        match self {
            AnswerPath::FastPath => "fast_path",
            AnswerPath::Generated => "generated",
            AnswerPath::Recovered => "recovered",
            AnswerPath::SafeFallback => "safe_fallback",
        }
    }
}

impl std::fmt::Display for AnswerPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query boundary result: the session it belongs to plus the assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub session_id: String,
    pub data: Assessment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<AnswerPath>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&ComplianceStatus::NonCompliant).unwrap();
        assert_eq!(json, "\"Non-Compliant\"");
        let json = serde_json::to_string(&ComplianceStatus::NeedsReview).unwrap();
        assert_eq!(json, "\"Needs Review\"");
    }

    #[test]
    fn test_lenient_fields() {
        let raw = r#"{
            "response": "Keep records for 90 days.",
            "status": "non_compliant",
            "conversation_type": "expansion",
            "relevant_clauses": null,
            "follow_up_questions": ["What about backups?"]
        }"#;
        let assessment: Assessment = serde_json::from_str(raw).unwrap();
        assert_eq!(assessment.status, Some(ComplianceStatus::NonCompliant));
        assert_eq!(assessment.conversation_type, ConversationType::FollowUp);
        assert!(assessment.relevant_clauses.is_empty());
        assert_eq!(assessment.follow_up_questions.len(), 1);
    }

    #[test]
    fn test_unknown_status_becomes_none() {
        let assessment: Assessment =
            serde_json::from_str(r#"{"response":"x","status":"Maybe"}"#).unwrap();
        assert!(assessment.status.is_none());
        assert_eq!(assessment.conversation_type, ConversationType::Analysis);
    }

    #[test]
    fn test_ensure_response_uses_reasoning() {
        let mut assessment = Assessment {
            reasoning: Some("Article 5 applies.".to_string()),
            ..Default::default()
        };
        assessment.ensure_response();
        assert_eq!(assessment.response, "Article 5 applies.");
    }

    #[test]
    fn test_ensure_response_placeholder() {
        let mut assessment = Assessment::default();
        assert!(assessment.is_blank());
        assessment.ensure_response();
        assert_eq!(assessment.response, EMPTY_RESPONSE_PLACEHOLDER);
    }

    #[test]
    fn test_kb_direct_serializes_snake_case() {
        let json = serde_json::to_value(ConversationType::KbDirect).unwrap();
        assert_eq!(json, serde_json::json!("kb_direct"));
    }
}
