use std::fmt::Write as FmtWrite;

use console::style;
use serde::Serialize;

use crate::models::{
    ComplianceStatus, ConversationTurn, OutputFormat, QueryResponse, SearchResults,
    SessionSummary, TurnRole,
};
use crate::services::{ImportReport, IngestReport, MetricsSummary, ServiceStatus};
use crate::utils::excerpt;

const PREVIEW_CHARS: usize = 200;

pub trait Formatter {
    fn format_answer(&self, answer: &QueryResponse) -> String;
    fn format_search_results(&self, results: &SearchResults) -> String;
    fn format_ingest_report(&self, report: &IngestReport) -> String;
    fn format_import_report(&self, report: &ImportReport) -> String;
    fn format_history(&self, session_id: &str, turns: &[ConversationTurn]) -> String;
    fn format_sessions(&self, sessions: &[SessionSummary]) -> String;
    fn format_status(&self, status: &StatusInfo) -> String;
    fn format_message(&self, message: &str) -> String;
    fn format_error(&self, error: &str) -> String;
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub daemon_running: bool,
    pub daemon_pid: Option<u32>,
    pub daemon_idle_secs: Option<u64>,
    pub requests_served: Option<u64>,
    pub index_dir: String,
    pub config_path: Option<String>,
    /// Present when the daemon answered or the service could be opened locally
    pub service: Option<ServiceStatus>,
    pub metrics: Option<MetricsSummary>,
}

fn status_label(status: Option<ComplianceStatus>) -> &'static str {
    match status {
        Some(ComplianceStatus::Compliant) => "Compliant",
        Some(ComplianceStatus::NonCompliant) => "Non-Compliant",
        Some(ComplianceStatus::NeedsReview) => "Needs Review",
        None => "n/a",
    }
}

fn role_label(role: TurnRole) -> &'static str {
    match role {
        TurnRole::User => "You",
        TurnRole::Assistant => "Assistant",
    }
}

pub struct TextFormatter;

impl Formatter for TextFormatter {
    fn format_answer(&self, answer: &QueryResponse) -> String {
        let data = &answer.data;
        let mut output = String::new();

        writeln!(output, "{}", data.response).unwrap();
        writeln!(output).unwrap();

        if let Some(status) = data.status {
            let label = status_label(Some(status));
            let styled = match status {
                ComplianceStatus::Compliant => style(label).green().bold(),
                ComplianceStatus::NonCompliant => style(label).red().bold(),
                ComplianceStatus::NeedsReview => style(label).yellow().bold(),
            };
            writeln!(output, "Status:    {}", styled).unwrap();
        }
        if !data.relevant_clauses.is_empty() {
            writeln!(output, "Clauses:   {}", data.relevant_clauses.join(", ")).unwrap();
        }
        if let Some(reasoning) = data.reasoning.as_deref().filter(|r| !r.trim().is_empty()) {
            writeln!(output, "Reasoning:").unwrap();
            for line in reasoning.lines() {
                writeln!(output, "  {}", line).unwrap();
            }
        }

        if !data.sources.is_empty() {
            writeln!(output, "Sources:").unwrap();
            for (i, source) in data.sources.iter().enumerate() {
                writeln!(
                    output,
                    "  {}. {} [{:.2}]",
                    i + 1,
                    source.document_name,
                    source.relevance_score
                )
                .unwrap();
                if !source.excerpt.is_empty() {
                    writeln!(
                        output,
                        "     {}",
                        style(excerpt(&source.excerpt, PREVIEW_CHARS)).dim()
                    )
                    .unwrap();
                }
            }
        }

        if !data.follow_up_questions.is_empty() {
            writeln!(output, "Related questions:").unwrap();
            for question in &data.follow_up_questions {
                writeln!(output, "  - {}", question).unwrap();
            }
        }

        let path = answer.path.map_or("unknown", |p| p.as_str());
        writeln!(
            output,
            "\n{}",
            style(format!("session {} ({})", answer.session_id, path)).dim()
        )
        .unwrap();
        output
    }

    fn format_search_results(&self, results: &SearchResults) -> String {
        if results.is_empty() {
            return format!("No results found for: {}\n", results.query);
        }

        let mut output = String::new();
        writeln!(output, "Search results for: \"{}\"", results.query).unwrap();
        writeln!(
            output,
            "Found {} results in {}ms{}\n",
            results.len(),
            results.duration_ms,
            if results.reranked { " (reranked)" } else { "" }
        )
        .unwrap();

        for (i, hit) in results.results.iter().enumerate() {
            let meta = &hit.chunk.metadata;
            writeln!(output, "{}. [Score: {:.3}]", i + 1, hit.score).unwrap();
            match meta.page_number {
                Some(page) => writeln!(output, "   Source: {} (page {})", meta.display_name(), page),
                None => writeln!(output, "   Source: {}", meta.display_name()),
            }
            .unwrap();
            writeln!(output, "   Kind:   {}", meta.entry_kind).unwrap();
            writeln!(output, "   ---").unwrap();
            for line in excerpt(&hit.chunk.text, PREVIEW_CHARS).lines() {
                writeln!(output, "   {}", line).unwrap();
            }
            writeln!(output).unwrap();
        }

        output
    }

    fn format_ingest_report(&self, report: &IngestReport) -> String {
        let mut output = String::new();
        writeln!(output, "Ingestion Complete").unwrap();
        writeln!(output, "------------------").unwrap();
        writeln!(output, "Files ingested: {}", report.succeeded()).unwrap();
        writeln!(output, "Files failed:   {}", report.failed()).unwrap();
        writeln!(output, "Files skipped:  {}", report.skipped).unwrap();
        writeln!(output, "Chunks added:   {}", report.chunks_added).unwrap();
        writeln!(output, "Duration:       {}ms", report.duration_ms).unwrap();

        let failures: Vec<_> = report.files.iter().filter(|f| !f.is_ok()).collect();
        if !failures.is_empty() {
            writeln!(output, "\nFailures:").unwrap();
            for file in failures {
                writeln!(
                    output,
                    "  {} {}: {}",
                    style("✗").red(),
                    file.path.display(),
                    file.error.as_deref().unwrap_or("unknown error")
                )
                .unwrap();
            }
        }
        output
    }

    fn format_import_report(&self, report: &ImportReport) -> String {
        format!(
            "Imported {} knowledge-base entries ({} chunks, {} already indexed, {} with curated follow-ups)\n",
            report.entries, report.chunks_added, report.chunks_skipped, report.followups_merged
        )
    }

    fn format_history(&self, session_id: &str, turns: &[ConversationTurn]) -> String {
        if turns.is_empty() {
            return format!("No history for session {}\n", session_id);
        }

        let mut output = String::new();
        writeln!(output, "Session {}", session_id).unwrap();
        writeln!(output, "--------{}", "-".repeat(session_id.len())).unwrap();
        for turn in turns {
            writeln!(
                output,
                "[{}] {}:",
                turn.timestamp.format("%Y-%m-%d %H:%M:%S"),
                style(role_label(turn.role)).bold()
            )
            .unwrap();
            for line in turn.content.lines() {
                writeln!(output, "  {}", line).unwrap();
            }
        }
        output
    }

    fn format_sessions(&self, sessions: &[SessionSummary]) -> String {
        if sessions.is_empty() {
            return "No sessions found.\n".to_string();
        }

        let mut output = String::new();
        writeln!(output, "Recent Sessions").unwrap();
        writeln!(output, "---------------").unwrap();
        for session in sessions {
            writeln!(
                output,
                "{}  {}  ({} turns)",
                session.session_id,
                session.last_activity.format("%Y-%m-%d %H:%M"),
                session.turn_count
            )
            .unwrap();
            writeln!(output, "  {}", session.title).unwrap();
        }
        output
    }

    fn format_status(&self, status: &StatusInfo) -> String {
        let mut output = String::new();
        writeln!(output, "Status").unwrap();
        writeln!(output, "------").unwrap();

        let daemon_status = if status.daemon_running {
            style("[RUNNING]").green()
        } else {
            style("[STOPPED]").yellow()
        };
        writeln!(output, "Daemon:        {}", daemon_status).unwrap();
        if let Some(pid) = status.daemon_pid {
            writeln!(output, "  PID:         {}", pid).unwrap();
        }
        if let Some(idle) = status.daemon_idle_secs {
            writeln!(output, "  Idle:        {}s", idle).unwrap();
        }
        if let Some(served) = status.requests_served {
            writeln!(output, "  Requests:    {}", served).unwrap();
        }
        if let Some(ref m) = status.metrics {
            writeln!(output, "  Queries:     {}", m.total_queries).unwrap();
            writeln!(output, "  Avg Latency: {}ms", m.avg_latency_ms).unwrap();
            for (path, count) in &m.by_path {
                writeln!(output, "    {:<14} {}", path, count).unwrap();
            }
            if m.fallback_rate() > 0.0 {
                writeln!(output, "  Fallbacks:   {:.1}%", m.fallback_rate()).unwrap();
            }
        }
        writeln!(output).unwrap();

        writeln!(output, "Index:         {}", status.index_dir).unwrap();
        if let Some(ref service) = status.service {
            let index = &service.index;
            writeln!(output, "  Chunks:      {}", index.chunks).unwrap();
            writeln!(output, "  KB entries:  {}", index.kb_entries).unwrap();
            writeln!(output, "  Sources:     {}", index.sources).unwrap();
            writeln!(
                output,
                "  Embedding:   {} (dim={})",
                index.embedding_model, index.dimension
            )
            .unwrap();
            writeln!(
                output,
                "  Reranker:    {}",
                index.reranker.as_deref().unwrap_or("disabled")
            )
            .unwrap();
            writeln!(output).unwrap();
            writeln!(output, "Providers:     {}", service.providers.join(" -> ")).unwrap();
            writeln!(output, "Persona:       {}", service.default_persona.as_str()).unwrap();
            writeln!(output, "Follow-ups:    {} curated", service.curated_followups).unwrap();
        }
        if let Some(ref path) = status.config_path {
            writeln!(output, "Config:        {}", path).unwrap();
        }

        output
    }

    fn format_message(&self, message: &str) -> String {
        format!("{}\n", message)
    }

    fn format_error(&self, error: &str) -> String {
        format!("{} {}\n", style("Error:").red().bold(), error)
    }
}

pub struct JsonFormatter {
    pub pretty: bool,
}

impl JsonFormatter {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn render(&self, value: &impl Serialize) -> String {
        let rendered = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };
        match rendered {
            Ok(json) => format!("{}\n", json),
            Err(e) => format!("{}\n", serde_json::json!({"error": e.to_string()})),
        }
    }
}

impl Formatter for JsonFormatter {
    fn format_answer(&self, answer: &QueryResponse) -> String {
        self.render(answer)
    }

    fn format_search_results(&self, results: &SearchResults) -> String {
        self.render(results)
    }

    fn format_ingest_report(&self, report: &IngestReport) -> String {
        self.render(report)
    }

    fn format_import_report(&self, report: &ImportReport) -> String {
        self.render(report)
    }

    fn format_history(&self, session_id: &str, turns: &[ConversationTurn]) -> String {
        self.render(&serde_json::json!({"session_id": session_id, "turns": turns}))
    }

    fn format_sessions(&self, sessions: &[SessionSummary]) -> String {
        self.render(&serde_json::json!({"sessions": sessions}))
    }

    fn format_status(&self, status: &StatusInfo) -> String {
        self.render(status)
    }

    fn format_message(&self, message: &str) -> String {
        format!("{}\n", serde_json::json!({"message": message}))
    }

    fn format_error(&self, error: &str) -> String {
        format!("{}\n", serde_json::json!({"error": error}))
    }
}

pub struct MarkdownFormatter;

impl Formatter for MarkdownFormatter {
    fn format_answer(&self, answer: &QueryResponse) -> String {
        let data = &answer.data;
        let mut output = String::new();
        writeln!(output, "{}\n", data.response).unwrap();

        writeln!(output, "| Field | Value |").unwrap();
        writeln!(output, "|-------|-------|").unwrap();
        writeln!(output, "| Status | {} |", status_label(data.status)).unwrap();
        writeln!(output, "| Type | {:?} |", data.conversation_type).unwrap();
        if !data.relevant_clauses.is_empty() {
            writeln!(output, "| Clauses | {} |", data.relevant_clauses.join(", ")).unwrap();
        }
        writeln!(output, "| Session | `{}` |", answer.session_id).unwrap();
        writeln!(output).unwrap();

        if let Some(reasoning) = data.reasoning.as_deref().filter(|r| !r.trim().is_empty()) {
            writeln!(output, "### Reasoning\n\n{}\n", reasoning).unwrap();
        }
        if !data.sources.is_empty() {
            writeln!(output, "### Sources\n").unwrap();
            for source in &data.sources {
                writeln!(
                    output,
                    "- **{}** ({:.2}): {}",
                    source.document_name,
                    source.relevance_score,
                    excerpt(&source.excerpt, PREVIEW_CHARS)
                )
                .unwrap();
            }
            writeln!(output).unwrap();
        }
        if !data.follow_up_questions.is_empty() {
            writeln!(output, "### Related Questions\n").unwrap();
            for question in &data.follow_up_questions {
                writeln!(output, "- {}", question).unwrap();
            }
        }
        output
    }

    fn format_search_results(&self, results: &SearchResults) -> String {
        if results.is_empty() {
            return format!("## No results found\n\nQuery: `{}`\n", results.query);
        }

        let mut output = String::new();
        writeln!(output, "## Search Results\n").unwrap();
        writeln!(output, "**Query:** `{}`\n", results.query).unwrap();
        writeln!(
            output,
            "Found {} results in {}ms\n",
            results.len(),
            results.duration_ms
        )
        .unwrap();

        for (i, hit) in results.results.iter().enumerate() {
            writeln!(output, "### {}. Score: {:.3}\n", i + 1, hit.score).unwrap();
            writeln!(output, "**Source:** `{}`\n", hit.chunk.metadata.display_name()).unwrap();
            writeln!(output, "```").unwrap();
            writeln!(output, "{}", hit.chunk.text).unwrap();
            writeln!(output, "```\n").unwrap();
        }

        output
    }

    fn format_ingest_report(&self, report: &IngestReport) -> String {
        let mut output = String::new();
        writeln!(output, "## Ingestion Complete\n").unwrap();
        writeln!(output, "| Metric | Value |").unwrap();
        writeln!(output, "|--------|-------|").unwrap();
        writeln!(output, "| Files ingested | {} |", report.succeeded()).unwrap();
        writeln!(output, "| Files failed | {} |", report.failed()).unwrap();
        writeln!(output, "| Files skipped | {} |", report.skipped).unwrap();
        writeln!(output, "| Chunks added | {} |", report.chunks_added).unwrap();
        writeln!(output, "| Duration | {}ms |", report.duration_ms).unwrap();
        for file in report.files.iter().filter(|f| !f.is_ok()) {
            writeln!(
                output,
                "\n- ❌ `{}`: {}",
                file.path.display(),
                file.error.as_deref().unwrap_or("unknown error")
            )
            .unwrap();
        }
        output
    }

    fn format_import_report(&self, report: &ImportReport) -> String {
        format!(
            "> Imported **{}** knowledge-base entries ({} chunks, {} already indexed, {} with curated follow-ups)\n",
            report.entries, report.chunks_added, report.chunks_skipped, report.followups_merged
        )
    }

    fn format_history(&self, session_id: &str, turns: &[ConversationTurn]) -> String {
        let mut output = String::new();
        writeln!(output, "## Session `{}`\n", session_id).unwrap();
        if turns.is_empty() {
            writeln!(output, "*No history.*").unwrap();
            return output;
        }
        for turn in turns {
            writeln!(
                output,
                "**{}** _{}_\n\n{}\n",
                role_label(turn.role),
                turn.timestamp.format("%Y-%m-%d %H:%M:%S"),
                turn.content
            )
            .unwrap();
        }
        output
    }

    fn format_sessions(&self, sessions: &[SessionSummary]) -> String {
        if sessions.is_empty() {
            return "## Sessions\n\n*No sessions found.*\n".to_string();
        }

        let mut output = String::new();
        writeln!(output, "## Sessions\n").unwrap();
        writeln!(output, "| Session | Title | Turns | Last Activity |").unwrap();
        writeln!(output, "|---------|-------|-------|---------------|").unwrap();
        for s in sessions {
            writeln!(
                output,
                "| `{}` | {} | {} | {} |",
                s.session_id,
                s.title.replace('|', "\\|"),
                s.turn_count,
                s.last_activity.format("%Y-%m-%d %H:%M")
            )
            .unwrap();
        }
        output
    }

    fn format_status(&self, status: &StatusInfo) -> String {
        let mut output = String::new();
        writeln!(output, "## Status\n").unwrap();

        let daemon_status = if status.daemon_running { "✅" } else { "❌" };
        writeln!(output, "### Daemon {}\n", daemon_status).unwrap();
        if let Some(ref m) = status.metrics {
            writeln!(output, "- **Queries:** {}", m.total_queries).unwrap();
            writeln!(output, "- **Avg Latency:** {}ms", m.avg_latency_ms).unwrap();
            for (path, count) in &m.by_path {
                writeln!(output, "- **{}:** {}", path, count).unwrap();
            }
        }
        writeln!(output).unwrap();

        writeln!(output, "### Index\n").unwrap();
        writeln!(output, "- **Directory:** `{}`", status.index_dir).unwrap();
        if let Some(ref service) = status.service {
            writeln!(output, "- **Chunks:** {}", service.index.chunks).unwrap();
            writeln!(output, "- **KB entries:** {}", service.index.kb_entries).unwrap();
            writeln!(output, "- **Embedding:** {}", service.index.embedding_model).unwrap();
            writeln!(output, "- **Providers:** {}", service.providers.join(" → ")).unwrap();
        }

        output
    }

    fn format_message(&self, message: &str) -> String {
        format!("> {}\n", message)
    }

    fn format_error(&self, error: &str) -> String {
        format!("> ⚠️ **Error:** {}\n", error)
    }
}

pub fn get_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Text => Box::new(TextFormatter),
        OutputFormat::Json => Box::new(JsonFormatter::new(true)),
        OutputFormat::Markdown => Box::new(MarkdownFormatter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnswerPath, Assessment, SourceCitation};

    fn answer() -> QueryResponse {
        QueryResponse {
            session_id: "s-1".to_string(),
            data: Assessment {
                response: "Retain data for 90 days.".to_string(),
                status: Some(ComplianceStatus::Compliant),
                relevant_clauses: vec!["Art.5".to_string()],
                sources: vec![SourceCitation {
                    document_name: "Data retention".to_string(),
                    excerpt: "Entities must retain data for 90 days.".to_string(),
                    relevance_score: 1.0,
                }],
                follow_up_questions: vec!["What about backups?".to_string()],
                ..Default::default()
            },
            path: Some(AnswerPath::FastPath),
        }
    }

    #[test]
    fn test_text_answer() {
        let out = TextFormatter.format_answer(&answer());
        assert!(out.starts_with("Retain data for 90 days."));
        assert!(out.contains("Data retention"));
        assert!(out.contains("What about backups?"));
        assert!(out.contains("fast_path"));
    }

    #[test]
    fn test_json_answer_is_parseable() {
        let out = JsonFormatter::new(false).format_answer(&answer());
        let value: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(value["data"]["response"], "Retain data for 90 days.");
        assert_eq!(value["data"]["status"], "Compliant");
        assert_eq!(value["path"], "fast_path");
    }

    #[test]
    fn test_markdown_sessions_escape_pipes() {
        let sessions = vec![SessionSummary {
            session_id: "s".to_string(),
            title: "a | b".to_string(),
            last_activity: chrono::Utc::now(),
            turn_count: 2,
        }];
        let out = MarkdownFormatter.format_sessions(&sessions);
        assert!(out.contains("a \\| b"));
    }
}
