//! Where a command runs: through the daemon, or against an in-process service.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::client::DaemonClient;
use crate::models::{Config, ConversationTurn, QueryResponse, SearchResults, SessionSummary};
use crate::services::{AskRequest, ComplianceService, ImportReport, IngestReport};

pub enum Backend {
    Daemon(DaemonClient),
    Local(Box<ComplianceService>),
}

impl Backend {
    /// Prefer the daemon (starting it when `daemon.auto_start` is set); fall
    /// back to an in-process service when it cannot be reached or `local` is set.
    pub async fn connect(config: &Config, local: bool) -> Result<Self> {
        if !local {
            let client = DaemonClient::new(config);
            if client.is_running() || client.auto_start() {
                match client.ensure_running().await {
                    Ok(()) => return Ok(Backend::Daemon(client)),
                    Err(e) => {
                        tracing::warn!(error = %e, "daemon unavailable, running in-process");
                    }
                }
            }
        }
        Self::local(config)
    }

    pub fn local(config: &Config) -> Result<Self> {
        let service =
            ComplianceService::from_config(config).context("failed to initialise service")?;
        Ok(Backend::Local(Box::new(service)))
    }

    pub fn is_daemon(&self) -> bool {
        matches!(self, Backend::Daemon(_))
    }

    pub async fn ask(&self, request: AskRequest) -> Result<QueryResponse> {
        match self {
            Backend::Daemon(client) => Ok(client.ask(request).await?),
            Backend::Local(service) => Ok(service.ask(request).await),
        }
    }

    pub async fn search(&self, query: &str, limit: Option<usize>) -> Result<SearchResults> {
        match self {
            Backend::Daemon(client) => Ok(client.search(query.to_string(), limit).await?),
            Backend::Local(service) => Ok(service.search(query, limit).await?),
        }
    }

    pub async fn ingest(&self, paths: Vec<PathBuf>, exclude: Vec<String>) -> Result<IngestReport> {
        match self {
            Backend::Daemon(client) => Ok(client.ingest(absolute_all(paths)?, exclude).await?),
            Backend::Local(service) => Ok(service.ingest_paths(&paths, &exclude, |_| {}).await?),
        }
    }

    pub async fn import(&self, path: PathBuf) -> Result<ImportReport> {
        match self {
            Backend::Daemon(client) => Ok(client.import(std::path::absolute(&path)?).await?),
            Backend::Local(service) => Ok(service.import_entries(&path).await?),
        }
    }

    pub async fn history(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<ConversationTurn>> {
        match self {
            Backend::Daemon(client) => Ok(client.history(session_id.to_string(), limit).await?),
            Backend::Local(service) => Ok(service.history(session_id, limit).await?),
        }
    }

    pub async fn sessions(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<SessionSummary>> {
        match self {
            Backend::Daemon(client) => Ok(client
                .sessions(user_id.map(str::to_string), limit)
                .await?),
            Backend::Local(service) => Ok(service.sessions(user_id, limit).await?),
        }
    }
}

/// The daemon resolves paths against its own working directory.
fn absolute_all(paths: Vec<PathBuf>) -> std::io::Result<Vec<PathBuf>> {
    paths.iter().map(std::path::absolute).collect()
}
