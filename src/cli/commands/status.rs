use anyhow::Result;

use crate::cli::output::{StatusInfo, get_formatter};
use crate::client::DaemonClient;
use crate::models::{Config, OutputFormat};
use crate::services::{ComplianceService, MetricsStore};

pub async fn handle_status(format: OutputFormat, verbose: bool) -> Result<()> {
    let config = Config::load()?;
    let formatter = get_formatter(format);

    let client = DaemonClient::new(&config);
    let remote = if client.is_running() {
        match client.status().await {
            Ok(status) => Some(status),
            Err(e) => {
                if verbose {
                    eprintln!("Daemon did not answer status: {e}");
                }
                None
            }
        }
    } else {
        None
    };

    let mut status = StatusInfo {
        daemon_running: remote.is_some(),
        daemon_pid: None,
        daemon_idle_secs: None,
        requests_served: None,
        index_dir: config.index_dir().display().to_string(),
        config_path: Config::config_path()
            .filter(|p| p.exists())
            .map(|p| p.display().to_string()),
        service: None,
        metrics: None,
    };

    match remote {
        Some(remote) => {
            status.daemon_pid = Some(remote.pid);
            status.daemon_idle_secs = Some(remote.idle_secs);
            status.requests_served = Some(remote.requests_served);
            status.service = Some(remote.service);
            status.metrics = remote.metrics;
        }
        None => {
            match ComplianceService::from_config(&config) {
                Ok(service) => status.service = Some(service.status()),
                Err(e) => {
                    if verbose {
                        eprintln!("Could not open service: {e}");
                    }
                }
            }
            let metrics_path = config.metrics_db_path();
            if config.metrics.enabled
                && metrics_path.exists()
                && let Ok(store) = MetricsStore::open(&metrics_path)
            {
                status.metrics = Some(store.get_summary(config.metrics.retention_days));
            }
        }
    }

    print!("{}", formatter.format_status(&status));

    let no_providers = status
        .service
        .as_ref()
        .is_some_and(|s| s.providers.is_empty());
    let empty_index = status.service.as_ref().is_some_and(|s| s.index.chunks == 0);

    if !status.daemon_running || no_providers || empty_index {
        eprintln!();
        if !status.daemon_running {
            eprintln!("Hint: daemon not running. It starts automatically on first ask when auto_start is set.");
            eprintln!("      Or start manually with: crag serve");
        }
        if no_providers {
            eprintln!(
                "Warning: no generation providers configured. Answers will use the safe fallback."
            );
        }
        if empty_index {
            eprintln!("Hint: index is empty. Add documents with: crag ingest <paths>");
        }
    }

    Ok(())
}
