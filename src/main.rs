use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use compliance_rag::cli::commands::{
    handle_ask, handle_config, handle_history, handle_import, handle_ingest, handle_search,
    handle_serve, handle_sessions, handle_status,
};
use compliance_rag::cli::output::get_formatter;
use compliance_rag::cli::{Cli, Commands};
use compliance_rag::models::{Config, LogConfig, OutputFormat};

/// Detect ONNX Runtime library path and set ORT_DYLIB_PATH if not already set.
/// Must be called before any ort code runs.
fn detect_and_set_ort_path() {
    if std::env::var("ORT_DYLIB_PATH")
        .map(|p| Path::new(&p).exists())
        .unwrap_or(false)
    {
        return;
    }

    let home = std::env::var("HOME").unwrap_or_default();

    let found = if cfg!(target_os = "macos") {
        [
            format!("{home}/.local/lib/compliance-rag/libonnxruntime.dylib"),
            "/opt/homebrew/opt/onnxruntime/lib/libonnxruntime.dylib".into(),
            "/usr/local/opt/onnxruntime/lib/libonnxruntime.dylib".into(),
        ]
        .into_iter()
        .find(|p| Path::new(p).exists())
    } else if cfg!(target_os = "linux") {
        [
            format!("{home}/.local/lib/compliance-rag/libonnxruntime.so"),
            "/usr/lib/libonnxruntime.so".into(),
            "/usr/local/lib/libonnxruntime.so".into(),
            "/usr/lib/x86_64-linux-gnu/libonnxruntime.so".into(),
            "/usr/lib/aarch64-linux-gnu/libonnxruntime.so".into(),
        ]
        .into_iter()
        .find(|p| Path::new(p).exists())
    } else {
        None
    };

    if let Some(path) = found {
        // SAFETY: Called at program start before any threads are spawned.
        unsafe {
            std::env::set_var("ORT_DYLIB_PATH", path);
        }
    }
}

/// `RUST_LOG` wins; otherwise the configured level, raised to debug by `--verbose`.
fn init_tracing(log: &LogConfig, verbose: bool) {
    let default_filter = if verbose {
        "compliance_rag=debug".to_string()
    } else {
        log.level.clone()
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let fmt_layer = if log.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    detect_and_set_ort_path();

    let cli = Cli::parse();
    let config = Config::load().unwrap_or_default();
    init_tracing(&config.log, cli.verbose);

    let format = cli.format.unwrap_or(config.output.default_format);
    let verbose = cli.verbose;
    let local = cli.local;

    // The daemon installs its own signal handlers so it can remove its socket.
    if matches!(cli.command, Commands::Serve(_)) {
        return run_command(cli.command, format, verbose, local).await;
    }

    tokio::select! {
        result = run_command(cli.command, format, verbose, local) => {
            if let Err(e) = result {
                eprint!("{}", get_formatter(format).format_error(&format!("{e:#}")));
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            eprintln!("\nReceived shutdown signal, cleaning up...");
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        }
    }

    Ok(())
}

async fn run_command(
    command: Commands,
    format: OutputFormat,
    verbose: bool,
    local: bool,
) -> Result<()> {
    match command {
        Commands::Ask(args) => {
            handle_ask(args, format, verbose, local).await?;
        }
        Commands::Search(args) => {
            handle_search(args, format, verbose, local).await?;
        }
        Commands::Ingest(args) => {
            handle_ingest(args, format, verbose, local).await?;
        }
        Commands::Import(args) => {
            handle_import(args, format, verbose, local).await?;
        }
        Commands::History(args) => {
            handle_history(args, format, local).await?;
        }
        Commands::Sessions(args) => {
            handle_sessions(args, format, local).await?;
        }
        Commands::Status => {
            handle_status(format, verbose).await?;
        }
        Commands::Serve(args) => {
            handle_serve(args).await?;
        }
        Commands::Config(cmd) => {
            handle_config(cmd, format).await?;
        }
    }

    Ok(())
}

/// Resolves on SIGINT or SIGTERM. A handler that fails to install never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
