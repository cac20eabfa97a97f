//! Command-line interface for the compliance answer service.

pub mod backend;
pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

use crate::models::OutputFormat;

/// Grounded answers to regulatory compliance questions over your own documents.
#[derive(Debug, Parser)]
#[command(name = "crag")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[arg(
        long,
        short = 'f',
        global = true,
        help = "Output format: text, json, or markdown"
    )]
    pub format: Option<OutputFormat>,

    #[arg(long, short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(
        long,
        global = true,
        help = "Run in this process instead of through the daemon"
    )]
    pub local: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Ask a compliance question
    Ask(commands::AskArgs),

    /// Search indexed chunks without generating an answer
    Search(commands::SearchArgs),

    /// Ingest documents (PDF, text, markdown) into the index
    Ingest(commands::IngestArgs),

    /// Import curated knowledge-base entries from JSON/JSONL
    Import(commands::ImportArgs),

    /// Show the turns of a conversation session
    History(commands::HistoryArgs),

    /// List recent conversation sessions
    Sessions(commands::SessionsArgs),

    /// Show daemon, index, and provider status
    Status,

    /// Manage the background daemon
    Serve(commands::ServeArgs),

    /// Manage configuration
    #[command(subcommand)]
    Config(commands::ConfigCommand),
}
