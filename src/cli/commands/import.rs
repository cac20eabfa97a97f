//! Import command implementation.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use crate::cli::backend::Backend;
use crate::cli::output::get_formatter;
use crate::models::{Config, OutputFormat};
use crate::services::knowledge_base::load_entries;

/// Arguments for the import command.
#[derive(Debug, Args)]
pub struct ImportArgs {
    /// Path to a JSON array or JSONL file of curated entries
    #[arg(required = true)]
    pub file: PathBuf,

    /// Only validate the import file without indexing
    #[arg(long)]
    pub validate_only: bool,
}

pub async fn handle_import(
    args: ImportArgs,
    format: OutputFormat,
    verbose: bool,
    local: bool,
) -> Result<()> {
    let config = Config::load()?;
    let formatter = get_formatter(format);

    // Parsing locally first gives line-accurate errors before any daemon round trip.
    let entries = load_entries(&args.file).await?;
    if entries.is_empty() {
        println!("{}", formatter.format_message("No entries found in input."));
        return Ok(());
    }

    if verbose || args.validate_only {
        eprintln!("Found {} entries in {}", entries.len(), args.file.display());
    }

    if args.validate_only {
        println!(
            "{}",
            formatter.format_message(&format!(
                "Validation successful: {} entries ready for import",
                entries.len()
            ))
        );
        return Ok(());
    }

    let backend = Backend::connect(&config, local).await?;
    let report = backend.import(args.file).await?;

    print!("{}", formatter.format_import_report(&report));

    Ok(())
}
