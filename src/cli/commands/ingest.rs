use anyhow::Result;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::backend::Backend;
use crate::cli::output::get_formatter;
use crate::models::{Config, OutputFormat};
use crate::services::ingest::collect_files;

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Files or directories to ingest (PDF, text, markdown)
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// File patterns to exclude (can be specified multiple times)
    #[arg(long, short = 'e')]
    pub exclude: Vec<String>,

    /// Show what would be ingested without touching the index
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn handle_ingest(
    args: IngestArgs,
    format: OutputFormat,
    verbose: bool,
    local: bool,
) -> Result<()> {
    let config = Config::load()?;
    let formatter = get_formatter(format);

    if args.dry_run {
        let collected = collect_files(&args.paths, &args.exclude, &config.ingest);
        for path in &collected.missing {
            eprintln!("Not found: {}", path.display());
        }
        for path in &collected.files {
            println!("{}", path.display());
        }
        println!(
            "{}",
            formatter.format_message(&format!(
                "Dry run: {} files would be ingested ({} skipped)",
                collected.files.len(),
                collected.skipped
            ))
        );
        return Ok(());
    }

    let backend = Backend::connect(&config, local).await?;

    let report = match &backend {
        Backend::Local(service) => {
            let total = collect_files(&args.paths, &args.exclude, &config.ingest)
                .files
                .len();
            let pb = ProgressBar::new(total as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                    )?
                    .progress_chars("#>-"),
            );

            let result = service
                .ingest_paths(&args.paths, &args.exclude, |outcome| {
                    pb.inc(1);
                    if let Some(ref e) = outcome.error {
                        pb.println(format!("Skipping {}: {}", outcome.path.display(), e));
                    } else if verbose {
                        pb.println(format!(
                            "{} ({} chunks)",
                            outcome.path.display(),
                            outcome.chunks
                        ));
                    }
                })
                .await;
            pb.finish_and_clear();
            result?
        }
        Backend::Daemon(_) => {
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
            spinner.set_message("Ingesting through daemon...");
            spinner.enable_steady_tick(Duration::from_millis(100));

            let result = backend.ingest(args.paths, args.exclude).await;
            spinner.finish_and_clear();
            result?
        }
    };

    print!("{}", formatter.format_ingest_report(&report));

    if report.failed() > 0 && report.succeeded() == 0 {
        anyhow::bail!("no files were ingested");
    }

    Ok(())
}
