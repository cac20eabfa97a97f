use anyhow::Result;
use clap::Args;

use crate::cli::backend::Backend;
use crate::cli::output::get_formatter;
use crate::models::{Config, OutputFormat};

#[derive(Debug, Args)]
pub struct SearchArgs {
    #[arg(required = true, help = "Search query text")]
    pub query: String,

    #[arg(long, short = 'n', help = "Maximum number of chunks to return")]
    pub limit: Option<usize>,
}

pub async fn handle_search(
    args: SearchArgs,
    format: OutputFormat,
    verbose: bool,
    local: bool,
) -> Result<()> {
    let query = args.query.trim();
    if query.is_empty() {
        anyhow::bail!("search query cannot be empty");
    }

    let config = Config::load()?;
    let formatter = get_formatter(format);

    let limit = args.limit.unwrap_or(config.retrieval.top_k);
    if limit == 0 {
        anyhow::bail!("limit must be at least 1");
    }

    if verbose {
        eprintln!("Query: \"{query}\"");
        eprintln!("  Limit: {limit}");
        if config.retrieval.rerank.enabled {
            eprintln!("  Rerank: {:?}", config.retrieval.rerank.kind);
        }
    }

    let backend = Backend::connect(&config, local).await?;
    let results = backend.search(query, Some(limit)).await?;

    if verbose {
        eprintln!("Timing: {}ms", results.duration_ms);
        eprintln!();
    }

    print!("{}", formatter.format_search_results(&results));

    Ok(())
}
