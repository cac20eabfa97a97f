use anyhow::Result;
use clap::Args;

use crate::cli::backend::Backend;
use crate::cli::output::get_formatter;
use crate::models::{Config, OutputFormat};

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(required = true, help = "Session id returned by `ask`")]
    pub session: String,

    #[arg(long, short = 'n', help = "Number of most recent turns to show")]
    pub limit: Option<usize>,
}

pub async fn handle_history(args: HistoryArgs, format: OutputFormat, local: bool) -> Result<()> {
    let session = args.session.trim();
    if session.is_empty() {
        anyhow::bail!("session id cannot be empty");
    }
    if args.limit == Some(0) {
        anyhow::bail!("limit must be at least 1");
    }

    let config = Config::load()?;
    let formatter = get_formatter(format);
    let backend = Backend::connect(&config, local).await?;

    let turns = backend.history(session, args.limit).await?;
    print!("{}", formatter.format_history(session, &turns));

    Ok(())
}
