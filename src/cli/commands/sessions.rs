use anyhow::Result;
use clap::Args;

use crate::cli::backend::Backend;
use crate::cli::output::get_formatter;
use crate::models::{Config, OutputFormat};

#[derive(Debug, Args)]
pub struct SessionsArgs {
    #[arg(long, short = 'u', help = "Only sessions recorded for this user")]
    pub user: Option<String>,

    #[arg(long, short = 'n', default_value_t = 20, help = "Maximum sessions to list")]
    pub limit: usize,
}

pub async fn handle_sessions(args: SessionsArgs, format: OutputFormat, local: bool) -> Result<()> {
    if args.limit == 0 {
        anyhow::bail!("limit must be at least 1");
    }

    let config = Config::load()?;
    let formatter = get_formatter(format);
    let backend = Backend::connect(&config, local).await?;

    let sessions = backend.sessions(args.user.as_deref(), args.limit).await?;
    print!("{}", formatter.format_sessions(&sessions));

    Ok(())
}
