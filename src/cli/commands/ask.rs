use anyhow::Result;
use clap::Args;
use std::time::Instant;

use crate::cli::backend::Backend;
use crate::cli::output::get_formatter;
use crate::models::{Config, OutputFormat, Persona};
use crate::services::AskRequest;

#[derive(Debug, Args)]
pub struct AskArgs {
    #[arg(required = true, help = "Compliance question")]
    pub query: String,

    #[arg(long, short = 's', help = "Continue an existing conversation session")]
    pub session: Option<String>,

    #[arg(
        long,
        short = 'p',
        help = "Answer tone: strict_formal, educational, risk_focused, or concise"
    )]
    pub persona: Option<Persona>,

    #[arg(long, short = 'u', help = "User id recorded with the conversation")]
    pub user: Option<String>,
}

pub async fn handle_ask(args: AskArgs, format: OutputFormat, verbose: bool, local: bool) -> Result<()> {
    let query = args.query.trim();
    if query.is_empty() {
        anyhow::bail!("question cannot be empty");
    }

    let config = Config::load()?;
    let formatter = get_formatter(format);
    let backend = Backend::connect(&config, local).await?;

    if verbose {
        eprintln!("Question: \"{query}\"");
        if let Some(ref session) = args.session {
            eprintln!("  Session: {session}");
        }
        eprintln!(
            "  Persona: {}",
            args.persona.unwrap_or(config.generation.default_persona)
        );
        eprintln!(
            "  Backend: {}",
            if backend.is_daemon() { "daemon" } else { "in-process" }
        );
    }

    let start = Instant::now();
    let request = AskRequest {
        query: query.to_string(),
        session_id: args.session,
        persona: args.persona,
        user_id: args.user,
    };
    let response = backend.ask(request).await?;

    if verbose {
        eprintln!("Answered in {}ms", start.elapsed().as_millis());
        eprintln!();
    }

    print!("{}", formatter.format_answer(&response));

    Ok(())
}
