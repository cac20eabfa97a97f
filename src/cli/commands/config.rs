use anyhow::{Context, Result};
use clap::Subcommand;
use std::process::Command;

use crate::cli::output::{Formatter, get_formatter};
use crate::models::{Config, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    #[command(about = "Write the default configuration file")]
    Init {
        #[arg(long, short = 'f', help = "Force overwrite existing config")]
        force: bool,
    },
    #[command(about = "Show the effective configuration")]
    Show,
    #[command(about = "Show configuration and data file paths")]
    Path,
    #[command(about = "Edit configuration file")]
    Edit,
}

pub async fn handle_config(cmd: ConfigCommand, format: OutputFormat) -> Result<()> {
    let formatter = get_formatter(format);

    match cmd {
        ConfigCommand::Init { force } => handle_init(force, formatter.as_ref()),
        ConfigCommand::Show => handle_show(format),
        ConfigCommand::Path => handle_path(),
        ConfigCommand::Edit => handle_edit(formatter.as_ref()),
    }
}

fn config_path() -> Result<std::path::PathBuf> {
    Config::config_path().ok_or_else(|| anyhow::anyhow!("could not determine config directory"))
}

fn handle_init(force: bool, formatter: &dyn Formatter) -> Result<()> {
    let path = config_path()?;
    if path.exists() && !force {
        anyhow::bail!(
            "Config already exists at: {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let path = Config::default().save().context("failed to write config")?;
    println!(
        "{}",
        formatter.format_message(&format!("Created config at: {}", path.display()))
    );
    Ok(())
}

fn handle_show(format: OutputFormat) -> Result<()> {
    let config = Config::load()?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    match Config::config_path() {
        Some(path) if path.exists() => println!("# Config: {}", path.display()),
        _ => println!("# Config: built-in defaults"),
    }
    for provider in &config.generation.providers {
        if let Some(ref var) = provider.api_key_env {
            let state = if std::env::var(var).is_ok_and(|v| !v.trim().is_empty()) {
                "set"
            } else {
                "missing"
            };
            println!("# {} key ({var}): {state}", provider.name);
        }
    }
    println!();
    print!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}

fn handle_path() -> Result<()> {
    let config = Config::load()?;
    let path = config_path()?;

    println!("Configuration paths:");
    println!();
    if path.exists() {
        println!("Config (active): {}", path.display());
    } else {
        println!("Config (would be): {}", path.display());
    }

    if let Ok(cwd) = std::env::current_dir() {
        let env_path = cwd.join(".env");
        if env_path.exists() {
            println!(".env file (active): {}", env_path.display());
        }
    }

    println!();
    println!("Index:      {}", config.index_dir().display());
    println!("History:    {}", config.history_db_path().display());
    println!("Metrics:    {}", config.metrics_db_path().display());
    println!("Follow-ups: {}", config.followups_path().display());
    println!("Socket:     {}", config.socket_path().display());

    Ok(())
}

fn handle_edit(formatter: &dyn Formatter) -> Result<()> {
    let path = config_path()?;
    if !path.exists() {
        Config::default().save().context("failed to write config")?;
        println!(
            "{}",
            formatter.format_message(&format!("Created config at: {}", path.display()))
        );
    }

    let editor = std::env::var("EDITOR")
        .unwrap_or_else(|_| std::env::var("VISUAL").unwrap_or_else(|_| "vim".into()));

    Command::new(&editor)
        .arg(&path)
        .status()
        .context(format!("failed to open editor: {}", editor))?;

    Config::load_from(&path).context("edited config is invalid")?;
    Ok(())
}
