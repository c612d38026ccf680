mod backfill;
mod cli;
mod config;
mod crawl;
mod daemon;
mod db;
mod discovery;
mod error;
mod ingest;
mod models;
mod quality;
mod resolver;
mod scoring;
mod store;
mod stream;
mod supervisor;
mod telegram;
mod translate;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::config::{load_config, validate_config};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    let default_filter = if cli.debug { "debug" } else { config.log_level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config_path = %cli.config.display(), "config loaded");

    validate_config(&config).context("config validation failed")?;

    match cli.command {
        Some(Commands::Login) => {
            let client = telegram::connect(&config).await.context("connecting to Telegram")?;
            telegram::login(&client, &config).await.context("Telegram login")?;
            println!("Session saved. The watcher can now run unattended.");
        }
        Some(Commands::Status) => {
            let client = telegram::connect(&config).await.context("connecting to Telegram")?;
            telegram::status(&client).await.context("Telegram status")?;
        }
        None => {
            daemon::run(&cli, config).await?;
        }
    }

    Ok(())
}
