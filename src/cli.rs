use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "periscope", about = "Telegram OSINT watcher — discovers, scores, and archives channel chatter")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    pub config: PathBuf,

    /// Run keyword search discovery before ingesting
    #[arg(long)]
    pub discover: bool,

    /// Backfill history for all targets
    #[arg(long)]
    pub backfill: bool,

    /// Stay running: live stream + periodic maintenance
    #[arg(long)]
    pub run: bool,

    /// Restrict backfill to messages newer than the stored watermark
    #[arg(long)]
    pub new_only: bool,

    /// Verbose logging
    #[arg(long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Interactive MTProto login wizard (phone -> code -> optional 2FA)
    Login,
    /// Show Telegram session status
    Status,
}
