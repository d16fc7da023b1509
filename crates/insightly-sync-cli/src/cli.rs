use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "insightly-sync")]
#[command(about = "Export Insightly CRM entities and deliver them to Microsoft 365", version)]
pub struct Cli {
    /// Path to env.yaml (defaults to ./env.yaml, then the user config dir)
    #[arg(long, global = true, env = "INSIGHTLY_SYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run one sync and print the result as JSON (default)
    Sync,
    /// Refresh the Microsoft access token once and print its expiry
    Token,
    /// Load and validate configuration
    CheckConfig,
    /// Serve the HTTP trigger (Azure Functions custom handler)
    Serve,
}

impl Cli {
    pub fn subcommand(&self) -> Commands {
        self.command.unwrap_or(Commands::Sync)
    }
}
