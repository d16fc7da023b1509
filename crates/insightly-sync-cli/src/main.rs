//! insightly-sync - export Insightly CRM data into Microsoft 365.
//!
//! Runs one sync from the command line, or serves the HTTP trigger used by
//! the Azure Functions custom handler.

mod cli;
mod server;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use insightly_sync_core::utils::{elide_middle, redact};
use insightly_sync_core::{config, Config, SyncClient};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands};
use server::AppState;

/// Share links are long; `check-config` only needs enough to recognise them
const SHARE_LINK_DISPLAY_LEN: usize = 72;

/// Initialize the tracing subscriber for logging
fn init_tracing(verbose: bool) {
    // RUST_LOG wins over --verbose
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let path = config_path(&cli);
    match cli.subcommand() {
        Commands::Sync => sync_once(path).await,
        Commands::Token => show_token(path).await,
        Commands::CheckConfig => check_config(path),
        Commands::Serve => serve(path).await,
    }
}

fn config_path(cli: &Cli) -> Option<PathBuf> {
    cli.config.clone().or_else(Config::default_path)
}

fn load_client(path: Option<PathBuf>) -> Result<SyncClient> {
    let config = Config::load(path.as_deref()).context("Failed to load configuration")?;
    SyncClient::new(config).context("Failed to build HTTP client")
}

async fn sync_once(path: Option<PathBuf>) -> Result<ExitCode> {
    let client = load_client(path)?;
    let result = client.sync().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.all_failed() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn show_token(path: Option<PathBuf>) -> Result<ExitCode> {
    let client = load_client(path)?;
    let token = client
        .tokens()
        .access_token()
        .await
        .context("Failed to refresh access token")?;

    println!("Access token valid until {}", token.expires_at.to_rfc3339());
    println!("Expires in {} minutes", token.minutes_until_expiry());
    Ok(ExitCode::SUCCESS)
}

fn check_config(path: Option<PathBuf>) -> Result<ExitCode> {
    match &path {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: none (environment only)"),
    }
    let loaded = Config::load(path.as_deref()).context("Configuration is invalid")?;
    let credentials = &loaded.credentials;

    println!("{:<18} {}", config::CLIENT_ID, credentials.client_id);
    println!("{:<18} {}", config::TENANT_ID, credentials.tenant_id);
    println!("{:<18} {}", config::REFRESH_TOKEN, redact(&credentials.refresh_token));
    println!("{:<18} {}", config::INSIGHTLY_API_KEY, redact(&credentials.api_key));
    println!(
        "{:<18} {}",
        config::CLIENT_SECRET,
        credentials.client_secret.as_deref().map(redact).unwrap_or_else(|| "(not set)".to_string())
    );

    let settings = &loaded.settings;
    println!("Entities:          {}", settings.entities.join(", "));
    println!("Share links:       {}", settings.share_links.len());
    for link in &settings.share_links {
        println!("  {}", elide_middle(link, SHARE_LINK_DISPLAY_LEN));
    }
    println!("Output directory:  {}", settings.output_dir().display());
    Ok(ExitCode::SUCCESS)
}

async fn serve(path: Option<PathBuf>) -> Result<ExitCode> {
    let state = match load_client(path) {
        Ok(client) => AppState::ready(client),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Client setup failed, triggers will report it");
            AppState::failed(format!("{:#}", e))
        }
    };

    let port = server::port_from_env();
    info!(port, "Starting HTTP trigger");
    server::serve(state, port).await?;
    Ok(ExitCode::SUCCESS)
}
