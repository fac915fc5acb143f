use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use engram::config::VaultConfig;
use engram::embedding::HashedEmbedder;
use engram::vault::Vault;

#[derive(Parser)]
#[command(name = "engram", version, about = "Local-first long-term memory engine for AI agents")]
struct Cli {
    /// Path to a config TOML (default: ~/.engram/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve,
    /// Run one consolidation cycle and exit
    Consolidate,
    /// Print vault statistics as JSON
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => VaultConfig::load_from(path)?,
        None => VaultConfig::load()?,
    };

    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // The keyword-hash embedder keeps the vault serviceable with no model
    // configured; real deployments inject a provider through the library.
    let embedder = Arc::new(HashedEmbedder::new(config.embedding.dimensions));
    let vault = Arc::new(Vault::open(config.clone(), embedder, None)?);

    match cli.command {
        Command::Serve => {
            engram::server::serve(&config, Arc::clone(&vault)).await?;
        }
        Command::Consolidate => {
            let report = vault.consolidate(None)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stats => {
            let stats = vault.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    vault.close();
    Ok(())
}
