//! Conduit
//!
//! Operator command line for the Conduit pipeline orchestrator.

mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use conduit_orchestrator::Config;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "conduit")]
#[command(about = "Conduit CI/CD Pipeline Orchestrator", long_about = None)]
struct Cli {
    /// Extra JSON file listing providers and templates, read after CONDUIT_CONFIG
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit_orchestrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(path) = cli.config {
        config = config.with_file(&path)?;
    }
    config.validate()?;

    handle_command(cli.command, config).await
}
