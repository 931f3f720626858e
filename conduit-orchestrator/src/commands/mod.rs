//! Commands module
//!
//! Defines all CLI commands and their handlers. Every command runs the
//! orchestrator in-process against the configured store.

mod execution;
mod provider;
mod serve;
mod stats;

pub use execution::RunArgs;

use anyhow::{Context, Result};
use clap::Subcommand;
use conduit_orchestrator::store::{ExecutionStore, MemoryStore, PgExecutionStore};
use conduit_orchestrator::{Config, Orchestrator, db};
use std::sync::Arc;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Recover unfinished executions and run the orchestrator until Ctrl-C
    Serve,
    /// Probe every provider once and list them
    Providers,
    /// Submit an execution and follow it to a terminal state
    Run(RunArgs),
    /// Show one execution
    Status {
        /// Execution ID
        id: String,
    },
    /// List executions, newest first
    List {
        /// Only executions in this state (repeatable)
        #[arg(long)]
        state: Vec<String>,

        /// Only executions dispatched to this provider
        #[arg(long)]
        provider: Option<String>,

        /// Only executions created from this template
        #[arg(long)]
        template: Option<String>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show execution statistics
    Stats {
        /// Size of the window, in hours, ending now
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
}

/// Handle a CLI command
///
/// Builds the orchestrator from configuration and routes the command to the
/// appropriate handler module.
///
/// # Arguments
/// * `command` - The command to execute
/// * `config` - The validated orchestrator configuration
pub async fn handle_command(command: Commands, config: Config) -> Result<()> {
    let orchestrator = build_orchestrator(config).await?;

    match command {
        Commands::Serve => serve::serve(&orchestrator).await,
        Commands::Providers => provider::list_providers(&orchestrator).await,
        Commands::Run(args) => execution::run(&orchestrator, args).await,
        Commands::Status { id } => execution::status(&orchestrator, &id).await,
        Commands::List {
            state,
            provider,
            template,
            offset,
            limit,
        } => execution::list(&orchestrator, state, provider, template, offset, limit).await,
        Commands::Stats { hours } => stats::show(&orchestrator, hours).await,
    }
}

/// Connects the store and builds providers and templates from configuration
async fn build_orchestrator(config: Config) -> Result<Orchestrator> {
    let store: Arc<dyn ExecutionStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = db::create_pool(url)
                .await
                .context("Failed to create database pool")?;
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            Arc::new(PgExecutionStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; executions are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    Orchestrator::from_config(config, store).context("Failed to build orchestrator")
}
