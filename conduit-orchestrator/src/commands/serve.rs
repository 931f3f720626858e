//! Serve command
//!
//! Runs the scheduler, health monitor and tracker loops until interrupted.

use anyhow::{Context, Result};
use colored::*;
use conduit_orchestrator::Orchestrator;

pub async fn serve(orchestrator: &Orchestrator) -> Result<()> {
    let recovery = orchestrator
        .recover()
        .await
        .context("Failed to recover executions")?;

    println!(
        "{} {} ({} provider(s), {} template(s))",
        "Conduit orchestrator".bold(),
        orchestrator.config().instance_id.cyan(),
        orchestrator.registry().len(),
        orchestrator.catalog().list().len()
    );
    if recovery.queued + recovery.in_flight > 0 {
        println!(
            "  Recovered {} queued and {} in-flight execution(s)",
            recovery.queued, recovery.in_flight
        );
    }

    orchestrator.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    println!("{}", "Shutting down...".yellow());
    orchestrator.shutdown().await;

    Ok(())
}
