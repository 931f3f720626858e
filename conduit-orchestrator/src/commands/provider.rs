//! Provider command handlers
//!
//! Probes the configured providers and prints their live state.

use anyhow::Result;
use colored::*;
use conduit_core::domain::provider::{ConnectionState, HealthStatus};
use conduit_core::dto::provider::{HealthResult, ProviderSummary};
use conduit_orchestrator::Orchestrator;

/// Probe every enabled provider once and list all of them
pub async fn list_providers(orchestrator: &Orchestrator) -> Result<()> {
    let results = orchestrator.check_providers_health().await;
    let providers = orchestrator.get_providers();

    if providers.is_empty() {
        println!("{}", "No providers configured.".yellow());
        return Ok(());
    }

    println!(
        "{}",
        format!("Found {} provider(s):", providers.len()).bold()
    );
    println!();
    for provider in &providers {
        let probe = results.iter().find(|r| r.provider == provider.name);
        print_provider(provider, probe);
    }

    Ok(())
}

fn print_provider(provider: &ProviderSummary, probe: Option<&HealthResult>) {
    println!("  {} {} ({})", "▸".cyan(), provider.name.bold(), provider.kind);

    if !provider.enabled {
        println!("    Status:       {}", "disabled".dimmed());
    } else {
        println!(
            "    Status:       {} / {}",
            colorize_health(provider.health),
            colorize_connection(provider.connection)
        );
    }

    let capabilities: Vec<_> = provider.capabilities.iter().map(|c| c.as_str()).collect();
    println!("    Capabilities: {}", capabilities.join(", "));

    match provider.max_concurrent {
        Some(max) => println!("    In flight:    {}/{}", provider.in_flight, max),
        None => println!("    In flight:    {}", provider.in_flight),
    }

    println!(
        "    Executions:   {} total, {} successful, {} failed",
        provider.counters.total, provider.counters.successful, provider.counters.failed
    );

    if let Some(probe) = probe {
        println!(
            "    Probe:        {}ms{}",
            probe.response_time_ms,
            probe
                .details
                .as_deref()
                .map(|d| format!(" ({})", d))
                .unwrap_or_default()
                .dimmed()
        );
    }
    if let Some(error) = &provider.last_error {
        println!("    Last error:   {}", error.red());
    }
    println!();
}

fn colorize_health(health: HealthStatus) -> ColoredString {
    match health {
        HealthStatus::Healthy => health.to_string().green(),
        HealthStatus::Unhealthy => health.to_string().red(),
    }
}

fn colorize_connection(connection: ConnectionState) -> ColoredString {
    match connection {
        ConnectionState::Connected => connection.to_string().green(),
        ConnectionState::Disconnected => connection.to_string().red(),
    }
}
