//! Statistics command

use anyhow::Result;
use colored::*;
use conduit_core::dto::statistics::{GroupStats, Overview, TimeRange};
use conduit_orchestrator::Orchestrator;

pub async fn show(orchestrator: &Orchestrator, hours: i64) -> Result<()> {
    let range = TimeRange::last(chrono::Duration::hours(hours.max(1)));
    let stats = orchestrator.get_statistics(range).await?;

    println!(
        "{}",
        format!(
            "Executions from {} to {}:",
            stats.range.from.format("%Y-%m-%d %H:%M"),
            stats.range.to.format("%Y-%m-%d %H:%M")
        )
        .bold()
    );
    print_overview(&stats.overview, "  ");

    print_groups("By provider", &stats.by_provider, "(unassigned)");
    print_groups("By template", &stats.by_template, "(inline config)");

    Ok(())
}

fn print_groups(title: &str, groups: &[GroupStats], unnamed: &str) {
    if groups.is_empty() {
        return;
    }

    println!();
    println!("{}", format!("{}:", title).bold());
    for group in groups {
        println!(
            "  {} {}",
            "▸".cyan(),
            group.key.as_deref().unwrap_or(unnamed)
        );
        print_overview(&group.overview, "    ");
    }
}

fn print_overview(overview: &Overview, indent: &str) {
    println!(
        "{}Total: {}  queued {}  assigned {}  running {}  {} {}  {} {}  cancelled {}",
        indent,
        overview.total,
        overview.queued,
        overview.assigned,
        overview.running,
        "completed".green(),
        overview.completed,
        "failed".red(),
        overview.failed,
        overview.cancelled
    );

    let rate = overview
        .success_rate
        .map(|r| format!("{:.1}%", r * 100.0))
        .unwrap_or_else(|| "-".to_string());
    let average = overview
        .average_duration_ms
        .map(|ms| format!("{:.1}s", ms / 1000.0))
        .unwrap_or_else(|| "-".to_string());
    println!("{}Success rate: {}  Average duration: {}", indent, rate, average);
}
