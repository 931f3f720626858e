//! Execution command handlers
//!
//! Handles submitting an execution and following it, viewing a single
//! execution, and listing executions.

use anyhow::{Context, Result, bail};
use clap::Args;
use colored::*;
use conduit_core::domain::execution::{Execution, ExecutionState};
use conduit_core::domain::provider::PipelineType;
use conduit_core::domain::stage::{Stage, StageState};
use conduit_core::domain::template::PipelineConfig;
use conduit_core::dto::execution::{ExecutePipeline, ExecutionFilter, Pagination, PipelineSource};
use conduit_orchestrator::Orchestrator;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Arguments of `conduit run`
#[derive(Args)]
pub struct RunArgs {
    /// Repository to build
    #[arg(long)]
    repository: String,

    #[arg(long, default_value = "main")]
    branch: String,

    #[arg(long, default_value = "development")]
    environment: String,

    /// Published template to resolve
    #[arg(long, conflicts_with = "pipeline_type")]
    template: Option<String>,

    /// Pipeline type for an inline configuration without a template
    #[arg(long)]
    pipeline_type: Option<String>,

    /// Template parameter as key=value; the value is parsed as JSON when possible
    #[arg(short, long = "param")]
    params: Vec<String>,

    /// 0 is most urgent, 100 least
    #[arg(long)]
    priority: Option<i32>,

    /// Provider to use when it is capable
    #[arg(long)]
    provider: Option<String>,

    /// Give up following after this many seconds
    #[arg(long, default_value_t = 3600)]
    timeout: u64,
}

/// Submit an execution and follow it until it reaches a terminal state
pub async fn run(orchestrator: &Orchestrator, args: RunArgs) -> Result<()> {
    let pipeline = match (args.template, args.pipeline_type) {
        (Some(template), _) => PipelineSource::Template(template),
        (None, Some(pipeline_type)) => {
            PipelineSource::Config(PipelineConfig::new(PipelineType::from(pipeline_type)))
        }
        (None, None) => bail!("either --template or --pipeline-type is required"),
    };

    let request = ExecutePipeline {
        repository: args.repository,
        branch: args.branch,
        environment: args.environment,
        pipeline,
        parameters: parse_params(&args.params)?,
        priority: args.priority,
        provider_preference: args.provider,
    };

    orchestrator.start();

    let response = orchestrator.execute_pipeline(request).await?;
    println!(
        "{} {}",
        "✓ Execution submitted:".green(),
        response.execution_id.to_string().bold()
    );
    for warning in &response.warnings {
        println!("  {} {}", "⚠".yellow(), warning.yellow());
    }

    let outcome = tokio::time::timeout(
        Duration::from_secs(args.timeout),
        follow(orchestrator, response.execution_id),
    )
    .await;

    orchestrator.shutdown().await;

    match outcome {
        Ok(execution) => {
            let execution = execution?;
            println!();
            print_execution_details(&execution);
            if execution.state != ExecutionState::Completed {
                bail!("execution ended {}", execution.state);
            }
            Ok(())
        }
        Err(_) => bail!("execution did not finish within {}s", args.timeout),
    }
}

async fn follow(orchestrator: &Orchestrator, id: Uuid) -> Result<Execution> {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut last_state = None;
    let mut last_stages: Vec<Stage> = Vec::new();

    loop {
        interval.tick().await;
        let execution = orchestrator.get_execution_status(id).await?;

        if last_state != Some(execution.state) {
            println!("  {} {}", "▸".cyan(), colorize_state(execution.state));
            last_state = Some(execution.state);
        }
        for stage in &execution.stages {
            if !last_stages.contains(stage) {
                println!("    {} {}", stage.name, colorize_stage(stage.state));
            }
        }
        last_stages = execution.stages.clone();

        if execution.is_terminal() {
            return Ok(execution);
        }
    }
}

/// Parses `key=value` pairs; values that are not valid JSON are kept as strings
fn parse_params(params: &[String]) -> Result<HashMap<String, Value>> {
    params
        .iter()
        .map(|param| {
            let (key, value) = param
                .split_once('=')
                .with_context(|| format!("parameter '{}' must be key=value", param))?;
            let value = serde_json::from_str(value)
                .unwrap_or_else(|_| Value::String(value.to_string()));
            Ok((key.trim().to_string(), value))
        })
        .collect()
}

/// Get and display a single execution
pub async fn status(orchestrator: &Orchestrator, id: &str) -> Result<()> {
    let id = Uuid::parse_str(id).with_context(|| format!("'{}' is not an execution ID", id))?;
    let execution = orchestrator.get_execution_status(id).await?;

    print_execution_details(&execution);

    Ok(())
}

/// List executions matching the filters
pub async fn list(
    orchestrator: &Orchestrator,
    states: Vec<String>,
    provider: Option<String>,
    template: Option<String>,
    offset: usize,
    limit: usize,
) -> Result<()> {
    let states = states
        .iter()
        .map(|s| ExecutionState::parse(s).with_context(|| format!("unknown state '{}'", s)))
        .collect::<Result<Vec<_>>>()?;

    let filter = ExecutionFilter {
        states,
        provider,
        template_id: template,
        ..ExecutionFilter::default()
    };

    let page = orchestrator
        .list_executions(&filter, Pagination { offset, limit })
        .await?;

    if page.items.is_empty() {
        println!("{}", "No executions found.".yellow());
    } else {
        println!(
            "{}",
            format!(
                "Showing {} of {} execution(s):",
                page.items.len(),
                page.total
            )
            .bold()
        );
        println!();
        for execution in &page.items {
            print_execution_summary(execution);
        }
    }

    Ok(())
}

/// Print an execution summary
fn print_execution_summary(execution: &Execution) {
    println!(
        "  {} {} {}",
        "▸".cyan(),
        execution.id.to_string().bold(),
        colorize_state(execution.state)
    );
    println!(
        "    {}@{} -> {}  ({})",
        execution.repository,
        execution.branch,
        execution.environment,
        execution.pipeline_type()
    );
    println!(
        "    Provider: {}  Created: {}",
        execution.provider.as_deref().unwrap_or("-"),
        execution
            .created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

/// Print execution details
fn print_execution_details(execution: &Execution) {
    println!("{}", format!("Execution {}", execution.id).bold());
    println!("  State:        {}", colorize_state(execution.state));
    println!("  Repository:   {}", execution.repository);
    println!("  Branch:       {}", execution.branch);
    println!("  Environment:  {}", execution.environment);
    println!("  Pipeline:     {}", execution.pipeline_type());
    if let Some(template) = &execution.template_id {
        println!("  Template:     {}", template);
    }
    println!("  Priority:     {}", execution.priority);
    println!(
        "  Provider:     {}",
        execution.provider.as_deref().unwrap_or("-")
    );
    if execution.dispatch_attempts > 0 {
        println!("  Attempts:     {}", execution.dispatch_attempts);
    }
    println!(
        "  Created:      {}",
        execution.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(started) = execution.started_at {
        println!("  Started:      {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(completed) = execution.completed_at {
        println!("  Completed:    {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ms) = execution.duration_ms() {
        println!("  Duration:     {:.1}s", ms as f64 / 1000.0);
    }
    if let Some(failure) = &execution.failure {
        let origin = if failure.category.is_infrastructure() {
            "could not run"
        } else {
            "pipeline failed"
        };
        println!(
            "  Failure:      {} ({}) {}",
            failure.category.as_str().red(),
            origin,
            failure.reason
        );
    }

    if !execution.stages.is_empty() {
        println!("  Stages:");
        for stage in &execution.stages {
            let duration = stage
                .duration_ms
                .map(|ms| format!(" ({:.1}s)", ms as f64 / 1000.0))
                .unwrap_or_default();
            println!(
                "    {} {}{}",
                stage.name,
                colorize_stage(stage.state),
                duration.dimmed()
            );
        }
    }
}

fn colorize_state(state: ExecutionState) -> ColoredString {
    match state {
        ExecutionState::Queued => state.as_str().yellow(),
        ExecutionState::Assigned | ExecutionState::Running => state.as_str().cyan(),
        ExecutionState::Completed => state.as_str().green(),
        ExecutionState::Failed => state.as_str().red(),
        ExecutionState::Cancelled => state.as_str().dimmed(),
    }
}

fn colorize_stage(state: StageState) -> ColoredString {
    match state {
        StageState::Completed => state.as_str().green(),
        StageState::Failed => state.as_str().red(),
        StageState::Running => state.as_str().cyan(),
        StageState::Pending => state.as_str().dimmed(),
    }
}
