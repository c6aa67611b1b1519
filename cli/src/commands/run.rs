use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::{info, warn};

use maestro_core::{
    parse_plan, CallStatus, ExecutionEngine, OrchestratorConfig, PlanReport,
};

use crate::demo::demo_registry;

pub async fn execute(
    config: &OrchestratorConfig,
    plan_path: &Path,
    format: &str,
    max_concurrency: Option<usize>,
    continue_on_error: bool,
) -> Result<()> {
    let text = std::fs::read_to_string(plan_path)
        .with_context(|| format!("reading plan file {}", plan_path.display()))?;

    let mut plan = parse_plan(&text)?;
    if let Some(n) = max_concurrency {
        plan.options.max_concurrency = Some(n.max(1));
    }
    if continue_on_error {
        plan.options.continue_on_error = true;
    }
    info!(plan = %plan_path.display(), mode = %plan.mode, calls = plan.calls.len(), "running plan");

    let registry = demo_registry();
    let engine = ExecutionEngine::with_defaults(registry, config.engine_defaults());
    let report = engine.execute(plan).await?;
    if report.failed() > 0 {
        warn!(run_id = %report.run_id, failed = report.failed(), "plan finished with failures");
    } else {
        info!(run_id = %report.run_id, duration_ms = report.duration_ms, "plan finished");
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_table(&report),
    }

    if report.failed() > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn print_table(report: &PlanReport) {
    println!("\n{} {}", "Run".green().bold(), report.run_id);
    println!("{}", "─".repeat(90).dimmed());
    println!(
        "{:<20} {:<10} {:>8} {:>10}  {}",
        "TOOL".bold(),
        "STATUS".bold(),
        "ATTEMPTS".bold(),
        "TIME".bold(),
        "RESULT".bold()
    );
    println!("{}", "─".repeat(90).dimmed());

    for result in &report.results {
        let status = match result.status {
            CallStatus::Succeeded => "succeeded".green(),
            CallStatus::Failed => "failed".red(),
            CallStatus::Skipped => "skipped".yellow(),
        };
        let detail = match result.status {
            CallStatus::Failed => result
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
            _ => result
                .value
                .as_ref()
                .map(|v| truncate(&v.to_string(), 40))
                .unwrap_or_default(),
        };
        println!(
            "{:<20} {:<10} {:>8} {:>8}ms  {}",
            result.tool_id, status, result.attempts, result.duration_ms, detail
        );
    }

    println!("{}", "─".repeat(90).dimmed());
    println!(
        "{} succeeded, {} failed, {} skipped in {}ms",
        report.succeeded().to_string().green(),
        report.failed().to_string().red(),
        report.skipped().to_string().yellow(),
        report.duration_ms
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}…")
    }
}
