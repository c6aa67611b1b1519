/// Maestro CLI - Command-line interface for the tool execution orchestrator
use clap::{Parser, Subcommand};
use maestro_core::{ConfigLoader, OrchestratorConfig};
use std::path::{Path, PathBuf};

mod commands;
mod demo;

use commands::{actions, run, validate};

/// Load configuration from the given path or default location
fn load_config(config_path: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    let loader = match config_path {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    Ok(loader.load()?)
}

#[derive(Parser)]
#[command(name = "maestro")]
#[command(about = "Tool execution orchestrator for agent plans", long_about = None)]
#[command(version = "0.1.0")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (defaults to .maestro/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override log level
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a plan and check its dependency graph without running it
    Validate {
        /// Plan file (tagged text or structured JSON)
        plan: PathBuf,
    },

    /// Execute a plan against the built-in demo actions
    Run {
        /// Plan file (tagged text or structured JSON)
        plan: PathBuf,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,

        /// Override the plan's concurrency limit
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Keep independent branches running after a failure
        #[arg(long)]
        continue_on_error: bool,
    },

    /// List the actions available to plans
    Actions {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref())?;

    // Flag beats config file beats environment default
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match args.command {
        Commands::Validate { plan } => {
            validate::execute(&plan)?;
        }

        Commands::Run {
            plan,
            format,
            max_concurrency,
            continue_on_error,
        } => {
            run::execute(&config, &plan, &format, max_concurrency, continue_on_error).await?;
        }

        Commands::Actions { format } => {
            actions::execute(&format)?;
        }
    }

    Ok(())
}
