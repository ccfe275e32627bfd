use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod config;

use config::{AppState, RunnerConfig};

#[derive(Parser, Debug)]
#[command(name = "tcgflow")]
#[command(about = "Daily TCGCSV scrape workflow runner", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "TCGFLOW_CONFIG", default_value = "tcgflow.toml")]
    config: PathBuf,

    /// Data directory for run history and captured output
    #[arg(short, long, env = "TCGFLOW_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the workflow once, now
    Run,
    /// Fire the workflow on its schedule until interrupted
    Schedule,
    /// Print the task graph
    Graph {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List recorded runs
    Runs {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Print the event log of a run
    Events {
        run_id: String,
    },
    /// Replay the output a step captured in a run
    Output {
        run_id: String,
        step_id: String,
    },
    /// List scheduled executions of the routine
    Executions {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Logs go to stderr; stdout carries the captured output blocks
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tcgflow_core=info,tcgflow_runner=info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Data directory: {}", args.data_dir.display());

    let config = RunnerConfig::load(&args.config, args.data_dir)?;

    // Graph is the only command that does not open the stores
    match args.command {
        Command::Graph { json } => commands::graph(&config, json),
        Command::Run => commands::run_once(&config, &AppState::new(&config)?).await,
        Command::Schedule => commands::schedule(&config, &AppState::new(&config)?).await,
        Command::Runs { limit } => commands::runs(&AppState::new(&config)?, limit),
        Command::Events { run_id } => commands::events(&AppState::new(&config)?, &run_id).await,
        Command::Output { run_id, step_id } => {
            commands::output(&AppState::new(&config)?, &run_id, &step_id).await
        }
        Command::Executions { limit } => commands::executions(&AppState::new(&config)?, limit),
    }
}
