use crate::config::{AppState, RunnerConfig};
use anyhow::{Context, Result};
use serde::Serialize;
use std::process::ExitCode;
use std::str::FromStr;
use tcgflow_core::events::EventLog;
use tcgflow_core::pipelines::tcgcsv::{failure_message, WORKFLOW_ID};
use tcgflow_core::workflow::{captured_output, DependencyEdge, OutputReporter, WorkflowDag};
use tcgflow_core::{Run, RunId, RunStatus, StepAction, StepId, WorkflowSpec};

/// Execute the workflow once, now
pub async fn run_once(config: &RunnerConfig, state: &AppState) -> Result<ExitCode> {
    let run = state
        .workflow_executor
        .execute(WORKFLOW_ID.to_string(), config.workflow().spec())
        .await?;

    eprintln!("{}", summarize(&run));

    Ok(if run.status == RunStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Register the daily routine and keep firing it until Ctrl-C
pub async fn schedule(config: &RunnerConfig, state: &AppState) -> Result<ExitCode> {
    let routine = config.routine(chrono::Utc::now());
    tracing::info!(
        "Scheduling {} with '{}' (catchup: {})",
        routine.name,
        routine.schedule.cron,
        routine.schedule.catchup
    );

    state.routine_scheduler.register_routine(routine).await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down scheduler");
    state.routine_scheduler.shutdown().await;

    Ok(ExitCode::SUCCESS)
}

#[derive(Debug, Serialize)]
struct GraphNode {
    id: String,
    command: String,
    failure_message: String,
}

#[derive(Debug, Serialize)]
struct GraphView {
    nodes: Vec<GraphNode>,
    edges: Vec<DependencyEdge>,
}

fn graph_view(workflow: &WorkflowSpec) -> Result<GraphView> {
    let dag = WorkflowDag::from_workflow(workflow)?;

    let nodes = dag
        .topological_order()
        .into_iter()
        .map(|step| {
            let command = match &step.action {
                StepAction::Command { program, args } => {
                    std::iter::once(program.as_str())
                        .chain(args.iter().map(String::as_str))
                        .collect::<Vec<_>>()
                        .join(" ")
                }
            };
            GraphNode {
                id: step.id.0,
                command,
                failure_message: step.failure_message,
            }
        })
        .collect();

    Ok(GraphView {
        nodes,
        edges: dag.edges(),
    })
}

/// Print the task graph
pub fn graph(config: &RunnerConfig, json: bool) -> Result<ExitCode> {
    let view = graph_view(&config.workflow().spec())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        println!("nodes:");
        for node in &view.nodes {
            println!("  {}: {}", node.id, node.command);
        }
        println!("edges:");
        for edge in &view.edges {
            let predecessors: Vec<&str> =
                edge.predecessors.iter().map(|p| p.0.as_str()).collect();
            println!("  [{}] -> {}", predecessors.join(", "), edge.successor);
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// List recorded runs, newest first
pub fn runs(state: &AppState, limit: usize) -> Result<ExitCode> {
    for run in state.index_store.list_runs()?.into_iter().take(limit) {
        println!("{}", summarize(&run));
    }
    Ok(ExitCode::SUCCESS)
}

/// Dump a run's event log as JSON lines
pub async fn events(state: &AppState, run_id: &str) -> Result<ExitCode> {
    let run_id = RunId::from_str(run_id).context("Invalid run id")?;

    for event in state.event_log.get_run_events(run_id).await? {
        println!("{}", serde_json::to_string(&event)?);
    }

    Ok(ExitCode::SUCCESS)
}

/// Print a step's captured output blocks again, attempt by attempt
pub async fn output(state: &AppState, run_id: &str, step_id: &str) -> Result<ExitCode> {
    let run_id = RunId::from_str(run_id).context("Invalid run id")?;
    let step_id = StepId::new(step_id);

    let attempts = captured_output(
        &*state.event_log,
        &*state.blob_store,
        run_id,
        &step_id,
    )
    .await?;

    if attempts.is_empty() {
        anyhow::bail!("No output captured for step {} in run {}", step_id, run_id);
    }

    let label = failure_message(&step_id.0);
    let mut reporter = OutputReporter::new(std::io::stdout().lock());
    let mut failed = false;

    for (attempt, captured) in attempts {
        eprintln!("attempt {} (exit code {:?})", attempt, captured.exit_code);
        reporter.report_stdout(&captured.stdout);
        if let Err(failure) = reporter.report_stderr(&captured.stderr, &label) {
            eprintln!("{}", failure);
            failed = true;
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// List routine executions, newest first
pub fn executions(state: &AppState, limit: usize) -> Result<ExitCode> {
    for execution in state
        .index_store
        .list_routine_executions()?
        .into_iter()
        .take(limit)
    {
        let run_id = execution
            .run_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{} {} {:?} run={} {}",
            execution.scheduled_at.to_rfc3339(),
            execution.routine_id,
            execution.status,
            run_id,
            execution.error.unwrap_or_default()
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn summarize(run: &Run) -> String {
    let steps: Vec<String> = run
        .steps
        .iter()
        .map(|s| format!("{}={:?}", s.id, s.status).to_lowercase())
        .collect();

    format!(
        "{} {} {:?} started={} [{}]",
        run.id,
        run.work_item_id,
        run.status,
        run.started_at.to_rfc3339(),
        steps.join(" ")
    )
}
