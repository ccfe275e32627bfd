use super::dag::{Readiness, WorkflowDag};
use super::step_executor::StepExecutor;
use crate::events::{Event, EventLog, EventType};
use crate::storage::{BlobStore, IndexStore};
use crate::types::{Run, RunId, RunStatus, StepExecution, StepId, StepStatus, WorkflowSpec};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;

/// Outcome of walking the DAG for one run
struct DagOutcome {
    steps: Vec<StepExecution>,
    cancelled: bool,
}

/// Workflow executor that coordinates DAG execution.
///
/// Steps run in waves: every step whose trigger rule is satisfied starts
/// together with the other ready steps, and the next wave is computed once
/// they have all finished.
pub struct WorkflowExecutor {
    event_log: Arc<dyn EventLog>,
    index_store: Arc<dyn IndexStore>,
    step_executor: Arc<StepExecutor>,
    // Track active runs for cancellation
    active_runs: Arc<RwLock<HashMap<RunId, watch::Sender<bool>>>>,
}

impl WorkflowExecutor {
    pub fn new(
        event_log: Arc<dyn EventLog>,
        blob_store: Arc<dyn BlobStore>,
        index_store: Arc<dyn IndexStore>,
    ) -> Self {
        Self::with_step_executor(
            event_log.clone(),
            index_store,
            StepExecutor::new(event_log, blob_store),
        )
    }

    pub fn with_step_executor(
        event_log: Arc<dyn EventLog>,
        index_store: Arc<dyn IndexStore>,
        step_executor: StepExecutor,
    ) -> Self {
        Self {
            event_log,
            index_store,
            step_executor: Arc::new(step_executor),
            active_runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Execute a workflow and return the finished run.
    ///
    /// Step failures show up in the returned run's status; `Err` means the
    /// workflow could not be run at all (invalid graph, storage failure).
    pub async fn execute(&self, work_item_id: String, workflow: WorkflowSpec) -> Result<Run> {
        let dag = WorkflowDag::from_workflow(&workflow).context("Failed to build DAG")?;

        let run_id = RunId::new();
        let started_at = Utc::now();

        tracing::info!("Starting workflow execution: run_id={}", run_id);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.active_runs.write().await.insert(run_id, cancel_tx);

        let result = self
            .run_to_completion(run_id, work_item_id, started_at, &dag, &workflow, cancel_rx)
            .await;

        self.active_runs.write().await.remove(&run_id);
        // Unwritten events stay buffered for the next flush
        if let Err(e) = self.event_log.flush().await {
            tracing::warn!("Failed to flush event log for run {}: {:#}", run_id, e);
        }

        result
    }

    async fn run_to_completion(
        &self,
        run_id: RunId,
        work_item_id: String,
        started_at: chrono::DateTime<Utc>,
        dag: &WorkflowDag,
        workflow: &WorkflowSpec,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<Run> {
        let mut run = Run {
            id: run_id,
            work_item_id: work_item_id.clone(),
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            steps: workflow
                .steps
                .iter()
                .map(|s| StepExecution::pending(s.id.clone()))
                .collect(),
        };

        self.event_log
            .append(Event::new(
                run_id,
                EventType::RunStarted {
                    work_item_id,
                    workflow_spec: workflow.clone(),
                },
            ))
            .await?;

        self.index_store.index_run(&run)?;

        let outcome = match self.execute_dag(run_id, dag, workflow, cancel_rx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.abandon_run(&mut run, &e);
                return Err(e);
            }
        };

        let completed_at = Utc::now();
        let duration_secs = (completed_at - started_at).num_seconds().max(0) as u64;
        run.completed_at = Some(completed_at);
        run.steps = outcome.steps;

        let failures: Vec<String> = run
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| {
                format!(
                    "Step {} failed: {}",
                    s.id,
                    s.error.as_deref().unwrap_or("Unknown error")
                )
            })
            .collect();

        // The run is indexed with its final status before the closing event
        // so a failing log cannot leave it marked as running
        let closing = if outcome.cancelled {
            run.status = RunStatus::Cancelled;
            tracing::warn!("Workflow execution cancelled: run_id={}", run_id);

            EventType::RunCancelled {
                reason: "Cancellation requested".to_string(),
            }
        } else if failures.is_empty() {
            run.status = RunStatus::Completed;
            tracing::info!("Workflow execution completed: run_id={}", run_id);

            EventType::RunCompleted { duration_secs }
        } else {
            run.status = RunStatus::Failed;
            let error = failures.join("; ");
            tracing::error!("Workflow execution failed: run_id={}, error={}", run_id, error);

            EventType::RunFailed {
                error,
                duration_secs,
            }
        };

        self.index_store.index_run(&run)?;
        self.event_log.append(Event::new(run_id, closing)).await?;

        Ok(run)
    }

    /// Execute the DAG wave by wave
    async fn execute_dag(
        &self,
        run_id: RunId,
        dag: &WorkflowDag,
        workflow: &WorkflowSpec,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<DagOutcome> {
        let mut executions: HashMap<StepId, StepExecution> = HashMap::new();
        let mut statuses: HashMap<StepId, StepStatus> = HashMap::new();

        for step in &workflow.steps {
            self.event_log
                .append(Event::new(
                    run_id,
                    EventType::StepScheduled {
                        step_id: step.id.clone(),
                        step_spec: step.clone(),
                    },
                ))
                .await?;

            executions.insert(step.id.clone(), StepExecution::pending(step.id.clone()));
            statuses.insert(step.id.clone(), StepStatus::Pending);
        }

        let topo_order = dag.topological_order();
        let mut cancelled = false;

        loop {
            if *cancel_rx.borrow() {
                cancelled = true;
                break;
            }

            // Topological order lets a skip cascade down a chain in one pass
            let mut ready = Vec::new();
            for step in &topo_order {
                if statuses.get(&step.id) != Some(&StepStatus::Pending) {
                    continue;
                }

                match dag.readiness(&step.id, &statuses)? {
                    Readiness::Ready => ready.push(step.clone()),
                    Readiness::Blocked => {
                        self.skip_step(run_id, &step.id, "upstream failed", &mut executions)
                            .await?;
                        statuses.insert(step.id.clone(), StepStatus::Skipped);
                    }
                    Readiness::Waiting => {}
                }
            }

            if ready.is_empty() {
                break;
            }

            let mut wave = JoinSet::new();
            let mut in_flight: HashSet<StepId> = HashSet::new();
            for step in ready {
                in_flight.insert(step.id.clone());
                tracing::info!("Executing step: {}", step.id);

                statuses.insert(step.id.clone(), StepStatus::Running);
                if let Some(exec) = executions.get_mut(&step.id) {
                    exec.status = StepStatus::Running;
                    exec.started_at = Some(Utc::now());
                }

                let step_executor = self.step_executor.clone();
                wave.spawn(async move {
                    let result = step_executor.execute(run_id, &step, 1).await;
                    (step.id, result)
                });
            }

            // Every task in the wave is joined, even when one of them errors,
            // so no sibling script is killed halfway
            while let Some(joined) = wave.join_next().await {
                let (step_id, result) = match joined {
                    Ok(joined) => joined,
                    Err(e) => {
                        tracing::error!("Step task failed to complete: {}", e);
                        continue;
                    }
                };
                in_flight.remove(&step_id);

                let (status, attempt, error) = match result {
                    Ok(result) => (result.status, result.attempt, result.error),
                    Err(e) => {
                        tracing::error!("Step {} could not be recorded: {:#}", step_id, e);
                        (StepStatus::Failed, 1, Some(format!("{:#}", e)))
                    }
                };
                finish_step(&mut executions, &mut statuses, &step_id, status, attempt, error);
            }

            for step_id in in_flight {
                let error = Some("Step task panicked".to_string());
                finish_step(&mut executions, &mut statuses, &step_id, StepStatus::Failed, 1, error);
            }
        }

        if cancelled {
            let pending: Vec<StepId> = topo_order
                .iter()
                .filter(|s| statuses.get(&s.id) == Some(&StepStatus::Pending))
                .map(|s| s.id.clone())
                .collect();
            for step_id in pending {
                self.skip_step(run_id, &step_id, "run cancelled", &mut executions)
                    .await?;
            }
        }

        // Keep definition order
        let steps = workflow
            .steps
            .iter()
            .filter_map(|s| executions.remove(&s.id))
            .collect();

        Ok(DagOutcome { steps, cancelled })
    }

    async fn skip_step(
        &self,
        run_id: RunId,
        step_id: &StepId,
        reason: &str,
        executions: &mut HashMap<StepId, StepExecution>,
    ) -> Result<()> {
        tracing::info!("Skipping step {}: {}", step_id, reason);

        self.event_log
            .append(Event::new(
                run_id,
                EventType::StepSkipped {
                    step_id: step_id.clone(),
                    reason: reason.to_string(),
                },
            ))
            .await?;

        if let Some(exec) = executions.get_mut(step_id) {
            exec.status = StepStatus::Skipped;
        }

        Ok(())
    }

    /// Index the run as failed when the DAG walk itself broke off
    fn abandon_run(&self, run: &mut Run, error: &anyhow::Error) {
        run.status = RunStatus::Failed;
        run.completed_at = Some(Utc::now());

        if let Err(e) = self.index_store.index_run(run) {
            tracing::warn!("Failed to index abandoned run {}: {:#}", run.id, e);
        }
        tracing::error!("Workflow execution aborted: run_id={}, error={:#}", run.id, error);
    }

    /// Get the last indexed state of a run
    pub async fn get_run(&self, run_id: RunId) -> Result<Option<Run>> {
        self.index_store.get_run(&run_id)
    }

    /// Cancel a running workflow; takes effect before the next wave starts
    pub async fn cancel(&self, run_id: RunId) -> Result<()> {
        let active_runs = self.active_runs.read().await;

        if let Some(cancel_tx) = active_runs.get(&run_id) {
            cancel_tx.send(true).ok();
            tracing::info!("Cancellation signal sent for run {}", run_id);
            Ok(())
        } else {
            Err(anyhow::anyhow!("Run {} is not active", run_id))
        }
    }

    /// Runs currently in progress
    pub async fn active_runs(&self) -> Vec<RunId> {
        self.active_runs.read().await.keys().copied().collect()
    }
}

fn finish_step(
    executions: &mut HashMap<StepId, StepExecution>,
    statuses: &mut HashMap<StepId, StepStatus>,
    step_id: &StepId,
    status: StepStatus,
    attempt: u32,
    error: Option<String>,
) {
    statuses.insert(step_id.clone(), status);
    if let Some(exec) = executions.get_mut(step_id) {
        exec.status = status;
        exec.completed_at = Some(Utc::now());
        exec.attempt = attempt;
        exec.error = error;
    }
}
