use crate::storage::IndexStore;
use crate::types::{Routine, RoutineExecution, RoutineId, RoutineSchedule, RunStatus};
use crate::workflow::executor::WorkflowExecutor;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Parse a cron expression.
///
/// Accepts shorthands (`@daily`, `@hourly`, ...), the 6/7-field form with
/// seconds, and the classic 5-field form (seconds default to 0).
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();
    let normalized = if !expr.starts_with('@') && expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };

    Schedule::from_str(&normalized)
        .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expr, e))
}

/// Start dates are inclusive, `Schedule::after` is not
fn before_start(start_date: DateTime<Utc>) -> DateTime<Utc> {
    start_date - Duration::seconds(1)
}

/// Next fire time strictly after `now`, never before `start_date`
pub fn next_fire(
    schedule: &Schedule,
    start_date: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let floor = now.max(before_start(start_date));
    schedule.after(&floor).next()
}

/// Fire times that are due at `now`.
///
/// `last_run` is the scheduled time of the last executed fire. Without
/// catchup only the most recent missed fire is returned, so a scheduler that
/// was down for a week runs once, not seven times.
pub fn due_fires(
    schedule: &Schedule,
    start_date: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    catchup: bool,
) -> Vec<DateTime<Utc>> {
    let floor = match last_run {
        Some(last) => last.max(before_start(start_date)),
        None => before_start(start_date),
    };

    let due: Vec<DateTime<Utc>> = schedule
        .after(&floor)
        .take_while(|fire| *fire <= now)
        .collect();

    if catchup {
        due
    } else {
        due.into_iter().last().into_iter().collect()
    }
}

/// Cron scheduler for recurring routines
pub struct RoutineScheduler {
    routines: Arc<RwLock<HashMap<RoutineId, Routine>>>,
    executions: Arc<RwLock<Vec<RoutineExecution>>>,
    executor: Arc<WorkflowExecutor>,
    index_store: Arc<dyn IndexStore>,
    running_tasks: Arc<Mutex<HashMap<RoutineId, JoinHandle<()>>>>,
}

impl RoutineScheduler {
    pub fn new(executor: Arc<WorkflowExecutor>, index_store: Arc<dyn IndexStore>) -> Self {
        Self {
            routines: Arc::new(RwLock::new(HashMap::new())),
            executions: Arc::new(RwLock::new(Vec::new())),
            executor,
            index_store,
            running_tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a routine, resuming the bookkeeping of an earlier process
    /// that registered the same id
    pub async fn register_routine(&self, mut routine: Routine) -> Result<()> {
        parse_schedule(&routine.schedule.cron)
            .with_context(|| format!("Routine {} has an invalid schedule", routine.id))?;

        if let Some(previous) = self.index_store.get_routine(&routine.id)? {
            if routine.last_run.is_none() {
                routine.last_run = previous.last_run;
            }
        }

        self.index_store.store_routine(&routine)?;
        self.routines
            .write()
            .await
            .insert(routine.id.clone(), routine.clone());

        if routine.enabled {
            self.start_routine_task(routine).await;
        }

        Ok(())
    }

    /// Unregister a routine
    pub async fn unregister_routine(&self, routine_id: &RoutineId) -> Result<()> {
        if let Some(handle) = self.running_tasks.lock().await.remove(routine_id) {
            handle.abort();
        }

        self.routines.write().await.remove(routine_id);

        Ok(())
    }

    /// Get all routines
    pub async fn list_routines(&self) -> Vec<Routine> {
        self.routines.read().await.values().cloned().collect()
    }

    /// Routines carrying `tag`
    pub async fn list_routines_by_tag(&self, tag: &str) -> Vec<Routine> {
        self.routines
            .read()
            .await
            .values()
            .filter(|r| r.tags.iter().any(|t| t == tag))
            .cloned()
            .collect()
    }

    /// Get a specific routine
    pub async fn get_routine(&self, routine_id: &RoutineId) -> Option<Routine> {
        self.routines.read().await.get(routine_id).cloned()
    }

    /// Enable a routine
    pub async fn enable_routine(&self, routine_id: &RoutineId) -> Result<()> {
        let routine = {
            let mut routines = self.routines.write().await;
            let routine = routines
                .get_mut(routine_id)
                .ok_or_else(|| anyhow::anyhow!("Routine not found"))?;
            routine.enabled = true;
            routine.updated_at = Utc::now();
            routine.clone()
        };

        self.index_store.store_routine(&routine)?;
        self.start_routine_task(routine).await;
        Ok(())
    }

    /// Disable a routine
    pub async fn disable_routine(&self, routine_id: &RoutineId) -> Result<()> {
        if let Some(handle) = self.running_tasks.lock().await.remove(routine_id) {
            handle.abort();
        }

        let routine = {
            let mut routines = self.routines.write().await;
            let routine = routines
                .get_mut(routine_id)
                .ok_or_else(|| anyhow::anyhow!("Routine not found"))?;
            routine.enabled = false;
            routine.updated_at = Utc::now();
            routine.clone()
        };

        self.index_store.store_routine(&routine)
    }

    /// Stop every routine task
    pub async fn shutdown(&self) {
        for (routine_id, handle) in self.running_tasks.lock().await.drain() {
            tracing::info!("Stopping routine {}", routine_id);
            handle.abort();
        }
    }

    /// Start a scheduler task for a routine
    async fn start_routine_task(&self, routine: Routine) {
        let routine_id = routine.id.clone();
        let executor = self.executor.clone();
        let executions = self.executions.clone();
        let routines = self.routines.clone();
        let index_store = self.index_store.clone();

        let handle = tokio::spawn(async move {
            let routine_id = routine.id.clone();
            let schedule = match parse_schedule(&routine.schedule.cron) {
                Ok(schedule) => schedule,
                Err(e) => {
                    tracing::error!("Failed to parse schedule for routine {}: {}", routine_id, e);
                    return;
                }
            };
            let RoutineSchedule {
                catchup,
                start_date,
                ..
            } = routine.schedule;

            loop {
                let last_run = routines
                    .read()
                    .await
                    .get(&routine_id)
                    .and_then(|r| r.last_run);

                for scheduled_at in due_fires(&schedule, start_date, last_run, Utc::now(), catchup) {
                    tracing::info!("Executing routine {} for {}", routine.name, scheduled_at);
                    let execution = run_routine(&executor, &routine, scheduled_at).await;

                    if let Err(e) = index_store.store_routine_execution(&execution) {
                        tracing::warn!("Failed to record execution of {}: {}", routine_id, e);
                    }
                    update_routine(&routines, index_store.as_ref(), &routine_id, |r| {
                        r.last_run = Some(scheduled_at);
                    })
                    .await;

                    executions.write().await.push(execution);
                }

                let Some(next_run) = next_fire(&schedule, start_date, Utc::now()) else {
                    tracing::info!("Routine {} has no upcoming fire times", routine.name);
                    break;
                };

                update_routine(&routines, index_store.as_ref(), &routine_id, |r| {
                    r.next_run = Some(next_run);
                })
                .await;

                tracing::info!("Routine {} next fires at {}", routine.name, next_run);

                let wait = (next_run - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::from_secs(1));
                tokio::time::sleep(wait).await;

                let enabled = routines
                    .read()
                    .await
                    .get(&routine_id)
                    .map(|r| r.enabled)
                    .unwrap_or(false);

                if !enabled {
                    tracing::info!("Routine {} has been disabled, stopping scheduler", routine.name);
                    break;
                }
            }
        });

        if let Some(previous) = self.running_tasks.lock().await.insert(routine_id, handle) {
            previous.abort();
        }
    }

    /// Get execution history for a routine
    pub async fn get_executions(&self, routine_id: &RoutineId) -> Vec<RoutineExecution> {
        self.executions
            .read()
            .await
            .iter()
            .filter(|e| e.routine_id == *routine_id)
            .cloned()
            .collect()
    }
}

async fn run_routine(
    executor: &WorkflowExecutor,
    routine: &Routine,
    scheduled_at: DateTime<Utc>,
) -> RoutineExecution {
    let executed_at = Utc::now();

    match executor
        .execute(routine.id.0.clone(), routine.workflow.clone())
        .await
    {
        Ok(run) => {
            let error = (run.status == RunStatus::Failed).then(|| {
                run.steps
                    .iter()
                    .filter_map(|s| s.error.clone())
                    .collect::<Vec<_>>()
                    .join("; ")
            });

            RoutineExecution {
                id: uuid::Uuid::new_v4().to_string(),
                routine_id: routine.id.clone(),
                run_id: Some(run.id),
                scheduled_at,
                executed_at,
                status: run.status,
                error,
            }
        }
        Err(e) => {
            tracing::error!("Failed to execute routine {}: {:#}", routine.name, e);
            RoutineExecution {
                id: uuid::Uuid::new_v4().to_string(),
                routine_id: routine.id.clone(),
                run_id: None,
                scheduled_at,
                executed_at,
                status: RunStatus::Failed,
                error: Some(format!("{:#}", e)),
            }
        }
    }
}

async fn update_routine(
    routines: &RwLock<HashMap<RoutineId, Routine>>,
    index_store: &dyn IndexStore,
    routine_id: &RoutineId,
    update: impl FnOnce(&mut Routine),
) {
    let snapshot = {
        let mut routines = routines.write().await;
        let Some(routine) = routines.get_mut(routine_id) else {
            return;
        };
        update(routine);
        routine.clone()
    };

    if let Err(e) = index_store.store_routine(&snapshot) {
        tracing::warn!("Failed to persist routine {}: {}", routine_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::blob::FilesystemBlobStore;
    use crate::storage::event_log::JsonlEventLog;
    use crate::storage::index::RedbIndexStore;
    use crate::types::{StepAction, StepId, StepSpec, TriggerRule, WorkflowSpec};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_schedule_forms() {
        for expr in ["@daily", "0 0 * * *", "0 0 0 * * *", "  @hourly "] {
            assert!(parse_schedule(expr).is_ok(), "{} should parse", expr);
        }
        assert!(parse_schedule("every day").is_err());

        let daily = parse_schedule("@daily").unwrap();
        let classic = parse_schedule("0 0 * * *").unwrap();
        assert_eq!(
            daily.after(&at(3, 12)).next(),
            classic.after(&at(3, 12)).next()
        );
    }

    #[test]
    fn test_without_catchup_only_latest_fire_is_due() {
        let schedule = parse_schedule("@daily").unwrap();

        let due = due_fires(&schedule, at(1, 0), None, at(5, 12), false);

        assert_eq!(due, vec![at(5, 0)]);
    }

    #[test]
    fn test_catchup_backfills_from_start_date() {
        let schedule = parse_schedule("@daily").unwrap();

        let due = due_fires(&schedule, at(1, 0), None, at(5, 12), true);

        assert_eq!(due, vec![at(1, 0), at(2, 0), at(3, 0), at(4, 0), at(5, 0)]);
    }

    #[test]
    fn test_catchup_resumes_after_last_run() {
        let schedule = parse_schedule("@daily").unwrap();

        let due = due_fires(&schedule, at(1, 0), Some(at(3, 0)), at(5, 12), true);

        assert_eq!(due, vec![at(4, 0), at(5, 0)]);
    }

    #[test]
    fn test_nothing_due_before_start_or_twice() {
        let schedule = parse_schedule("@daily").unwrap();

        assert!(due_fires(&schedule, at(10, 0), None, at(5, 12), false).is_empty());
        assert!(due_fires(&schedule, at(1, 0), Some(at(5, 0)), at(5, 12), false).is_empty());
    }

    #[test]
    fn test_next_fire() {
        let schedule = parse_schedule("@daily").unwrap();

        // Start date itself is a fire time
        assert_eq!(next_fire(&schedule, at(10, 0), at(5, 12)), Some(at(10, 0)));
        assert_eq!(next_fire(&schedule, at(1, 0), at(5, 12)), Some(at(6, 0)));
        assert_eq!(next_fire(&schedule, at(1, 0), at(6, 0)), Some(at(7, 0)));
    }

    struct Fixture {
        _temp_dir: TempDir,
        scripts: std::path::PathBuf,
        index_store: Arc<RedbIndexStore>,
        scheduler: RoutineScheduler,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let scripts = temp_dir.path().join("scripts");
        std::fs::create_dir_all(&scripts).unwrap();

        let index_store =
            Arc::new(RedbIndexStore::new(temp_dir.path().join("index.redb")).unwrap());
        let event_log = Arc::new(JsonlEventLog::new(temp_dir.path().join("events")).unwrap());
        let blob_store = Arc::new(FilesystemBlobStore::new(temp_dir.path().join("blobs")).unwrap());
        let step_executor = crate::workflow::StepExecutor::new(event_log.clone(), blob_store)
            .with_echo_output(false);
        let executor = Arc::new(WorkflowExecutor::with_step_executor(
            event_log,
            index_store.clone(),
            step_executor,
        ));
        let scheduler = RoutineScheduler::new(executor, index_store.clone());

        Fixture {
            _temp_dir: temp_dir,
            scripts,
            index_store,
            scheduler,
        }
    }

    fn routine(id: &str, start_date: DateTime<Utc>, enabled: bool, steps: Vec<StepSpec>) -> Routine {
        Routine {
            id: RoutineId::new(id),
            name: id.to_string(),
            description: "A test routine".to_string(),
            schedule: RoutineSchedule {
                cron: "@daily".to_string(),
                catchup: false,
                start_date,
            },
            tags: vec!["tcgcsv".to_string()],
            workflow: WorkflowSpec {
                steps,
                dependencies: HashMap::new(),
            },
            enabled,
            last_run: None,
            next_run: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_register_routine() {
        let f = fixture();
        let routine = routine("test_routine", Utc::now() + Duration::days(365), false, vec![]);

        f.scheduler.register_routine(routine.clone()).await.unwrap();

        let retrieved = f.scheduler.get_routine(&routine.id).await.unwrap();
        assert_eq!(retrieved.id, routine.id);
        assert_eq!(retrieved.name, routine.name);

        assert_eq!(f.scheduler.list_routines_by_tag("tcgcsv").await.len(), 1);
        assert!(f.scheduler.list_routines_by_tag("prices").await.is_empty());

        f.scheduler.unregister_routine(&routine.id).await.unwrap();
        assert!(f.scheduler.list_routines().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_schedule_rejected() {
        let f = fixture();
        let mut routine = routine("broken", Utc::now(), false, vec![]);
        routine.schedule.cron = "whenever".to_string();

        assert!(f.scheduler.register_routine(routine).await.is_err());
    }

    #[tokio::test]
    async fn test_enable_disable_routine() {
        let f = fixture();
        // Far-future start keeps the task asleep
        let routine = routine("test_routine", Utc::now() + Duration::days(365), false, vec![]);

        f.scheduler.register_routine(routine.clone()).await.unwrap();

        f.scheduler.enable_routine(&routine.id).await.unwrap();
        let retrieved = f.scheduler.get_routine(&routine.id).await.unwrap();
        assert!(retrieved.enabled);

        assert!(f.index_store.get_routine(&routine.id).unwrap().unwrap().enabled);

        f.scheduler.disable_routine(&routine.id).await.unwrap();
        let retrieved = f.scheduler.get_routine(&routine.id).await.unwrap();
        assert!(!retrieved.enabled);
        assert!(!f.index_store.get_routine(&routine.id).unwrap().unwrap().enabled);

        assert!(f
            .scheduler
            .enable_routine(&RoutineId::new("missing"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unstartable_workflow_records_no_run() {
        let f = fixture();
        let mut routine = routine("dangling", Utc::now(), false, vec![]);
        routine.workflow.dependencies.insert(StepId::new("ghost"), vec![StepId::new("a")]);

        let execution = run_routine(&f.scheduler.executor, &routine, at(1, 0)).await;

        assert_eq!(execution.status, RunStatus::Failed);
        assert!(execution.run_id.is_none());
        assert!(execution.error.unwrap().contains("Failed to build DAG"));
        assert!(f.index_store.list_runs().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missed_fire_runs_once_on_registration() {
        let f = fixture();
        let script = f.scripts.join("hello.sh");
        std::fs::write(&script, "echo hello\n").unwrap();

        let step = StepSpec {
            id: StepId::new("hello"),
            name: "hello".to_string(),
            description: None,
            action: StepAction::Command {
                program: "/bin/sh".to_string(),
                args: vec![script.to_string_lossy().into_owned()],
            },
            failure_message: "Error in hello()".to_string(),
            timeout_secs: Some(30),
            retry_policy: None,
            trigger_rule: TriggerRule::AllSuccess,
        };
        let routine = routine("daily_hello", Utc::now() - Duration::days(10), true, vec![step]);

        f.scheduler.register_routine(routine.clone()).await.unwrap();

        let mut executions = Vec::new();
        for _ in 0..200 {
            executions = f.scheduler.get_executions(&routine.id).await;
            if !executions.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        f.scheduler.shutdown().await;

        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, RunStatus::Completed);
        assert!(executions[0].error.is_none());
        let run_id = executions[0].run_id.unwrap();
        assert_eq!(
            f.index_store.get_run(&run_id).unwrap().unwrap().status,
            RunStatus::Completed
        );

        let persisted = f.index_store.list_routine_executions().unwrap();
        assert_eq!(persisted.len(), 1);

        // A restarted scheduler picks up where this one left off
        let stored = f.index_store.get_routine(&routine.id).unwrap().unwrap();
        assert_eq!(stored.last_run, Some(executions[0].scheduled_at));
    }
}
