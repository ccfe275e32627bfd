use crate::types::{Routine, RoutineExecution, RoutineId, Run, RunId};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const RUNS_TABLE: JsonTable = TableDefinition::new("runs");
const ROUTINES_TABLE: JsonTable = TableDefinition::new("routines");
const ROUTINE_EXECUTIONS_TABLE: JsonTable = TableDefinition::new("routine_executions");

/// Index store for fast queries using redb
#[derive(Clone)]
pub struct RedbIndexStore {
    db: Arc<Database>,
}

impl RedbIndexStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        for (name, table) in [
            ("runs", RUNS_TABLE),
            ("routines", ROUTINES_TABLE),
            ("routine executions", ROUTINE_EXECUTIONS_TABLE),
        ] {
            write_txn
                .open_table(table)
                .with_context(|| format!("Failed to open {} table", name))?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(table)
                .context("Failed to open table")?;

            let value = serde_json::to_vec(value).context("Failed to serialize record")?;

            table
                .insert(key, value.as_slice())
                .context("Failed to insert record")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> Result<Option<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;

        match table.get(key).context("Failed to get record")? {
            Some(guard) => {
                let record = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, table: JsonTable) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;

        let mut records = Vec::new();
        for item in table.iter().context("Failed to iterate table")? {
            let (_key, value) = item.context("Failed to read item")?;
            records.push(
                serde_json::from_slice(value.value()).context("Failed to deserialize record")?,
            );
        }
        Ok(records)
    }

    /// Index a run for fast queries
    pub fn index_run(&self, run: &Run) -> Result<()> {
        self.put_json(RUNS_TABLE, &run.id.to_string(), run)
    }

    /// Get a run by ID
    pub fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        self.get_json(RUNS_TABLE, &run_id.to_string())
    }

    /// List all runs, most recent first
    pub fn list_runs(&self) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self.list_json(RUNS_TABLE)?;
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    /// Store a routine (including its last/next run bookkeeping)
    pub fn store_routine(&self, routine: &Routine) -> Result<()> {
        self.put_json(ROUTINES_TABLE, &routine.id.0, routine)
    }

    pub fn get_routine(&self, routine_id: &RoutineId) -> Result<Option<Routine>> {
        self.get_json(ROUTINES_TABLE, &routine_id.0)
    }

    /// Store a routine execution record
    pub fn store_routine_execution(&self, execution: &RoutineExecution) -> Result<()> {
        self.put_json(ROUTINE_EXECUTIONS_TABLE, &execution.id, execution)
    }

    /// List routine executions, most recent first
    pub fn list_routine_executions(&self) -> Result<Vec<RoutineExecution>> {
        let mut executions: Vec<RoutineExecution> = self.list_json(ROUTINE_EXECUTIONS_TABLE)?;
        executions.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        Ok(executions)
    }
}

/// Trait for index storage
pub trait IndexStore: Send + Sync {
    /// Index a run
    fn index_run(&self, run: &Run) -> Result<()>;

    /// Get a run by ID
    fn get_run(&self, run_id: &RunId) -> Result<Option<Run>>;

    /// List all runs
    fn list_runs(&self) -> Result<Vec<Run>>;

    /// Persist routine bookkeeping
    fn store_routine(&self, routine: &Routine) -> Result<()>;

    /// Load a previously persisted routine
    fn get_routine(&self, routine_id: &RoutineId) -> Result<Option<Routine>>;

    /// Record a routine execution
    fn store_routine_execution(&self, execution: &RoutineExecution) -> Result<()>;
}

impl IndexStore for RedbIndexStore {
    fn index_run(&self, run: &Run) -> Result<()> {
        RedbIndexStore::index_run(self, run)
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        RedbIndexStore::get_run(self, run_id)
    }

    fn list_runs(&self) -> Result<Vec<Run>> {
        RedbIndexStore::list_runs(self)
    }

    fn store_routine(&self, routine: &Routine) -> Result<()> {
        RedbIndexStore::store_routine(self, routine)
    }

    fn get_routine(&self, routine_id: &RoutineId) -> Result<Option<Routine>> {
        RedbIndexStore::get_routine(self, routine_id)
    }

    fn store_routine_execution(&self, execution: &RoutineExecution) -> Result<()> {
        RedbIndexStore::store_routine_execution(self, execution)
    }
}
