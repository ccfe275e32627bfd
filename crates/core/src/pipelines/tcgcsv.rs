//! Daily TCGCSV product scrape.
//!
//! Three loader scripts write TCGCSV data into the portfolio database. The
//! group and Secret Lair product loaders are independent; the general
//! product loader waits for both of them:
//!
//! ```text
//! scrape_sl_tcproducts ──┐
//!                        ├──> scrape_nonsl_tcproducts
//! scrape_tcgroups ───────┘
//! ```

use crate::types::{
    RetryPolicy, Routine, RoutineId, RoutineSchedule, StepAction, StepId, StepSpec, TriggerRule,
    WorkflowSpec,
};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const WORKFLOW_ID: &str = "scrape_tcgcsv_products";
pub const TAG: &str = "tcgcsv";
pub const SCHEDULE: &str = "@daily";
pub const DEFAULT_SCRIPT_DIR: &str = "/home/vmuser/tcg-portfolio/backend/scripts";

pub const SCRAPE_TCGROUPS: &str = "scrape_tcgroups";
pub const SCRAPE_SL_TCPRODUCTS: &str = "scrape_sl_tcproducts";
pub const SCRAPE_NONSL_TCPRODUCTS: &str = "scrape_nonsl_tcproducts";

/// First day the routine may fire
pub fn start_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Label of the failure raised when a step writes to stderr
pub fn failure_message(step: &str) -> String {
    format!("Error in {}()", step)
}

/// Where the loader scripts live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptPaths {
    pub dir: PathBuf,
    pub groups: String,
    pub sl_products: String,
    pub nonsl_products: String,
    /// Run each script through this program instead of executing it directly
    pub interpreter: Option<String>,
}

impl Default for ScriptPaths {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_SCRIPT_DIR),
            groups: "loadTCGroups.sh".to_string(),
            sl_products: "loadSLTCProducts.sh".to_string(),
            nonsl_products: "loadTCProducts.sh".to_string(),
            interpreter: None,
        }
    }
}

impl ScriptPaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn groups_path(&self) -> PathBuf {
        self.dir.join(&self.groups)
    }

    pub fn sl_products_path(&self) -> PathBuf {
        self.dir.join(&self.sl_products)
    }

    pub fn nonsl_products_path(&self) -> PathBuf {
        self.dir.join(&self.nonsl_products)
    }

    fn action(&self, script: PathBuf) -> StepAction {
        let script = script.to_string_lossy().into_owned();
        match &self.interpreter {
            Some(interpreter) => StepAction::Command {
                program: interpreter.clone(),
                args: vec![script],
            },
            None => StepAction::Command {
                program: script,
                args: vec![],
            },
        }
    }
}

/// Declaration of the TCGCSV scrape workflow
#[derive(Debug, Clone, Default)]
pub struct TcgcsvWorkflow {
    pub scripts: ScriptPaths,
    pub timeout_secs: Option<u64>,
    pub retry_policy: Option<RetryPolicy>,
    /// Rule the product loader uses to wait on the other two
    pub fan_in_rule: TriggerRule,
}

impl TcgcsvWorkflow {
    pub fn new(scripts: ScriptPaths) -> Self {
        Self {
            scripts,
            ..Self::default()
        }
    }

    fn step(&self, id: &str, description: &str, script: PathBuf) -> StepSpec {
        StepSpec {
            id: StepId::new(id),
            name: id.to_string(),
            description: Some(description.to_string()),
            action: self.scripts.action(script),
            failure_message: failure_message(id),
            timeout_secs: self.timeout_secs,
            retry_policy: self.retry_policy.clone(),
            trigger_rule: TriggerRule::AllSuccess,
        }
    }

    /// The three loader steps and the single fan-in dependency
    pub fn spec(&self) -> WorkflowSpec {
        let groups = self.step(
            SCRAPE_TCGROUPS,
            "Load TCGroup data from TCGCSV into the db",
            self.scripts.groups_path(),
        );
        let mut nonsl = self.step(
            SCRAPE_NONSL_TCPRODUCTS,
            "Load non Secret Lair TCProduct data from TCGCSV into the db",
            self.scripts.nonsl_products_path(),
        );
        nonsl.trigger_rule = self.fan_in_rule;
        let sl = self.step(
            SCRAPE_SL_TCPRODUCTS,
            "Load Secret Lair TCProduct data from TCGCSV into the db",
            self.scripts.sl_products_path(),
        );

        let mut dependencies = HashMap::new();
        dependencies.insert(
            StepId::new(SCRAPE_NONSL_TCPRODUCTS),
            vec![StepId::new(SCRAPE_SL_TCPRODUCTS), StepId::new(SCRAPE_TCGROUPS)],
        );

        WorkflowSpec {
            steps: vec![groups, nonsl, sl],
            dependencies,
        }
    }

    /// Daily routine, no backfill, tagged for discovery
    pub fn routine(&self, now: DateTime<Utc>) -> Routine {
        Routine {
            id: RoutineId::new(WORKFLOW_ID),
            name: WORKFLOW_ID.to_string(),
            description: "Scrape TCGCSV groups and products into the db".to_string(),
            schedule: RoutineSchedule {
                cron: SCHEDULE.to_string(),
                catchup: false,
                start_date: start_date(),
            },
            tags: vec![TAG.to_string()],
            workflow: self.spec(),
            enabled: true,
            last_run: None,
            next_run: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The TCGCSV workflow with default step options
pub fn scrape_tcgcsv_products(scripts: &ScriptPaths) -> WorkflowSpec {
    TcgcsvWorkflow::new(scripts.clone()).spec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{DependencyEdge, WorkflowDag};

    #[test]
    fn test_graph_has_one_fan_in_edge() {
        let workflow = scrape_tcgcsv_products(&ScriptPaths::default());
        let dag = WorkflowDag::from_workflow(&workflow).unwrap();

        assert_eq!(dag.steps().len(), 3);
        assert_eq!(
            dag.edges(),
            vec![DependencyEdge {
                predecessors: vec![
                    StepId::new(SCRAPE_SL_TCPRODUCTS),
                    StepId::new(SCRAPE_TCGROUPS),
                ],
                successor: StepId::new(SCRAPE_NONSL_TCPRODUCTS),
            }]
        );

        let order: Vec<String> = dag
            .topological_order()
            .into_iter()
            .map(|s| s.id.0)
            .collect();
        assert_eq!(order.last().map(String::as_str), Some(SCRAPE_NONSL_TCPRODUCTS));
    }

    #[test]
    fn test_default_script_paths() {
        let workflow = scrape_tcgcsv_products(&ScriptPaths::default());

        let program = |id: &str| match &workflow.step(&StepId::new(id)).unwrap().action {
            StepAction::Command { program, args } => {
                assert!(args.is_empty());
                program.clone()
            }
        };

        assert_eq!(
            program(SCRAPE_TCGROUPS),
            "/home/vmuser/tcg-portfolio/backend/scripts/loadTCGroups.sh"
        );
        assert_eq!(
            program(SCRAPE_SL_TCPRODUCTS),
            "/home/vmuser/tcg-portfolio/backend/scripts/loadSLTCProducts.sh"
        );
        assert_eq!(
            program(SCRAPE_NONSL_TCPRODUCTS),
            "/home/vmuser/tcg-portfolio/backend/scripts/loadTCProducts.sh"
        );
    }

    #[test]
    fn test_failure_messages_name_the_step() {
        let workflow = scrape_tcgcsv_products(&ScriptPaths::default());

        let message = |id: &str| workflow.step(&StepId::new(id)).unwrap().failure_message.clone();
        assert_eq!(message(SCRAPE_TCGROUPS), "Error in scrape_tcgroups()");
        assert_eq!(message(SCRAPE_SL_TCPRODUCTS), "Error in scrape_sl_tcproducts()");
        assert_eq!(
            message(SCRAPE_NONSL_TCPRODUCTS),
            "Error in scrape_nonsl_tcproducts()"
        );
    }

    #[test]
    fn test_interpreter_wraps_script() {
        let scripts = ScriptPaths {
            interpreter: Some("/bin/bash".to_string()),
            ..ScriptPaths::in_dir("/opt/scripts")
        };
        let workflow = scrape_tcgcsv_products(&scripts);

        match &workflow.step(&StepId::new(SCRAPE_TCGROUPS)).unwrap().action {
            StepAction::Command { program, args } => {
                assert_eq!(program, "/bin/bash");
                assert_eq!(args, &vec!["/opt/scripts/loadTCGroups.sh".to_string()]);
            }
        }
    }

    #[test]
    fn test_fan_in_rule_applies_to_product_loader_only() {
        let workflow = TcgcsvWorkflow {
            fan_in_rule: TriggerRule::AllDone,
            timeout_secs: Some(600),
            ..TcgcsvWorkflow::default()
        }
        .spec();

        for step in &workflow.steps {
            let expected = if step.id.0 == SCRAPE_NONSL_TCPRODUCTS {
                TriggerRule::AllDone
            } else {
                TriggerRule::AllSuccess
            };
            assert_eq!(step.trigger_rule, expected);
            assert_eq!(step.timeout_secs, Some(600));
        }
    }

    #[test]
    fn test_routine_schedule() {
        let now = Utc::now();
        let routine = TcgcsvWorkflow::default().routine(now);

        assert_eq!(routine.id, RoutineId::new("scrape_tcgcsv_products"));
        assert_eq!(routine.schedule.cron, "@daily");
        assert!(!routine.schedule.catchup);
        assert_eq!(routine.schedule.start_date.to_rfc3339(), "2024-02-01T00:00:00+00:00");
        assert_eq!(routine.tags, vec!["tcgcsv".to_string()]);
        assert_eq!(routine.workflow.steps.len(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_secret_lair_failure_blocks_product_loader() {
        use crate::storage::{FilesystemBlobStore, JsonlEventLog, RedbIndexStore};
        use crate::types::{RunStatus, StepStatus};
        use crate::workflow::{StepExecutor, WorkflowExecutor};
        use std::sync::Arc;
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let script_dir = temp_dir.path().join("scripts");
        std::fs::create_dir_all(&script_dir).unwrap();
        std::fs::write(
            script_dir.join("loadTCGroups.sh"),
            "echo 'Scraping Groups for TCG [MTG, 1]...'\n",
        )
        .unwrap();
        std::fs::write(
            script_dir.join("loadSLTCProducts.sh"),
            "echo 'Scraping Products for [Secret Lair]...'\necho 'permission denied' >&2\n",
        )
        .unwrap();
        std::fs::write(script_dir.join("loadTCProducts.sh"), "echo loaded\n").unwrap();

        let scripts = ScriptPaths {
            interpreter: Some("/bin/sh".to_string()),
            ..ScriptPaths::in_dir(&script_dir)
        };

        let event_log = Arc::new(JsonlEventLog::new(temp_dir.path().join("events")).unwrap());
        let blob_store = Arc::new(FilesystemBlobStore::new(temp_dir.path().join("blobs")).unwrap());
        let index_store =
            Arc::new(RedbIndexStore::new(temp_dir.path().join("index.redb")).unwrap());
        let executor = WorkflowExecutor::with_step_executor(
            event_log.clone(),
            index_store,
            StepExecutor::new(event_log, blob_store).with_echo_output(false),
        );

        let run = executor
            .execute(WORKFLOW_ID.to_string(), scrape_tcgcsv_products(&scripts))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);

        let groups = run.step(&StepId::new(SCRAPE_TCGROUPS)).unwrap();
        assert_eq!(groups.status, StepStatus::Completed);

        let sl = run.step(&StepId::new(SCRAPE_SL_TCPRODUCTS)).unwrap();
        assert_eq!(sl.status, StepStatus::Failed);
        assert_eq!(sl.error.as_deref(), Some("Error in scrape_sl_tcproducts()"));

        let nonsl = run.step(&StepId::new(SCRAPE_NONSL_TCPRODUCTS)).unwrap();
        assert_eq!(nonsl.status, StepStatus::Skipped);
    }
}
