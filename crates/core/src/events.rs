use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event in a run's event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        work_item_id: String,
        workflow_spec: WorkflowSpec,
    },
    RunCompleted {
        duration_secs: u64,
    },
    RunFailed {
        error: String,
        duration_secs: u64,
    },
    RunCancelled {
        reason: String,
    },

    // Step lifecycle events
    StepScheduled {
        step_id: StepId,
        step_spec: StepSpec,
    },
    StepStarted {
        step_id: StepId,
        attempt: u32,
    },
    StepOutputCaptured {
        step_id: StepId,
        attempt: u32,
        exit_code: Option<i32>,
        stdout_hash: BlobHash,
        stderr_hash: BlobHash,
    },
    StepCompleted {
        step_id: StepId,
        duration_secs: u64,
    },
    StepFailed {
        step_id: StepId,
        error: String,
        attempt: u32,
        will_retry: bool,
    },
    StepSkipped {
        step_id: StepId,
        reason: String,
    },
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Persist anything still buffered
    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Get all events for a run
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;
}
