use super::output::{OutputReporter, StepFailure};
use crate::events::{Event, EventLog, EventType};
use crate::storage::BlobStore;
use crate::types::{RunId, StepAction, StepId, StepSpec, StepStatus};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Result of executing a step
#[derive(Debug, Clone)]
pub struct StepResult {
    pub status: StepStatus,
    pub error: Option<String>,
    /// Attempt that produced this result
    pub attempt: u32,
    pub output: Option<CapturedOutput>,
}

/// Streams captured from one command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Step executor with retry and timeout logic
pub struct StepExecutor {
    event_log: Arc<dyn EventLog>,
    blob_store: Arc<dyn BlobStore>,
    echo_output: bool,
}

impl StepExecutor {
    pub fn new(event_log: Arc<dyn EventLog>, blob_store: Arc<dyn BlobStore>) -> Self {
        Self {
            event_log,
            blob_store,
            echo_output: true,
        }
    }

    /// Print each step's output blocks to stdout (on by default)
    pub fn with_echo_output(mut self, echo_output: bool) -> Self {
        self.echo_output = echo_output;
        self
    }

    /// Execute a step with retry and timeout logic.
    ///
    /// A failing step is reported through [`StepResult::status`]; `Err` is
    /// reserved for the event log failing.
    pub async fn execute(
        &self,
        run_id: RunId,
        step: &StepSpec,
        first_attempt: u32,
    ) -> Result<StepResult> {
        let mut attempt = first_attempt.max(1);

        loop {
            let result = self.execute_attempt(run_id, step, attempt).await?;

            if result.status != StepStatus::Failed || !self.should_retry(step, attempt) {
                return Ok(result);
            }

            // Exponential backoff
            let backoff = step
                .retry_policy
                .as_ref()
                .map(|p| p.backoff_secs)
                .unwrap_or(1);
            let backoff_duration =
                Duration::from_secs(backoff.saturating_mul(2_u64.saturating_pow(attempt - 1)));

            tracing::info!(
                "Retrying step {} after {:?} (attempt {})",
                step.id,
                backoff_duration,
                attempt + 1
            );

            tokio::time::sleep(backoff_duration).await;
            attempt += 1;
        }
    }

    async fn execute_attempt(
        &self,
        run_id: RunId,
        step: &StepSpec,
        attempt: u32,
    ) -> Result<StepResult> {
        tracing::info!(
            "Executing step {} (attempt {}) for run {}",
            step.id,
            attempt,
            run_id
        );

        self.event_log
            .append(Event::new(
                run_id,
                EventType::StepStarted {
                    step_id: step.id.clone(),
                    attempt,
                },
            ))
            .await?;

        let start = std::time::Instant::now();

        let invocation = if let Some(timeout_secs) = step.timeout_secs {
            match timeout(Duration::from_secs(timeout_secs), self.execute_action(step)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!("Step {} timed out", step.id);
                    Err(anyhow!("Step timed out after {} seconds", timeout_secs))
                }
            }
        } else {
            self.execute_action(step).await
        };

        let duration = start.elapsed();

        let (outcome, output) = match invocation {
            Ok(captured) => {
                // Print and classify first; losing the stored copy does not
                // change the step's outcome
                let classified = self.report(step, &captured).map_err(|e| e.to_string());
                if let Err(e) = self.record_output(run_id, step, attempt, &captured).await {
                    tracing::warn!("Failed to record output of step {}: {:#}", step.id, e);
                }
                (classified, Some(captured))
            }
            Err(e) => (Err(format!("{:#}", e)), None),
        };

        match outcome {
            Ok(()) => {
                self.event_log
                    .append(Event::new(
                        run_id,
                        EventType::StepCompleted {
                            step_id: step.id.clone(),
                            duration_secs: duration.as_secs(),
                        },
                    ))
                    .await?;

                Ok(StepResult {
                    status: StepStatus::Completed,
                    error: None,
                    attempt,
                    output,
                })
            }
            Err(error_msg) => {
                tracing::warn!("Step {} failed: {}", step.id, error_msg);

                self.event_log
                    .append(Event::new(
                        run_id,
                        EventType::StepFailed {
                            step_id: step.id.clone(),
                            error: error_msg.clone(),
                            attempt,
                            will_retry: self.should_retry(step, attempt),
                        },
                    ))
                    .await?;

                Ok(StepResult {
                    status: StepStatus::Failed,
                    error: Some(error_msg),
                    attempt,
                    output,
                })
            }
        }
    }

    /// Run the step's command to completion and capture both streams
    async fn execute_action(&self, step: &StepSpec) -> Result<CapturedOutput> {
        match &step.action {
            StepAction::Command { program, args } => run_command(program, args).await,
        }
    }

    /// Keep the captured streams so operators can inspect them after the run
    async fn record_output(
        &self,
        run_id: RunId,
        step: &StepSpec,
        attempt: u32,
        captured: &CapturedOutput,
    ) -> Result<()> {
        let stdout_hash = self
            .blob_store
            .put(Bytes::from(captured.stdout.clone()))
            .await
            .context("Failed to store captured stdout")?;
        let stderr_hash = self
            .blob_store
            .put(Bytes::from(captured.stderr.clone()))
            .await
            .context("Failed to store captured stderr")?;

        self.event_log
            .append(Event::new(
                run_id,
                EventType::StepOutputCaptured {
                    step_id: step.id.clone(),
                    attempt,
                    exit_code: captured.exit_code,
                    stdout_hash,
                    stderr_hash,
                },
            ))
            .await
    }

    /// Print both blocks, then classify on stderr.
    ///
    /// The blocks are rendered into one buffer first so steps running side by
    /// side do not interleave their output.
    fn report(&self, step: &StepSpec, captured: &CapturedOutput) -> Result<(), StepFailure> {
        let mut reporter = OutputReporter::new(Vec::new());
        reporter.report_stdout(&captured.stdout);
        let classified = reporter.report_stderr(&captured.stderr, &step.failure_message);

        if self.echo_output {
            let rendered = reporter.into_inner();
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = stdout.write_all(&rendered).and_then(|_| stdout.flush()) {
                tracing::warn!("Failed to print output of step {}: {}", step.id, e);
            }
        }

        classified
    }

    /// Check if we should retry a failed step
    fn should_retry(&self, step: &StepSpec, attempt: u32) -> bool {
        if let Some(retry_policy) = &step.retry_policy {
            attempt < retry_policy.max_attempts
        } else {
            false
        }
    }
}

/// Load the output a step captured in a run, one entry per attempt
pub async fn captured_output(
    event_log: &dyn EventLog,
    blob_store: &dyn BlobStore,
    run_id: RunId,
    step_id: &StepId,
) -> Result<Vec<(u32, CapturedOutput)>> {
    let mut attempts = Vec::new();

    for event in event_log.get_run_events(run_id).await? {
        let EventType::StepOutputCaptured {
            step_id: captured_step,
            attempt,
            exit_code,
            stdout_hash,
            stderr_hash,
        } = event.event_type
        else {
            continue;
        };
        if captured_step != *step_id {
            continue;
        }

        let mut streams = Vec::with_capacity(2);
        for hash in [&stdout_hash, &stderr_hash] {
            let data = blob_store.get(hash).await?.ok_or_else(|| {
                anyhow!("Output of step {} attempt {} is missing", step_id, attempt)
            })?;
            streams.push(String::from_utf8_lossy(&data).into_owned());
        }
        let stderr = streams.pop().unwrap_or_default();
        let stdout = streams.pop().unwrap_or_default();

        attempts.push((
            attempt,
            CapturedOutput {
                stdout,
                stderr,
                exit_code,
            },
        ));
    }

    Ok(attempts)
}

async fn run_command(program: &str, args: &[String]) -> Result<CapturedOutput> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // A timed-out step drops this future; take the child down with it
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn {}", program))?;

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("failed to wait for {}", program))?;

    Ok(CapturedOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::storage::{FilesystemBlobStore, JsonlEventLog};
    use crate::types::{RetryPolicy, StepId, TriggerRule};
    use tempfile::TempDir;

    struct Harness {
        _temp_dir: TempDir,
        scripts: std::path::PathBuf,
        event_log: Arc<JsonlEventLog>,
        blob_store: Arc<FilesystemBlobStore>,
        executor: StepExecutor,
    }

    fn harness() -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let scripts = temp_dir.path().join("scripts");
        std::fs::create_dir_all(&scripts).unwrap();

        let event_log = Arc::new(JsonlEventLog::new(temp_dir.path().join("events")).unwrap());
        let blob_store = Arc::new(FilesystemBlobStore::new(temp_dir.path().join("blobs")).unwrap());
        let executor =
            StepExecutor::new(event_log.clone(), blob_store.clone()).with_echo_output(false);

        Harness {
            _temp_dir: temp_dir,
            scripts,
            event_log,
            blob_store,
            executor,
        }
    }

    impl Harness {
        /// A step running `body` through /bin/sh
        fn script_step(&self, id: &str, body: &str) -> StepSpec {
            let path = self.scripts.join(format!("{}.sh", id));
            std::fs::write(&path, body).unwrap();

            StepSpec {
                id: StepId::new(id),
                name: id.to_string(),
                description: None,
                action: StepAction::Command {
                    program: "/bin/sh".to_string(),
                    args: vec![path.to_string_lossy().into_owned()],
                },
                failure_message: format!("Error in {}()", id),
                timeout_secs: None,
                retry_policy: None,
                trigger_rule: TriggerRule::AllSuccess,
            }
        }
    }

    #[tokio::test]
    async fn test_clean_run_completes() {
        let h = harness();
        let step = h.script_step("scrape_tcgroups", "echo '3 TCGroup documents were loaded'\n");

        let result = h.executor.execute(RunId::new(), &step, 1).await.unwrap();

        assert_eq!(result.status, StepStatus::Completed);
        assert!(result.error.is_none());
        let output = result.output.unwrap();
        assert_eq!(output.stdout, "3 TCGroup documents were loaded\n");
        assert_eq!(output.stderr, "");
        assert_eq!(output.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_stderr_fails_with_step_label() {
        let h = harness();
        let step = h.script_step("scrape_sl_tcproducts", "echo 'permission denied' >&2\n");

        let result = h.executor.execute(RunId::new(), &step, 1).await.unwrap();

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("Error in scrape_sl_tcproducts()"));
    }

    #[tokio::test]
    async fn test_exit_code_alone_does_not_fail() {
        let h = harness();
        let step = h.script_step("quiet_exit", "exit 3\n");

        let result = h.executor.execute(RunId::new(), &step, 1).await.unwrap();

        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.output.unwrap().exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let h = harness();
        let mut step = h.script_step("scrape_tcgroups", "");
        step.action = StepAction::Command {
            program: "/nonexistent/loadTCGroups.sh".to_string(),
            args: vec![],
        };

        let result = h.executor.execute(RunId::new(), &step, 1).await.unwrap();

        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error.unwrap().contains("failed to spawn"));
        assert!(result.output.is_none());
    }

    #[tokio::test]
    async fn test_timeout_fails() {
        let h = harness();
        let mut step = h.script_step("slow", "sleep 5\n");
        step.timeout_secs = Some(1);

        let result = h.executor.execute(RunId::new(), &step, 1).await.unwrap();

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("Step timed out after 1 seconds"));
    }

    #[tokio::test]
    async fn test_retry_until_clean() {
        let h = harness();
        let marker = h.scripts.join("attempted");
        let body = format!(
            "if [ -f '{m}' ]; then echo ok; else touch '{m}'; echo 'flaky' >&2; fi\n",
            m = marker.display()
        );
        let mut step = h.script_step("flaky", &body);
        step.retry_policy = Some(RetryPolicy {
            max_attempts: 3,
            backoff_secs: 0,
        });

        let run_id = RunId::new();
        let result = h.executor.execute(run_id, &step, 1).await.unwrap();

        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.attempt, 2);

        let events = h.event_log.get_run_events(run_id).await.unwrap();
        let retries: Vec<bool> = events
            .iter()
            .filter_map(|e| match &e.event_type {
                EventType::StepFailed { will_retry, .. } => Some(*will_retry),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![true]);
    }

    #[tokio::test]
    async fn test_captured_output_is_stored_per_attempt() {
        let h = harness();
        let marker = h.scripts.join("attempted");
        let body = format!(
            "echo out\nif [ -f '{m}' ]; then echo second; else touch '{m}'; echo err >&2; fi\n",
            m = marker.display()
        );
        let mut step = h.script_step("both", &body);
        step.retry_policy = Some(RetryPolicy {
            max_attempts: 2,
            backoff_secs: 0,
        });

        let run_id = RunId::new();
        h.executor.execute(run_id, &step, 1).await.unwrap();

        let attempts = captured_output(&*h.event_log, &*h.blob_store, run_id, &step.id)
            .await
            .unwrap();

        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].0, 1);
        assert_eq!(attempts[0].1.stdout, "out\n");
        assert_eq!(attempts[0].1.stderr, "err\n");
        assert_eq!(attempts[1].0, 2);
        assert_eq!(attempts[1].1.stdout, "out\nsecond\n");
        assert_eq!(attempts[1].1.stderr, "");

        let other = captured_output(
            &*h.event_log,
            &*h.blob_store,
            run_id,
            &StepId::new("other"),
        )
        .await
        .unwrap();
        assert!(other.is_empty());
    }

    /// Blob store that refuses every write
    struct FullDisk;

    #[async_trait::async_trait]
    impl BlobStore for FullDisk {
        async fn put(&self, _data: Bytes) -> Result<crate::types::BlobHash> {
            Err(anyhow!("No space left on device"))
        }

        async fn get(&self, _hash: &crate::types::BlobHash) -> Result<Option<Bytes>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_unstorable_output_keeps_classification() {
        let h = harness();
        let executor = StepExecutor::new(h.event_log.clone(), Arc::new(FullDisk))
            .with_echo_output(false);

        let clean = h.script_step("scrape_tcgroups", "echo loaded\n");
        let result = executor.execute(RunId::new(), &clean, 1).await.unwrap();
        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.output.unwrap().stdout, "loaded\n");

        let noisy = h.script_step("scrape_sl_tcproducts", "echo 'permission denied' >&2\n");
        let result = executor.execute(RunId::new(), &noisy, 1).await.unwrap();
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("Error in scrape_sl_tcproducts()"));
    }
}
