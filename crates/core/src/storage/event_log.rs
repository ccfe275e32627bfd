use crate::events::{Event, EventLog};
use crate::types::RunId;
use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use walkdir::WalkDir;

/// Flush once this many events are buffered
const FLUSH_THRESHOLD: usize = 100;

/// Event log implementation using gzip-compressed JSONL (JSON Lines) files
pub struct JsonlEventLog {
    base_path: PathBuf,
    buffer: RwLock<Vec<Event>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)
            .context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffer: RwLock::new(Vec::new()),
        })
    }

    /// Format: <base>/YYYY/MM/DD/<run_id>.jsonl.gz
    fn event_log_path(&self, run_id: &RunId, date: NaiveDate) -> PathBuf {
        self.base_path
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", run_id))
    }

    /// Write every buffered event to its run's file for the event's day.
    ///
    /// Groups that fail to write go back into the buffer for the next flush.
    async fn flush_buffer(&self) -> Result<()> {
        let mut buffer = self.buffer.write().await;
        if buffer.is_empty() {
            return Ok(());
        }

        let mut grouped: HashMap<(RunId, NaiveDate), Vec<Event>> = HashMap::new();
        for event in buffer.drain(..) {
            grouped
                .entry((event.run_id, event.timestamp.date_naive()))
                .or_default()
                .push(event);
        }

        let mut first_error = None;
        for ((run_id, date), events) in grouped {
            if let Err(e) = self.append_day(&run_id, date, &events).await {
                tracing::warn!(
                    "Keeping {} events of run {} buffered: {:#}",
                    events.len(),
                    run_id,
                    e
                );
                buffer.extend(events);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn append_day(&self, run_id: &RunId, date: NaiveDate, events: &[Event]) -> Result<()> {
        let path = self.event_log_path(run_id, date);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create event log directory")?;
        }

        let mut all_events = if path.exists() {
            read_jsonl_gz(&path)?
        } else {
            Vec::new()
        };
        all_events.extend_from_slice(events);

        write_jsonl_gz(&path, &all_events).await
    }

    fn get_log_files(&self, run_id: &RunId) -> Result<Vec<PathBuf>> {
        let filename = format!("{}.jsonl.gz", run_id);
        let mut files = Vec::new();

        for entry in WalkDir::new(&self.base_path).min_depth(4).max_depth(4) {
            let entry = entry.context("Failed to walk event log directory")?;
            if entry.file_type().is_file() && entry.file_name().to_string_lossy() == filename {
                files.push(entry.into_path());
            }
        }

        Ok(files)
    }
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    use flate2::read::GzDecoder;
    use std::io::BufRead;

    let file = std::fs::File::open(path).context("Failed to open event log")?;
    let reader = std::io::BufReader::new(GzDecoder::new(file));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line).context("Failed to parse event")?;
        events.push(event);
    }

    Ok(events)
}

async fn write_jsonl_gz(path: &Path, events: &[Event]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }

    let compressed = encoder.finish().context("Failed to finish compression")?;

    tokio::fs::write(path, compressed)
        .await
        .context("Failed to write event log file")?;

    Ok(())
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let buffered = {
            let mut buffer = self.buffer.write().await;
            buffer.push(event);
            buffer.len()
        };

        if buffered > FLUSH_THRESHOLD {
            self.flush_buffer().await?;
        }

        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.flush_buffer().await
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        self.flush_buffer().await?;

        let mut all_events = Vec::new();
        for file in self.get_log_files(&run_id)? {
            all_events.extend(read_jsonl_gz(&file)?);
        }

        all_events.sort_by_key(|e| e.timestamp);

        Ok(all_events)
    }
}
