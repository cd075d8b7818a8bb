use crate::events::{Event, EventLog};
use crate::types::WorkflowId;
use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Event log stored as one gzip-compressed JSONL file per workflow.
///
/// Each append writes a complete gzip member, so the file stays valid after
/// every append and is read back with a multi-member decoder.
pub struct JsonlEventLog {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Format: <base>/<workflow_id>.jsonl.gz
    fn event_log_path(&self, workflow_id: &WorkflowId) -> PathBuf {
        self.base_path.join(format!("{}.jsonl.gz", workflow_id))
    }

    fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
        let file = std::fs::File::open(path).context("Failed to open event log")?;
        let reader = std::io::BufReader::new(MultiGzDecoder::new(file));

        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.context("Failed to read line from event log")?;
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line).context("Failed to parse event")?;
            events.push(event);
        }
        Ok(events)
    }

    fn append_jsonl_gz(path: &Path, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(json.as_bytes()).context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
        let compressed = encoder.finish().context("Failed to finish compression")?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context("Failed to open event log file")?;
        file.write_all(&compressed).context("Failed to append to event log file")?;
        file.flush().context("Failed to flush event log file")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let path = self.event_log_path(&event.workflow_id);
        let _guard = self.write_lock.lock().await;
        Self::append_jsonl_gz(&path, &event)
    }

    async fn workflow_events(&self, workflow_id: WorkflowId) -> Result<Vec<Event>> {
        let path = self.event_log_path(&workflow_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let _guard = self.write_lock.lock().await;
        Self::read_jsonl_gz(&path)
    }

    async fn remove(&self, workflow_id: WorkflowId) -> Result<()> {
        let path = self.event_log_path(&workflow_id);
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove event log"),
        }
    }
}
