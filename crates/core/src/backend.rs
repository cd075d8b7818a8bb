// Execution backends: where submitted nodes actually run

use crate::types::{NodeId, TaskEvent, TaskOutcome, WorkflowId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A node handed to an execution backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDispatch {
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,
    pub name: String,
    pub task: serde_json::Value,
    /// Working directory of the workflow
    pub workdir: PathBuf,
}

/// Backend-specific reference to a dispatched task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(pub String);

/// Progress report travelling from a backend back to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,
    pub event: TaskEvent,
}

pub type ReportSink = mpsc::UnboundedSender<TaskReport>;
pub type ReportStream = mpsc::UnboundedReceiver<TaskReport>;

pub fn report_channel() -> (ReportSink, ReportStream) {
    mpsc::unbounded_channel()
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Start a task without waiting for it; progress arrives as reports
    async fn dispatch(&self, task: TaskDispatch) -> Result<TaskHandle>;
}

/// Task specification understood by [`ProcessBackend`]
#[derive(Debug, Clone, Deserialize)]
struct ProcessSpec {
    command: String,
    #[serde(default)]
    args: Vec<serde_json::Value>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Runs `{"command", "args", "env"}` tasks as local processes.
///
/// Each node runs in `<workdir>/<node_id>` with stdout and stderr captured to
/// `stdout.log` and `stderr.log`.
pub struct ProcessBackend {
    sink: ReportSink,
}

impl ProcessBackend {
    pub fn new(sink: ReportSink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    async fn dispatch(&self, task: TaskDispatch) -> Result<TaskHandle> {
        let spec: ProcessSpec = serde_json::from_value(task.task.clone())
            .context("Task is not a process specification")?;

        let node_dir = task.workdir.join(&task.node_id.0);
        tokio::fs::create_dir_all(&node_dir)
            .await
            .context("Failed to create node directory")?;

        let handle = TaskHandle(format!("process:{}/{}", task.workflow_id, task.node_id));
        let sink = self.sink.clone();
        tokio::spawn(run_process(spec, node_dir, task, sink));
        Ok(handle)
    }
}

fn send_report(sink: &ReportSink, task: &TaskDispatch, event: TaskEvent) {
    let report = TaskReport {
        workflow_id: task.workflow_id,
        node_id: task.node_id.clone(),
        event,
    };
    if sink.send(report).is_err() {
        warn!(workflow = %task.workflow_id, node = %task.node_id, "Report channel closed, dropping report");
    }
}

async fn run_process(spec: ProcessSpec, node_dir: PathBuf, task: TaskDispatch, sink: ReportSink) {
    send_report(&sink, &task, TaskEvent::Started);

    let outcome = match spawn_and_wait(&spec, &node_dir).await {
        Ok(status) if status.success() => TaskOutcome::Success {
            artifacts: serde_json::json!({
                "exit_code": status.code(),
                "stdout": format!("{}/stdout.log", task.node_id),
                "stderr": format!("{}/stderr.log", task.node_id),
            }),
        },
        Ok(status) => TaskOutcome::Error {
            diagnostic: format!("{} exited with {}", spec.command, status),
        },
        Err(e) => TaskOutcome::Error {
            diagnostic: format!("{:#}", e),
        },
    };

    debug!(workflow = %task.workflow_id, node = %task.node_id, ?outcome, "Process finished");
    send_report(&sink, &task, TaskEvent::Finished { outcome });
}

async fn spawn_and_wait(spec: &ProcessSpec, node_dir: &std::path::Path) -> Result<std::process::ExitStatus> {
    let stdout = std::fs::File::create(node_dir.join("stdout.log")).context("Failed to create stdout.log")?;
    let stderr = std::fs::File::create(node_dir.join("stderr.log")).context("Failed to create stderr.log")?;

    let args: Vec<String> = spec
        .args
        .iter()
        .map(|arg| match arg {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();

    tokio::process::Command::new(&spec.command)
        .args(&args)
        .envs(&spec.env)
        .current_dir(node_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .status()
        .await
        .with_context(|| format!("Failed to run {}", spec.command))
}

/// Records dispatched tasks without running them
#[derive(Default)]
pub struct DryRunBackend {
    dispatched: Mutex<Vec<TaskDispatch>>,
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&self) -> Vec<TaskDispatch> {
        self.dispatched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl ExecutionBackend for DryRunBackend {
    async fn dispatch(&self, task: TaskDispatch) -> Result<TaskHandle> {
        let handle = TaskHandle(format!("dry-run:{}/{}", task.workflow_id, task.node_id));
        debug!(workflow = %task.workflow_id, node = %task.node_id, "Dry run dispatch");
        self.dispatched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn dispatch(workdir: PathBuf, task: serde_json::Value) -> TaskDispatch {
        TaskDispatch {
            workflow_id: WorkflowId::new(),
            node_id: NodeId::new("n1"),
            name: "n1".to_string(),
            task,
            workdir,
        }
    }

    #[tokio::test]
    async fn test_process_backend_reports_success() {
        let temp_dir = TempDir::new().unwrap();
        let (sink, mut reports) = report_channel();
        let backend = ProcessBackend::new(sink);

        backend
            .dispatch(dispatch(
                temp_dir.path().to_path_buf(),
                json!({ "command": "sh", "args": ["-c", "echo $GREETING"], "env": { "GREETING": "hi" } }),
            ))
            .await
            .unwrap();

        assert_eq!(reports.recv().await.unwrap().event, TaskEvent::Started);
        let finished = reports.recv().await.unwrap();
        assert!(matches!(
            finished.event,
            TaskEvent::Finished { outcome: TaskOutcome::Success { .. } }
        ));
        let stdout = std::fs::read_to_string(temp_dir.path().join("n1").join("stdout.log")).unwrap();
        assert_eq!(stdout.trim(), "hi");
    }

    #[tokio::test]
    async fn test_process_backend_reports_failure() {
        let temp_dir = TempDir::new().unwrap();
        let (sink, mut reports) = report_channel();
        let backend = ProcessBackend::new(sink);

        backend
            .dispatch(dispatch(
                temp_dir.path().to_path_buf(),
                json!({ "command": "sh", "args": ["-c", "exit 3"] }),
            ))
            .await
            .unwrap();

        reports.recv().await.unwrap();
        let TaskEvent::Finished { outcome: TaskOutcome::Error { diagnostic } } = reports.recv().await.unwrap().event else {
            panic!("expected an error outcome");
        };
        assert!(diagnostic.contains("sh exited"));
    }

    #[tokio::test]
    async fn test_invalid_task_fails_dispatch() {
        let temp_dir = TempDir::new().unwrap();
        let (sink, _reports) = report_channel();
        let backend = ProcessBackend::new(sink);

        let result = backend
            .dispatch(dispatch(temp_dir.path().to_path_buf(), json!({ "image": "busybox" })))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dry_run_backend_records() {
        let backend = DryRunBackend::new();
        let handle = backend
            .dispatch(dispatch(PathBuf::from("/tmp"), json!({})))
            .await
            .unwrap();
        assert!(handle.0.starts_with("dry-run:"));
        assert_eq!(backend.dispatched().len(), 1);
    }
}
