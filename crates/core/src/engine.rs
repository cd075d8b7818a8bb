use crate::backend::{ExecutionBackend, ReportStream, TaskDispatch, TaskReport};
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventLog, EventType};
use crate::locks::WorkflowLocks;
use crate::storage::{FileEntry, WorkDirectory, WorkflowStore};
use crate::template::TemplateResolver;
use crate::types::{
    Context, Dag, NodeId, OffsetRule, RuleId, TaskEvent, TaskOutcome, Workflow,
    WorkflowDescriptor, WorkflowId, WorkflowStatus,
};
use crate::workflow::{self, DagExtender, NodeScheduler, ReportOutcome, RuleEvaluator};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounded wait for the per-workflow lock; zero fails immediately
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(5000),
        }
    }
}

/// Number of workflows per status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub total: usize,
    pub by_status: BTreeMap<WorkflowStatus, usize>,
}

/// Workflow lifecycle operations over the injected store, event log,
/// template resolver and execution backend
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    events: Arc<dyn EventLog>,
    resolver: Arc<dyn TemplateResolver>,
    backend: Arc<dyn ExecutionBackend>,
    workdir: WorkDirectory,
    evaluator: RuleEvaluator,
    locks: WorkflowLocks,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        events: Arc<dyn EventLog>,
        resolver: Arc<dyn TemplateResolver>,
        backend: Arc<dyn ExecutionBackend>,
        workdir: WorkDirectory,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            events,
            resolver,
            backend,
            workdir,
            evaluator: RuleEvaluator::default(),
            locks: WorkflowLocks::new(config.lock_timeout),
        }
    }

    /// Replace the rule strategy table
    pub fn with_evaluator(mut self, evaluator: RuleEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub async fn create_workflow(
        &self,
        template: &str,
        name: Option<&str>,
        parameters: &Context,
    ) -> EngineResult<Workflow> {
        let resolved = self.resolver.resolve(template, parameters).await?;

        let now = Utc::now();
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| resolved.name.clone());

        let mut workflow = Workflow {
            id: WorkflowId::new(),
            name,
            created_at: now,
            status: WorkflowStatus::Idle,
            dag: Dag::default(),
            context: resolved.context,
            rules: resolved
                .rules
                .into_iter()
                .enumerate()
                .map(|(position, rule)| OffsetRule::new(format!("/rules/{}", position), rule))
                .collect(),
            applied: Vec::new(),
            applicable: Vec::new(),
            revision: 0,
        };
        workflow::refresh(&self.evaluator, &mut workflow, now);

        self.workdir.create(&workflow.id)?;
        if let Err(e) = self.store.create(&workflow) {
            if let Err(cleanup) = self.workdir.remove(&workflow.id) {
                warn!(workflow = %workflow.id, error = %cleanup, "Failed to clean up work directory");
            }
            return Err(e);
        }

        info!(
            workflow = %workflow.id,
            name = %workflow.name,
            template = %template,
            rules = workflow.rules.len(),
            "Created workflow"
        );
        self.record(
            workflow.id,
            EventType::WorkflowCreated {
                name: workflow.name.clone(),
                template: template.to_string(),
                rules: workflow.rules.iter().map(|r| r.id.clone()).collect(),
            },
        )
        .await;

        Ok(workflow)
    }

    pub async fn delete_workflow(&self, id: WorkflowId) -> EngineResult<()> {
        let _guard = self.locks.acquire(id).await?;
        if !self.store.delete(&id)? {
            return Err(EngineError::WorkflowNotFound(id));
        }

        if let Err(e) = self.workdir.remove(&id) {
            warn!(workflow = %id, error = %e, "Failed to remove work directory");
        }
        if let Err(e) = self.events.remove(id).await {
            warn!(workflow = %id, error = %e, "Failed to remove event log");
        }

        info!(workflow = %id, "Deleted workflow");
        Ok(())
    }

    pub async fn get_workflow(&self, id: WorkflowId) -> EngineResult<Workflow> {
        self.load(id)
    }

    pub async fn list_workflows(&self, status: Option<WorkflowStatus>) -> EngineResult<Vec<WorkflowDescriptor>> {
        self.store.list(status)
    }

    pub async fn workflow_stats(&self) -> EngineResult<WorkflowStats> {
        let descriptors = self.store.list(None)?;
        let mut by_status: BTreeMap<WorkflowStatus, usize> =
            WorkflowStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for descriptor in &descriptors {
            *by_status.entry(descriptor.status).or_default() += 1;
        }
        Ok(WorkflowStats {
            total: descriptors.len(),
            by_status,
        })
    }

    /// Fire a batch of applicable rules as one transaction
    pub async fn apply_rules(&self, id: WorkflowId, rule_ids: &[RuleId]) -> EngineResult<Workflow> {
        let _guard = self.locks.acquire(id).await?;
        let workflow = self.load(id)?;
        if rule_ids.is_empty() {
            return Ok(workflow);
        }

        let now = Utc::now();
        let mut next = DagExtender::new(&self.evaluator)
            .apply(&workflow, rule_ids, now)
            .inspect_err(|e| warn!(workflow = %id, error = %e, "Rule application refused"))?;
        self.persist(&mut next)?;

        let applied = &next.applied[workflow.applied.len()..];
        let nodes: Vec<NodeId> = applied.iter().flat_map(|a| a.nodes.iter().cloned()).collect();
        info!(
            workflow = %id,
            rules = applied.len(),
            nodes = nodes.len(),
            applicable = next.applicable.len(),
            status = %next.status,
            "Applied rules"
        );
        self.record(
            id,
            EventType::RulesApplied {
                rules: rule_ids.to_vec(),
                nodes,
                edges: applied.iter().flat_map(|a| a.edges.iter().cloned()).collect(),
            },
        )
        .await;

        Ok(next)
    }

    /// Submit READY nodes and hand them to the execution backend
    pub async fn submit_nodes(&self, id: WorkflowId, node_ids: &[NodeId]) -> EngineResult<Workflow> {
        let _guard = self.locks.acquire(id).await?;
        let workflow = self.load(id)?;
        if node_ids.is_empty() {
            return Ok(workflow);
        }

        let now = Utc::now();
        let mut next = workflow;
        NodeScheduler::submit(&mut next, node_ids, now)
            .inspect_err(|e| warn!(workflow = %id, error = %e, "Submission refused"))?;
        workflow::refresh(&self.evaluator, &mut next, now);
        self.persist(&mut next)?;

        info!(workflow = %id, nodes = node_ids.len(), "Submitted nodes");
        self.record(id, EventType::NodesSubmitted { nodes: node_ids.to_vec() }).await;

        let workdir = self.workdir.path(&id);
        let mut failures = Vec::new();
        for node_id in node_ids {
            let Some(node) = next.dag.node(node_id) else {
                continue;
            };
            let task = TaskDispatch {
                workflow_id: id,
                node_id: node_id.clone(),
                name: node.name.clone(),
                task: node.task.clone(),
                workdir: workdir.clone(),
            };
            match self.backend.dispatch(task).await {
                Ok(handle) => debug!(workflow = %id, node = %node_id, handle = %handle.0, "Dispatched node"),
                Err(e) => {
                    error!(workflow = %id, node = %node_id, error = %e, "Dispatch failed");
                    failures.push((node_id.clone(), format!("{:#}", e)));
                }
            }
        }

        if failures.is_empty() {
            return Ok(next);
        }

        let now = Utc::now();
        for (node_id, diagnostic) in &failures {
            let event = TaskEvent::Finished {
                outcome: TaskOutcome::Error {
                    diagnostic: diagnostic.clone(),
                },
            };
            NodeScheduler::report(&mut next, node_id, &event, now)?;
        }
        workflow::refresh(&self.evaluator, &mut next, now);
        self.persist(&mut next)?;

        for (node, error) in failures {
            self.record(id, EventType::DispatchFailed { node, error }).await;
        }
        Ok(next)
    }

    /// Apply a progress report for a submitted node
    pub async fn report_result(
        &self,
        id: WorkflowId,
        node_id: &NodeId,
        event: TaskEvent,
    ) -> EngineResult<ReportOutcome> {
        let _guard = self.locks.acquire(id).await?;
        let mut next = self.load(id)?;

        let now = Utc::now();
        let outcome = NodeScheduler::report(&mut next, node_id, &event, now)?;
        match outcome {
            ReportOutcome::Ignored(state) => {
                warn!(workflow = %id, node = %node_id, %state, ?event, "Ignoring report that does not fit node state");
                self.record(
                    id,
                    EventType::ReportIgnored {
                        node: node_id.clone(),
                        state,
                        report: event,
                    },
                )
                .await;
            }
            ReportOutcome::Applied(state) => {
                workflow::refresh(&self.evaluator, &mut next, now);
                self.persist(&mut next)?;
                info!(workflow = %id, node = %node_id, %state, status = %next.status, "Node updated");

                let event_type = match event {
                    TaskEvent::Started => EventType::NodeStarted { node: node_id.clone() },
                    TaskEvent::Finished { outcome } => EventType::NodeFinished {
                        node: node_id.clone(),
                        outcome,
                    },
                };
                self.record(id, event_type).await;
            }
        }
        Ok(outcome)
    }

    /// Consume backend reports in arrival order until the channel closes
    pub fn spawn_report_listener(self: &Arc<Self>, mut reports: ReportStream) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                engine.handle_report(report).await;
            }
            debug!("Report channel closed");
        })
    }

    async fn handle_report(&self, report: TaskReport) {
        let mut delay = Duration::from_millis(50);
        loop {
            match self
                .report_result(report.workflow_id, &report.node_id, report.event.clone())
                .await
            {
                Err(EngineError::Busy(_)) | Err(EngineError::Conflict(_)) => {
                    debug!(workflow = %report.workflow_id, node = %report.node_id, "Workflow busy, retrying report");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
                Err(e) => {
                    warn!(workflow = %report.workflow_id, node = %report.node_id, error = %e, "Failed to apply report");
                    return;
                }
                Ok(_) => return,
            }
        }
    }

    pub async fn list_files(&self, id: WorkflowId) -> EngineResult<Vec<FileEntry>> {
        self.load(id)?;
        Ok(self.workdir.list(&id)?)
    }

    pub async fn read_file(&self, id: WorkflowId, path: &str) -> EngineResult<Bytes> {
        self.load(id)?;
        self.workdir.read(&id, path).await
    }

    pub async fn workflow_events(&self, id: WorkflowId) -> EngineResult<Vec<Event>> {
        self.load(id)?;
        Ok(self.events.workflow_events(id).await?)
    }

    fn load(&self, id: WorkflowId) -> EngineResult<Workflow> {
        self.store.load(&id)?.ok_or(EngineError::WorkflowNotFound(id))
    }

    fn persist(&self, workflow: &mut Workflow) -> EngineResult<()> {
        workflow.revision = self.store.store(workflow)?;
        Ok(())
    }

    async fn record(&self, id: WorkflowId, event_type: EventType) {
        if let Err(e) = self.events.append(Event::new(id, event_type)).await {
            error!(workflow = %id, error = %e, "Failed to append event");
        }
    }
}
