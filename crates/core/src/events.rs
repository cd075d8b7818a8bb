use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An entry in a workflow's event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub workflow_id: WorkflowId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(workflow_id: WorkflowId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Things that happen to a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    WorkflowCreated {
        name: String,
        template: String,
        rules: Vec<RuleId>,
    },
    RulesApplied {
        rules: Vec<RuleId>,
        nodes: Vec<NodeId>,
        edges: Vec<Edge>,
    },
    NodesSubmitted {
        nodes: Vec<NodeId>,
    },
    NodeStarted {
        node: NodeId,
    },
    NodeFinished {
        node: NodeId,
        #[serde(flatten)]
        outcome: TaskOutcome,
    },
    /// A report that did not fit the node's state
    ReportIgnored {
        node: NodeId,
        state: NodeState,
        report: TaskEvent,
    },
    DispatchFailed {
        node: NodeId,
        error: String,
    },
}

/// Append-only per-workflow event storage
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Events of one workflow in append order
    async fn workflow_events(&self, workflow_id: WorkflowId) -> anyhow::Result<Vec<Event>>;

    /// Drop the log of a deleted workflow
    async fn remove(&self, workflow_id: WorkflowId) -> anyhow::Result<()>;
}
