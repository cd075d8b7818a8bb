use crate::error::{EngineError, EngineResult, Rejection};
use crate::types::{Dag, NodeId, NodeState, TaskEvent, Workflow};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Effect of a task report on its node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The node moved to the contained state
    Applied(NodeState),
    /// The report did not fit the node's state and was dropped
    Ignored(NodeState),
}

/// Node readiness, submission and result handling
pub struct NodeScheduler;

impl NodeScheduler {
    /// Promote DEFINED nodes whose predecessors all succeeded; returns the promoted ids
    pub fn refresh_ready(dag: &mut Dag, at: DateTime<Utc>) -> Vec<NodeId> {
        let ready: Vec<NodeId> = dag
            .nodes
            .iter()
            .filter(|node| node.state == NodeState::Defined)
            .filter(|node| {
                dag.predecessors(&node.id).all(|pred| {
                    dag.node(pred)
                        .map(|p| p.state == NodeState::Success)
                        .unwrap_or(false)
                })
            })
            .map(|node| node.id.clone())
            .collect();

        for id in &ready {
            if let Some(node) = dag.node_mut(id) {
                node.state = NodeState::Ready;
                node.timestamps.ready = Some(at);
            }
        }
        ready
    }

    /// Mark a batch of READY nodes SUBMITTED. The batch is validated as a whole
    /// before any node changes.
    pub fn submit(workflow: &mut Workflow, node_ids: &[NodeId], at: DateTime<Utc>) -> EngineResult<()> {
        let mut seen = HashSet::new();
        for id in node_ids {
            if !seen.insert(id) {
                return Err(Rejection::DuplicateNodeReference(id.clone()).into());
            }
            let node = workflow
                .dag
                .node(id)
                .ok_or_else(|| EngineError::NodeNotFound(id.clone()))?;
            if node.state != NodeState::Ready {
                return Err(Rejection::NodeNotReady {
                    node: id.clone(),
                    state: node.state,
                }
                .into());
            }
        }

        for id in node_ids {
            if let Some(node) = workflow.dag.node_mut(id) {
                node.state = NodeState::Submitted;
                node.timestamps.submitted = Some(at);
            }
        }
        Ok(())
    }

    pub fn report(
        workflow: &mut Workflow,
        node_id: &NodeId,
        event: &TaskEvent,
        at: DateTime<Utc>,
    ) -> EngineResult<ReportOutcome> {
        let node = workflow
            .dag
            .node_mut(node_id)
            .ok_or_else(|| EngineError::NodeNotFound(node_id.clone()))?;

        let outcome = match (event, node.state) {
            (TaskEvent::Started, NodeState::Submitted) => {
                node.state = NodeState::Running;
                node.timestamps.started = Some(at);
                ReportOutcome::Applied(node.state)
            }
            (TaskEvent::Finished { outcome }, NodeState::Submitted | NodeState::Running) => {
                node.state = outcome.node_state();
                node.timestamps.finished = Some(at);
                node.result = Some(outcome.clone());
                ReportOutcome::Applied(node.state)
            }
            (_, state) => ReportOutcome::Ignored(state),
        };
        Ok(outcome)
    }
}
