use crate::types::{NodeId, NodeState, RuleId, WorkflowId};
use thiserror::Error;

/// Reason a well-formed request was refused by the workflow state machine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("stale rule reference: {0}")]
    StaleRuleReference(RuleId),

    #[error("duplicate rule reference: {0}")]
    DuplicateRuleReference(RuleId),

    #[error("extension would introduce a cycle through node {0}")]
    WouldIntroduceCycle(NodeId),

    #[error("duplicate node identifier: {0}")]
    DuplicateNode(NodeId),

    #[error("edge references unknown node {0}")]
    UnknownEdgeEndpoint(NodeId),

    #[error("node not ready: {node} is {state}")]
    NodeNotReady { node: NodeId, state: NodeState },

    #[error("duplicate node reference: {0}")]
    DuplicateNodeReference(NodeId),

    #[error("invalid file path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("rule not found: {0}")]
    RuleNotFound(RuleId),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("workflow {0} is busy, retry later")]
    Busy(WorkflowId),

    #[error("workflow {0} was modified concurrently")]
    Conflict(WorkflowId),

    #[error("request rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("malformed rule '{rule}': {reason}")]
    Malformed { rule: String, reason: String },

    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::WorkflowNotFound(_)
                | EngineError::NodeNotFound(_)
                | EngineError::RuleNotFound(_)
                | EngineError::TemplateNotFound(_)
                | EngineError::FileNotFound(_)
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
