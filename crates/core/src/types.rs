use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Free-form JSON object carried by templates, rules and nodes
pub type Context = serde_json::Map<String, serde_json::Value>;

/// Short hex digest over a sequence of string parts.
///
/// Parts are separated by a NUL byte so that `["ab", "c"]` and `["a", "bc"]`
/// hash differently.
pub fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..8])
}

/// Unique identifier for a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier of a node, unique within its workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deterministic identifier for the node a rule instantiates at `offset`
    pub fn derive(rule: &RuleId, offset: &str) -> Self {
        Self(digest(&[&rule.0, offset]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a rule instance within its workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub String);

impl RuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn derive(offset: &str, name: &str) -> Self {
        Self(digest(&[offset, name]))
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggregate status of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Idle,
    Running,
    Success,
    Error,
}

impl WorkflowStatus {
    pub const ALL: [WorkflowStatus; 4] = [
        WorkflowStatus::Idle,
        WorkflowStatus::Running,
        WorkflowStatus::Success,
        WorkflowStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Idle => "IDLE",
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Success => "SUCCESS",
            WorkflowStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown workflow status: {}", s))
    }
}

/// Lifecycle state of a DAG node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Defined,
    Ready,
    Submitted,
    Running,
    Success,
    Error,
}

impl NodeState {
    /// Handed to the execution backend and not finished yet
    pub fn is_active(&self) -> bool {
        matches!(self, NodeState::Submitted | NodeState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Success | NodeState::Error)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Defined => "DEFINED",
            NodeState::Ready => "READY",
            NodeState::Submitted => "SUBMITTED",
            NodeState::Running => "RUNNING",
            NodeState::Success => "SUCCESS",
            NodeState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Timestamps recorded as a node moves through its lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTimestamps {
    pub defined: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

impl NodeTimestamps {
    pub fn defined_at(at: DateTime<Utc>) -> Self {
        Self {
            defined: at,
            ready: None,
            submitted: None,
            started: None,
            finished: None,
        }
    }
}

/// Result reported by the execution backend for a finished task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success {
        #[serde(default)]
        artifacts: serde_json::Value,
    },
    Error {
        diagnostic: String,
    },
}

impl TaskOutcome {
    pub fn node_state(&self) -> NodeState {
        match self {
            TaskOutcome::Success { .. } => NodeState::Success,
            TaskOutcome::Error { .. } => NodeState::Error,
        }
    }
}

/// Progress event for a submitted task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Started,
    Finished {
        #[serde(flatten)]
        outcome: TaskOutcome,
    },
}

/// A unit of work in the workflow DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub state: NodeState,
    /// Task specification, passed through to the execution backend untouched
    pub task: serde_json::Value,
    /// Rule instance that contributed this node
    pub rule: RuleId,
    pub rule_name: String,
    /// Opaque binding key of the instantiation that produced this node
    pub offset: String,
    /// Context carried forward to rules that bind this node
    #[serde(default)]
    pub context: Context,
    pub timestamps: NodeTimestamps,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskOutcome>,
}

/// Directed edge from a producer node to a consumer node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
}

impl Edge {
    pub fn new(from: NodeId, to: NodeId) -> Self {
        Self { from, to }
    }
}

/// Nodes and edges of a workflow, in insertion order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Evaluation strategy selector for a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Fires without dependencies
    Init,
    /// Fires once its dependencies resolve against the DAG
    Dependent,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKind::Init => f.write_str("init"),
            RuleKind::Dependent => f.write_str("dependent"),
        }
    }
}

/// How the nodes bound by a dependency must look for it to resolve
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Bound nodes exist, whatever their state
    Exists,
    /// Bound nodes exist and all finished successfully
    #[default]
    Completed,
}

/// Expression selecting existing DAG nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum MatchExpression {
    /// The single node with this display name
    Name { name: String },
    /// All nodes contributed by rules with this name
    Rule { rule: String },
    /// All nodes whose display name matches a glob pattern
    Glob { pattern: String },
    /// All nodes whose carried context has `key` equal to `equals`
    Context {
        key: String,
        equals: serde_json::Value,
    },
}

impl fmt::Display for MatchExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchExpression::Name { name } => write!(f, "name '{}'", name),
            MatchExpression::Rule { rule } => write!(f, "rule '{}'", rule),
            MatchExpression::Glob { pattern } => write!(f, "glob '{}'", pattern),
            MatchExpression::Context { key, equals } => write!(f, "context {}={}", key, equals),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(rename = "type", default)]
    pub dependency_type: DependencyType,
    pub expressions: Vec<MatchExpression>,
}

/// How many nodes a rule instantiates when it fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerType {
    SingleStep,
    /// One node per element of the array parameter named by `scatter`
    MultiStep { scatter: String },
}

/// Template used to materialize nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub name: String,
    #[serde(default)]
    pub task: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleInfo {
    pub scheduler_type: SchedulerType,
    pub step: StepTemplate,
}

/// Declarative production extending the DAG when its dependencies resolve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    pub info: RuleInfo,
    #[serde(default)]
    pub context: Context,
}

/// A rule bound to the offset it was instantiated under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetRule {
    pub id: RuleId,
    pub offset: String,
    pub rule: Rule,
}

impl OffsetRule {
    pub fn new(offset: impl Into<String>, rule: Rule) -> Self {
        let offset = offset.into();
        Self {
            id: RuleId::derive(&offset, &rule.name),
            offset,
            rule,
        }
    }
}

/// A fired rule together with what it contributed to the DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedRule {
    #[serde(flatten)]
    pub rule: OffsetRule,
    pub applied_at: DateTime<Utc>,
    pub nodes: Vec<NodeId>,
    pub edges: Vec<Edge>,
}

/// Complete persisted state of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub status: WorkflowStatus,
    pub dag: Dag,
    /// Initial context produced by template resolution
    #[serde(default)]
    pub context: Context,
    /// Pending rules, in template order
    pub rules: Vec<OffsetRule>,
    pub applied: Vec<AppliedRule>,
    pub applicable: Vec<RuleId>,
    /// Storage revision, bumped on every successful store
    #[serde(default)]
    pub revision: u64,
}

impl Workflow {
    pub fn descriptor(&self) -> WorkflowDescriptor {
        WorkflowDescriptor {
            id: self.id,
            name: self.name.clone(),
            status: self.status,
            created_at: self.created_at,
        }
    }

    pub fn pending_rule(&self, id: &RuleId) -> Option<&OffsetRule> {
        self.rules.iter().find(|r| &r.id == id)
    }

    pub fn applied_rule(&self, id: &RuleId) -> Option<&AppliedRule> {
        self.applied.iter().find(|r| &r.rule.id == id)
    }

    /// Nodes that can be submitted right now
    pub fn submittable_nodes(&self) -> Vec<NodeId> {
        self.dag
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Ready)
            .map(|n| n.id.clone())
            .collect()
    }
}

/// Summary of a workflow used in listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDescriptor {
    pub id: WorkflowId,
    pub name: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_ids_are_stable() {
        let rule = RuleId::derive("/rules/0", "generate");
        assert_eq!(rule, RuleId::derive("/rules/0", "generate"));
        assert_ne!(rule, RuleId::derive("/rules/1", "generate"));
        assert_eq!(rule.0.len(), 16);

        assert_eq!(NodeId::derive(&rule, "a"), NodeId::derive(&rule, "a"));
        assert_ne!(NodeId::derive(&rule, "a"), NodeId::derive(&rule, "b"));
    }

    #[test]
    fn test_digest_separates_parts() {
        assert_ne!(digest(&["ab", "c"]), digest(&["a", "bc"]));
    }

    #[test]
    fn test_workflow_status_parsing() {
        assert_eq!("running".parse::<WorkflowStatus>().unwrap(), WorkflowStatus::Running);
        assert_eq!("ERROR".parse::<WorkflowStatus>().unwrap(), WorkflowStatus::Error);
        assert!("WAITING".parse::<WorkflowStatus>().is_err());
        assert_eq!(
            serde_json::to_value(WorkflowStatus::Idle).unwrap(),
            serde_json::json!("IDLE")
        );
    }

    #[test]
    fn test_rule_deserializes_from_template_json() {
        let rule: Rule = serde_json::from_value(serde_json::json!({
            "name": "analyze",
            "type": "dependent",
            "dependencies": [
                { "type": "completed", "expressions": [{ "match": "rule", "rule": "generate" }] }
            ],
            "info": {
                "scheduler_type": { "type": "multi_step", "scatter": "seeds" },
                "step": { "name": "analyze", "task": { "command": "analyze" } }
            }
        }))
        .unwrap();

        assert_eq!(rule.kind, RuleKind::Dependent);
        assert_eq!(rule.dependencies[0].dependency_type, DependencyType::Completed);
        assert_eq!(
            rule.info.scheduler_type,
            SchedulerType::MultiStep {
                scatter: "seeds".to_string()
            }
        );
        assert!(rule.context.is_empty());
    }

    #[test]
    fn test_task_event_wire_format() {
        let event: TaskEvent = serde_json::from_value(serde_json::json!({
            "event": "finished",
            "outcome": "error",
            "diagnostic": "exit 1"
        }))
        .unwrap();
        assert_eq!(
            event,
            TaskEvent::Finished {
                outcome: TaskOutcome::Error {
                    diagnostic: "exit 1".to_string()
                }
            }
        );
    }
}
