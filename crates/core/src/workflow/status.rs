use crate::types::{NodeState, Workflow, WorkflowStatus};

/// Derive the aggregate status of a workflow.
///
/// ERROR dominates, then SUCCESS (no pending rules, every node succeeded),
/// then RUNNING (work in flight or a rule can fire), otherwise IDLE.
pub fn recompute(workflow: &Workflow) -> WorkflowStatus {
    let nodes = &workflow.dag.nodes;

    if nodes.iter().any(|n| n.state == NodeState::Error) {
        return WorkflowStatus::Error;
    }
    if workflow.rules.is_empty() && nodes.iter().all(|n| n.state == NodeState::Success) {
        return WorkflowStatus::Success;
    }
    if nodes.iter().any(|n| n.state.is_active()) || !workflow.applicable.is_empty() {
        return WorkflowStatus::Running;
    }
    WorkflowStatus::Idle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Dag, OffsetRule, RuleId, WorkflowId};
    use crate::workflow::dag::tests::test_node;
    use crate::workflow::evaluator::tests::init_rule;
    use chrono::Utc;

    fn workflow(states: &[NodeState]) -> Workflow {
        Workflow {
            id: WorkflowId::new(),
            name: "status".to_string(),
            created_at: Utc::now(),
            status: WorkflowStatus::Idle,
            dag: Dag {
                nodes: states
                    .iter()
                    .enumerate()
                    .map(|(i, s)| test_node(&format!("n{}", i), *s))
                    .collect(),
                edges: vec![],
            },
            context: Default::default(),
            rules: vec![],
            applied: vec![],
            applicable: vec![],
            revision: 0,
        }
    }

    #[test]
    fn test_error_dominates_success() {
        let wf = workflow(&[NodeState::Success, NodeState::Error]);
        assert_eq!(recompute(&wf), WorkflowStatus::Error);

        let mut wf = workflow(&[NodeState::Error, NodeState::Running]);
        wf.applicable.push(RuleId::new("r"));
        assert_eq!(recompute(&wf), WorkflowStatus::Error);
    }

    #[test]
    fn test_success_needs_no_pending_rules() {
        let wf = workflow(&[NodeState::Success, NodeState::Success]);
        assert_eq!(recompute(&wf), WorkflowStatus::Success);

        let mut wf = workflow(&[NodeState::Success]);
        wf.rules.push(OffsetRule::new("/rules/1", init_rule("later")));
        assert_eq!(recompute(&wf), WorkflowStatus::Idle);
    }

    #[test]
    fn test_running_and_idle() {
        assert_eq!(recompute(&workflow(&[NodeState::Submitted])), WorkflowStatus::Running);
        assert_eq!(recompute(&workflow(&[NodeState::Ready])), WorkflowStatus::Idle);

        let mut wf = workflow(&[NodeState::Ready]);
        wf.rules.push(OffsetRule::new("/rules/0", init_rule("go")));
        wf.applicable.push(wf.rules[0].id.clone());
        assert_eq!(recompute(&wf), WorkflowStatus::Running);
    }
}
