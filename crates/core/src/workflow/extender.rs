use crate::error::{EngineError, EngineResult, Rejection};
use crate::types::{AppliedRule, OffsetRule, RuleId, Workflow};
use crate::workflow::evaluator::{Evaluation, EvaluationContext, RuleEvaluator};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Applies batches of applicable rules to a workflow
pub struct DagExtender<'a> {
    evaluator: &'a RuleEvaluator,
}

impl<'a> DagExtender<'a> {
    pub fn new(evaluator: &'a RuleEvaluator) -> Self {
        Self { evaluator }
    }

    /// Build the successor state of `workflow` after firing `rule_ids`.
    ///
    /// Every rule is evaluated against the same snapshot and the merged
    /// candidate DAG is validated before anything is promoted. On error the
    /// input workflow is the current state.
    pub fn apply(&self, workflow: &Workflow, rule_ids: &[RuleId], at: DateTime<Utc>) -> EngineResult<Workflow> {
        let ctx = EvaluationContext {
            dag: &workflow.dag,
            context: &workflow.context,
            at,
        };

        let mut seen = HashSet::new();
        for id in rule_ids {
            if !seen.insert(id) {
                return Err(Rejection::DuplicateRuleReference(id.clone()).into());
            }
            if workflow.applicable.contains(id) {
                continue;
            }
            match workflow.pending_rule(id) {
                // A pending rule left out of the applicable set may be broken rather than waiting
                Some(rule) => {
                    if let Evaluation::Malformed(reason) = self.evaluator.evaluate(rule, &ctx) {
                        return Err(EngineError::Malformed {
                            rule: rule.rule.name.clone(),
                            reason,
                        });
                    }
                }
                None if workflow.applied_rule(id).is_none() => {
                    return Err(EngineError::RuleNotFound(id.clone()));
                }
                None => {}
            }
            return Err(Rejection::StaleRuleReference(id.clone()).into());
        }

        let mut extensions = Vec::with_capacity(rule_ids.len());
        for id in rule_ids {
            let rule = workflow
                .pending_rule(id)
                .ok_or_else(|| Rejection::StaleRuleReference(id.clone()))?;
            match self.evaluator.evaluate(rule, &ctx) {
                Evaluation::Applicable(extension) => extensions.push(extension),
                Evaluation::NotApplicable(reason) => {
                    debug!(rule = %rule.rule.name, %reason, "Listed rule no longer applies");
                    return Err(Rejection::StaleRuleReference(id.clone()).into());
                }
                Evaluation::Malformed(reason) => {
                    return Err(EngineError::Malformed {
                        rule: rule.rule.name.clone(),
                        reason,
                    });
                }
            }
        }

        let mut next = workflow.clone();
        for extension in &extensions {
            next.dag
                .extend(extension.nodes.iter().cloned(), extension.edges.iter().cloned());
        }
        next.dag.validate()?;

        let fired: HashSet<&RuleId> = rule_ids.iter().collect();
        let (fired_rules, pending): (Vec<OffsetRule>, Vec<OffsetRule>) =
            next.rules.into_iter().partition(|r| fired.contains(&r.id));
        next.rules = pending;

        let mut fired_rules: HashMap<RuleId, OffsetRule> =
            fired_rules.into_iter().map(|r| (r.id.clone(), r)).collect();
        for extension in extensions {
            if let Some(rule) = fired_rules.remove(&extension.rule) {
                next.applied.push(AppliedRule {
                    rule,
                    applied_at: at,
                    nodes: extension.nodes.iter().map(|n| n.id.clone()).collect(),
                    edges: extension.edges,
                });
            }
        }

        super::refresh(self.evaluator, &mut next, at);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Context, Dag, DependencyType, MatchExpression, NodeState, WorkflowId, WorkflowStatus,
    };
    use crate::workflow::evaluator::tests::{dependent_rule, init_rule};

    fn workflow(rules: Vec<crate::types::Rule>) -> Workflow {
        let evaluator = RuleEvaluator::default();
        let mut wf = Workflow {
            id: WorkflowId::new(),
            name: "extend".to_string(),
            created_at: Utc::now(),
            status: WorkflowStatus::Idle,
            dag: Dag::default(),
            context: Context::new(),
            rules: rules
                .into_iter()
                .enumerate()
                .map(|(i, r)| OffsetRule::new(format!("/rules/{}", i), r))
                .collect(),
            applied: vec![],
            applicable: vec![],
            revision: 0,
        };
        crate::workflow::refresh(&evaluator, &mut wf, Utc::now());
        wf
    }

    #[test]
    fn test_apply_promotes_rule_and_readies_nodes() {
        let evaluator = RuleEvaluator::default();
        let wf = workflow(vec![
            init_rule("generate"),
            dependent_rule("analyze", "generate", DependencyType::Completed),
        ]);
        assert_eq!(wf.applicable, vec![wf.rules[0].id.clone()]);
        assert_eq!(wf.status, WorkflowStatus::Running);

        let id = wf.rules[0].id.clone();
        let next = DagExtender::new(&evaluator).apply(&wf, &[id.clone()], Utc::now()).unwrap();

        assert_eq!(next.rules.len(), 1);
        assert_eq!(next.applied.len(), 1);
        assert_eq!(next.applied[0].rule.id, id);
        assert_eq!(next.applied[0].nodes, vec![next.dag.nodes[0].id.clone()]);
        assert_eq!(next.dag.nodes[0].state, NodeState::Ready);
        assert!(next.applicable.is_empty());
        assert_eq!(next.status, WorkflowStatus::Idle);
    }

    #[test]
    fn test_exists_dependency_fires_before_success() {
        let evaluator = RuleEvaluator::default();
        let wf = workflow(vec![
            init_rule("generate"),
            dependent_rule("watch", "generate", DependencyType::Exists),
        ]);
        let extender = DagExtender::new(&evaluator);

        let first = extender.apply(&wf, &[wf.rules[0].id.clone()], Utc::now()).unwrap();
        assert_eq!(first.applicable, vec![first.rules[0].id.clone()]);

        let second = extender
            .apply(&first, &[first.rules[0].id.clone()], Utc::now())
            .unwrap();
        assert_eq!(second.dag.nodes.len(), 2);
        assert_eq!(second.dag.edges.len(), 1);
        assert_eq!(second.dag.edges[0].from, second.dag.nodes[0].id);
        assert_eq!(second.dag.nodes[1].state, NodeState::Defined);
        assert!(second.rules.is_empty());
    }

    #[test]
    fn test_stale_and_unknown_references() {
        let evaluator = RuleEvaluator::default();
        let wf = workflow(vec![
            init_rule("generate"),
            dependent_rule("analyze", "generate", DependencyType::Completed),
        ]);
        let extender = DagExtender::new(&evaluator);

        let pending_not_applicable = wf.rules[1].id.clone();
        assert!(matches!(
            extender.apply(&wf, &[pending_not_applicable], Utc::now()),
            Err(EngineError::Rejected(Rejection::StaleRuleReference(_)))
        ));

        let applied = extender.apply(&wf, &[wf.rules[0].id.clone()], Utc::now()).unwrap();
        assert!(matches!(
            extender.apply(&applied, &[wf.rules[0].id.clone()], Utc::now()),
            Err(EngineError::Rejected(Rejection::StaleRuleReference(_)))
        ));

        assert!(matches!(
            extender.apply(&wf, &[RuleId::new("nope")], Utc::now()),
            Err(EngineError::RuleNotFound(_))
        ));

        let id = wf.rules[0].id.clone();
        assert!(matches!(
            extender.apply(&wf, &[id.clone(), id], Utc::now()),
            Err(EngineError::Rejected(Rejection::DuplicateRuleReference(_)))
        ));
    }

    #[test]
    fn test_malformed_rule_is_reported_not_stale() {
        let evaluator = RuleEvaluator::default();
        let mut broken = init_rule("broken");
        broken.dependencies = dependent_rule("x", "generate", DependencyType::Exists).dependencies;
        let wf = workflow(vec![init_rule("generate"), broken]);
        assert_eq!(wf.applicable, vec![wf.rules[0].id.clone()]);

        let result = DagExtender::new(&evaluator).apply(&wf, &[wf.rules[1].id.clone()], Utc::now());
        assert!(matches!(
            result,
            Err(EngineError::Malformed { ref rule, .. }) if rule == "broken"
        ));
    }

    #[test]
    fn test_colliding_node_rejects_batch_and_keeps_state() {
        let evaluator = RuleEvaluator::default();
        let mut wf = workflow(vec![init_rule("generate"), init_rule("other")]);

        // Plant the node the first rule would produce
        let ctx = EvaluationContext {
            dag: &wf.dag,
            context: &wf.context,
            at: Utc::now(),
        };
        let Evaluation::Applicable(extension) = evaluator.evaluate(&wf.rules[0], &ctx) else {
            panic!("init rule should apply");
        };
        wf.dag.nodes.extend(extension.nodes);
        let before = wf.clone();

        let ids: Vec<RuleId> = wf.rules.iter().map(|r| r.id.clone()).collect();
        let result = DagExtender::new(&evaluator).apply(&wf, &ids, Utc::now());
        assert!(matches!(
            result,
            Err(EngineError::Rejected(Rejection::DuplicateNode(_)))
        ));
        assert_eq!(wf, before);
    }

    #[test]
    fn test_batch_applies_against_one_snapshot() {
        let evaluator = RuleEvaluator::default();
        let mut glob_rule = dependent_rule("collect", "generate", DependencyType::Exists);
        glob_rule.dependencies[0].expressions = vec![MatchExpression::Glob {
            pattern: "gen*".to_string(),
        }];
        let wf = workflow(vec![init_rule("generate"), glob_rule]);

        // collect cannot fire in the same batch as generate
        let ids: Vec<RuleId> = wf.rules.iter().map(|r| r.id.clone()).collect();
        assert!(matches!(
            DagExtender::new(&evaluator).apply(&wf, &ids, Utc::now()),
            Err(EngineError::Rejected(Rejection::StaleRuleReference(_)))
        ));
    }
}
