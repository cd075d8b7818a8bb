use chrono::Utc;
use proptest::prelude::*;
use ruleflow_core::workflow::{
    self, DagExtender, Evaluation, EvaluationContext, NodeScheduler, RuleEvaluator, WorkflowGraph,
};
use ruleflow_core::{
    Context, Dag, Dependency, DependencyType, MatchExpression, NodeState, OffsetRule, Rule,
    RuleInfo, RuleKind, SchedulerType, StepTemplate, TaskEvent, TaskOutcome, Workflow, WorkflowId,
    WorkflowStatus,
};
use serde_json::json;

#[derive(Debug, Clone)]
struct RuleShape {
    depends_on: Option<(usize, bool, bool)>,
    scatter: Option<usize>,
}

fn rule_shape(max_rules: usize) -> impl Strategy<Value = RuleShape> {
    (
        proptest::option::of((0..max_rules, any::<bool>(), any::<bool>())),
        proptest::option::of(0..4usize),
    )
        .prop_map(|(depends_on, scatter)| RuleShape { depends_on, scatter })
}

fn build_rule(index: usize, shape: &RuleShape) -> Rule {
    let name = format!("r{}", index);
    let (kind, dependencies) = match shape.depends_on {
        None => (RuleKind::Init, vec![]),
        Some((target, completed, by_glob)) => {
            let expression = if by_glob {
                MatchExpression::Glob {
                    pattern: format!("r{}*", target),
                }
            } else {
                MatchExpression::Rule {
                    rule: format!("r{}", target),
                }
            };
            let dependency_type = if completed {
                DependencyType::Completed
            } else {
                DependencyType::Exists
            };
            (
                RuleKind::Dependent,
                vec![Dependency {
                    dependency_type,
                    expressions: vec![expression],
                }],
            )
        }
    };

    let mut context = Context::new();
    let scheduler_type = match shape.scatter {
        None => SchedulerType::SingleStep,
        Some(len) => {
            let key = format!("items_{}", index);
            context.insert(key.clone(), json!((0..len).collect::<Vec<_>>()));
            SchedulerType::MultiStep { scatter: key }
        }
    };

    Rule {
        name: name.clone(),
        kind,
        dependencies,
        info: RuleInfo {
            scheduler_type,
            step: StepTemplate {
                name,
                task: json!({ "command": "true" }),
            },
        },
        context,
    }
}

fn new_workflow(rules: Vec<Rule>, evaluator: &RuleEvaluator) -> Workflow {
    let mut wf = Workflow {
        id: WorkflowId::new(),
        name: "prop".to_string(),
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
    workflow::refresh(evaluator, &mut wf, Utc::now());
    wf
}

fn assert_invariants(wf: &Workflow, evaluator: &RuleEvaluator) -> Result<(), TestCaseError> {
    let graph = match WorkflowGraph::build(&wf.dag) {
        Ok(graph) => graph,
        Err(e) => return Err(TestCaseError::fail(format!("DAG invalid: {}", e))),
    };
    prop_assert_eq!(graph.topological_order().len(), wf.dag.nodes.len());

    let ctx = EvaluationContext {
        dag: &wf.dag,
        context: &wf.context,
        at: Utc::now(),
    };
    prop_assert_eq!(&wf.applicable, &evaluator.applicable_rules(&wf.rules, &ctx));

    for node in &wf.dag.nodes {
        let preds_ok = wf
            .dag
            .predecessors(&node.id)
            .all(|p| wf.dag.node(p).map(|p| p.state == NodeState::Success).unwrap_or(false));
        match node.state {
            NodeState::Ready => prop_assert!(preds_ok),
            NodeState::Defined => prop_assert!(!preds_ok),
            _ => {}
        }
    }

    for applied in &wf.applied {
        for id in &applied.nodes {
            prop_assert!(wf.dag.contains(id));
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn extensions_keep_the_dag_consistent(
        shapes in proptest::collection::vec(rule_shape(6), 1..6),
        failures in proptest::collection::vec(any::<bool>(), 32),
    ) {
        let evaluator = RuleEvaluator::default();
        let rules: Vec<Rule> = shapes.iter().enumerate().map(|(i, s)| build_rule(i, s)).collect();
        let mut wf = new_workflow(rules, &evaluator);
        assert_invariants(&wf, &evaluator)?;

        let mut outcomes = failures.into_iter().cycle();
        for _ in 0..16 {
            let mut progressed = false;

            if !wf.applicable.is_empty() {
                let batch = wf.applicable.clone();
                wf = DagExtender::new(&evaluator).apply(&wf, &batch, Utc::now()).map_err(|e| {
                    TestCaseError::fail(format!("applicable batch refused: {}", e))
                })?;
                assert_invariants(&wf, &evaluator)?;
                progressed = true;
            }

            let ready = wf.submittable_nodes();
            if !ready.is_empty() {
                NodeScheduler::submit(&mut wf, &ready, Utc::now()).map_err(|e| {
                    TestCaseError::fail(format!("ready nodes refused: {}", e))
                })?;
                for id in &ready {
                    let outcome = if outcomes.next().unwrap_or(false) {
                        TaskOutcome::Error { diagnostic: "boom".to_string() }
                    } else {
                        TaskOutcome::Success { artifacts: json!({}) }
                    };
                    NodeScheduler::report(&mut wf, id, &TaskEvent::Finished { outcome }, Utc::now())
                        .map_err(|e| TestCaseError::fail(e.to_string()))?;
                }
                workflow::refresh(&evaluator, &mut wf, Utc::now());
                assert_invariants(&wf, &evaluator)?;
                progressed = true;
            }

            if !progressed {
                break;
            }
        }

        if wf.dag.nodes.iter().any(|n| n.state == NodeState::Error) {
            prop_assert_eq!(wf.status, WorkflowStatus::Error);
        }
    }

    #[test]
    fn evaluation_is_deterministic(shape in rule_shape(1)) {
        let evaluator = RuleEvaluator::default();
        let rule = OffsetRule::new("/rules/0", build_rule(0, &RuleShape { depends_on: None, ..shape }));
        let dag = Dag::default();
        let context = Context::new();
        let ctx = EvaluationContext { dag: &dag, context: &context, at: Utc::now() };

        match (evaluator.evaluate(&rule, &ctx), evaluator.evaluate(&rule, &ctx)) {
            (Evaluation::Applicable(a), Evaluation::Applicable(b)) => {
                let ids_a: Vec<_> = a.nodes.iter().map(|n| (&n.id, &n.offset)).collect();
                let ids_b: Vec<_> = b.nodes.iter().map(|n| (&n.id, &n.offset)).collect();
                prop_assert_eq!(ids_a, ids_b);
                prop_assert_eq!(a.edges, b.edges);
            }
            other => prop_assert!(false, "init rule should apply: {:?}", other),
        }
    }
}
