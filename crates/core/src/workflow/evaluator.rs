use crate::template::TemplateProcessor;
use crate::types::{
    digest, Context, Dag, Dependency, DependencyType, Edge, MatchExpression, Node, NodeId,
    NodeState, NodeTimestamps, OffsetRule, Rule, RuleId, RuleKind, SchedulerType,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Nodes and edges a rule contributes when it fires
#[derive(Debug, Clone, PartialEq)]
pub struct Extension {
    pub rule: RuleId,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Applicable(Extension),
    NotApplicable(String),
    Malformed(String),
}

impl Evaluation {
    pub fn is_applicable(&self) -> bool {
        matches!(self, Evaluation::Applicable(_))
    }
}

/// Snapshot a rule is evaluated against
#[derive(Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub dag: &'a Dag,
    pub context: &'a Context,
    pub at: DateTime<Utc>,
}

/// Result of resolving a rule's dependencies
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// Upstream node ids, sorted and unique
    Bound(Vec<NodeId>),
    Unbound(String),
    Malformed(String),
}

/// Dependency resolution for one rule kind
pub trait RuleStrategy: Send + Sync {
    fn bind(&self, rule: &OffsetRule, dag: &Dag) -> Binding;
}

/// Rules that fire unconditionally
pub struct InitStrategy;

impl RuleStrategy for InitStrategy {
    fn bind(&self, rule: &OffsetRule, _dag: &Dag) -> Binding {
        if !rule.rule.dependencies.is_empty() {
            return Binding::Malformed("init rules cannot declare dependencies".to_string());
        }
        Binding::Bound(Vec::new())
    }
}

/// Rules that fire once every dependency resolves against the DAG
pub struct DependentStrategy;

impl RuleStrategy for DependentStrategy {
    fn bind(&self, rule: &OffsetRule, dag: &Dag) -> Binding {
        if rule.rule.dependencies.is_empty() {
            return Binding::Malformed("dependent rules need at least one dependency".to_string());
        }

        let mut bound = BTreeSet::new();
        for dependency in &rule.rule.dependencies {
            match resolve_dependency(dependency, dag) {
                Binding::Bound(ids) => bound.extend(ids),
                other => return other,
            }
        }
        Binding::Bound(bound.into_iter().collect())
    }
}

fn resolve_dependency(dependency: &Dependency, dag: &Dag) -> Binding {
    if dependency.expressions.is_empty() {
        return Binding::Malformed("dependency without match expressions".to_string());
    }

    let mut bound = BTreeSet::new();
    for expression in &dependency.expressions {
        let matched = match match_expression(expression, dag) {
            Ok(matched) => matched,
            Err(reason) => return Binding::Malformed(reason),
        };
        if matched.is_empty() {
            return Binding::Unbound(format!("{} matches no node", expression));
        }
        if dependency.dependency_type == DependencyType::Completed {
            if let Some(node) = matched.iter().find(|n| n.state != NodeState::Success) {
                return Binding::Unbound(format!("node {} ({}) is {}", node.name, node.id, node.state));
            }
        }
        bound.extend(matched.into_iter().map(|n| n.id.clone()));
    }
    Binding::Bound(bound.into_iter().collect())
}

/// Defects of a rule that no DAG state can repair
pub fn check_rule(rule: &Rule) -> Result<(), String> {
    match rule.kind {
        RuleKind::Init if !rule.dependencies.is_empty() => {
            return Err("init rules cannot declare dependencies".to_string());
        }
        RuleKind::Dependent if rule.dependencies.is_empty() => {
            return Err("dependent rules need at least one dependency".to_string());
        }
        _ => {}
    }

    for dependency in &rule.dependencies {
        if dependency.expressions.is_empty() {
            return Err("dependency without match expressions".to_string());
        }
        for expression in &dependency.expressions {
            // Against an empty DAG only static defects can surface
            match_expression(expression, &Dag::default())?;
        }
    }

    if let SchedulerType::MultiStep { scatter } = &rule.info.scheduler_type {
        if scatter.trim().is_empty() {
            return Err("multi_step rules need a scatter parameter".to_string());
        }
    }
    Ok(())
}

/// Nodes selected by an expression, or the reason the expression is malformed
pub fn match_expression<'a>(expression: &MatchExpression, dag: &'a Dag) -> Result<Vec<&'a Node>, String> {
    let matched: Vec<&Node> = match expression {
        MatchExpression::Name { name } => {
            let matched: Vec<&Node> = dag.nodes.iter().filter(|n| &n.name == name).collect();
            if matched.len() > 1 {
                return Err(format!("name '{}' is ambiguous, it matches {} nodes", name, matched.len()));
            }
            matched
        }
        MatchExpression::Rule { rule } => dag.nodes.iter().filter(|n| &n.rule_name == rule).collect(),
        MatchExpression::Glob { pattern } => {
            if pattern.is_empty() {
                return Err("empty glob pattern".to_string());
            }
            let matcher = globset::Glob::new(pattern)
                .map_err(|e| format!("invalid glob pattern '{}': {}", pattern, e))?
                .compile_matcher();
            dag.nodes.iter().filter(|n| matcher.is_match(&n.name)).collect()
        }
        MatchExpression::Context { key, equals } => {
            if key.is_empty() {
                return Err("empty context key".to_string());
            }
            dag.nodes
                .iter()
                .filter(|n| n.context.get(key) == Some(equals))
                .collect()
        }
    };
    Ok(matched)
}

/// Strategy registration table keyed by rule kind
#[derive(Clone)]
pub struct RuleEvaluator {
    strategies: HashMap<RuleKind, Arc<dyn RuleStrategy>>,
}

impl RuleEvaluator {
    /// Evaluator without any registered strategy
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: RuleKind, strategy: Arc<dyn RuleStrategy>) -> &mut Self {
        self.strategies.insert(kind, strategy);
        self
    }

    pub fn evaluate(&self, rule: &OffsetRule, ctx: &EvaluationContext<'_>) -> Evaluation {
        let Some(strategy) = self.strategies.get(&rule.rule.kind) else {
            return Evaluation::Malformed(format!(
                "no evaluation strategy registered for {} rules",
                rule.rule.kind
            ));
        };

        match strategy.bind(rule, ctx.dag) {
            Binding::Unbound(reason) => Evaluation::NotApplicable(reason),
            Binding::Malformed(reason) => Evaluation::Malformed(reason),
            Binding::Bound(upstream) => match materialize(rule, &upstream, ctx) {
                Ok(extension) => Evaluation::Applicable(extension),
                Err(reason) => Evaluation::Malformed(reason),
            },
        }
    }

    /// Pending rules that currently evaluate Applicable, in pending order
    pub fn applicable_rules(&self, rules: &[OffsetRule], ctx: &EvaluationContext<'_>) -> Vec<RuleId> {
        rules
            .iter()
            .filter(|rule| match self.evaluate(rule, ctx) {
                Evaluation::Applicable(_) => true,
                Evaluation::NotApplicable(reason) => {
                    debug!(rule = %rule.rule.name, %reason, "Rule not applicable");
                    false
                }
                Evaluation::Malformed(reason) => {
                    warn!(rule = %rule.rule.name, %reason, "Malformed rule excluded from applicable set");
                    false
                }
            })
            .map(|rule| rule.id.clone())
            .collect()
    }
}

impl Default for RuleEvaluator {
    fn default() -> Self {
        let mut evaluator = Self::empty();
        evaluator
            .register(RuleKind::Init, Arc::new(InitStrategy))
            .register(RuleKind::Dependent, Arc::new(DependentStrategy));
        evaluator
    }
}

fn merge(target: &mut Context, source: &Context) {
    for (key, value) in source {
        target.insert(key.clone(), value.clone());
    }
}

fn materialize(rule: &OffsetRule, upstream: &[NodeId], ctx: &EvaluationContext<'_>) -> Result<Extension, String> {
    let mut carried = Context::new();
    for id in upstream {
        if let Some(node) = ctx.dag.node(id) {
            merge(&mut carried, &node.context);
        }
    }
    merge(&mut carried, &rule.rule.context);

    let mut scope = ctx.context.clone();
    merge(&mut scope, &carried);
    scope.insert(
        "inputs".to_string(),
        Value::Array(upstream.iter().map(|id| Value::String(id.0.clone())).collect()),
    );

    let instances: Vec<Option<(usize, Value)>> = match &rule.rule.info.scheduler_type {
        SchedulerType::SingleStep => vec![None],
        SchedulerType::MultiStep { scatter } => match scope.get(scatter) {
            Some(Value::Array(items)) => items.iter().cloned().enumerate().map(Some).collect(),
            Some(_) => return Err(format!("scatter parameter '{}' is not an array", scatter)),
            None => return Err(format!("scatter parameter '{}' is not in scope", scatter)),
        },
    };

    let upstream_refs: Vec<&str> = upstream.iter().map(|id| id.0.as_str()).collect();
    let binding = digest(&upstream_refs);
    let step = &rule.rule.info.step;

    let mut nodes = Vec::with_capacity(instances.len());
    let mut edges = Vec::with_capacity(instances.len() * upstream.len());
    for instance in instances {
        let mut instance_scope = scope.clone();
        let (offset, name) = match instance {
            None => (
                format!("{}/{}", rule.offset, binding),
                TemplateProcessor::render_str(&step.name, &instance_scope),
            ),
            Some((index, item)) => {
                instance_scope.insert("index".to_string(), Value::from(index));
                instance_scope.insert("item".to_string(), item);
                let rendered = TemplateProcessor::render_str(&step.name, &instance_scope);
                let per_instance = TemplateProcessor::extract_parameters(&step.name)
                    .iter()
                    .any(|p| p == "item" || p == "index");
                let name = if per_instance {
                    rendered
                } else {
                    format!("{}_{}", rendered, index)
                };
                (format!("{}/{}/{}", rule.offset, binding, index), name)
            }
        };

        let id = NodeId::derive(&rule.id, &offset);
        edges.extend(upstream.iter().map(|from| Edge::new(from.clone(), id.clone())));
        nodes.push(Node {
            id,
            name,
            state: NodeState::Defined,
            task: TemplateProcessor::render_value(&step.task, &instance_scope),
            rule: rule.id.clone(),
            rule_name: rule.rule.name.clone(),
            offset,
            context: carried.clone(),
            timestamps: NodeTimestamps::defined_at(ctx.at),
            result: None,
        });
    }

    Ok(Extension {
        rule: rule.id.clone(),
        nodes,
        edges,
    })
}
