pub mod dag;
pub mod evaluator;
pub mod extender;
pub mod scheduler;
pub mod status;

pub use dag::WorkflowGraph;
pub use evaluator::{
    Binding, DependentStrategy, Evaluation, EvaluationContext, Extension, InitStrategy,
    RuleEvaluator, RuleStrategy,
};
pub use extender::DagExtender;
pub use scheduler::{NodeScheduler, ReportOutcome};

use crate::types::Workflow;
use chrono::{DateTime, Utc};

/// Bring derived workflow state up to date: READY nodes, the applicable rule
/// set and the aggregate status.
pub fn refresh(evaluator: &RuleEvaluator, workflow: &mut Workflow, at: DateTime<Utc>) {
    NodeScheduler::refresh_ready(&mut workflow.dag, at);
    let applicable = evaluator.applicable_rules(
        &workflow.rules,
        &EvaluationContext {
            dag: &workflow.dag,
            context: &workflow.context,
            at,
        },
    );
    workflow.applicable = applicable;
    workflow.status = status::recompute(workflow);
}
