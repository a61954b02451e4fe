//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::plan::{Plan, PlanStatus};

/// Check semantic invariants of a single plan:
/// - A plan never depends on or parents itself
/// - Dependencies are listed once
/// - Task titles are non-empty and step prompts are non-empty
/// - A `done` plan has no incomplete tasks
pub fn validate_plan_invariants(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    let id = &plan.id;

    if plan.parent.as_ref() == Some(id) {
        errors.push(format!("plan {id}: parent must not be the plan itself"));
    }

    let mut seen = HashSet::new();
    for dep in &plan.dependencies {
        if dep == id {
            errors.push(format!("plan {id}: must not depend on itself"));
        }
        if !seen.insert(dep) {
            errors.push(format!("plan {id}: duplicate dependency {dep}"));
        }
    }

    for (task_index, task) in plan.tasks.iter().enumerate() {
        let path = format!("plan {id} task {}", task_index + 1);
        if task.title.trim().is_empty() {
            errors.push(format!("{path}: title must not be empty"));
        }
        for (step_index, step) in task.steps.iter().enumerate() {
            if step.prompt.trim().is_empty() {
                errors.push(format!("{path} step {}: prompt must not be empty", step_index + 1));
            }
        }
    }

    if plan.status == PlanStatus::Done && !plan.tasks.is_empty() && !plan.all_tasks_done() {
        errors.push(format!("plan {id}: status is done but tasks remain incomplete"));
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanId;
    use crate::test_support::{plan_with_tasks, simple_task, stepped_task};

    #[test]
    fn reports_self_references_and_duplicates() {
        let mut plan = plan_with_tasks(3, vec![simple_task("a", false)]);
        plan.parent = Some(PlanId::Num(3));
        plan.dependencies = vec![PlanId::Num(3), PlanId::Num(1), PlanId::Num(1)];

        let errors = validate_plan_invariants(&plan);
        assert!(errors.iter().any(|e| e.contains("parent must not be the plan itself")));
        assert!(errors.iter().any(|e| e.contains("must not depend on itself")));
        assert!(errors.iter().any(|e| e.contains("duplicate dependency 1")));
    }

    #[test]
    fn done_plan_with_open_tasks_is_rejected() {
        let mut plan = plan_with_tasks(1, vec![stepped_task("a", false, &[false])]);
        plan.status = PlanStatus::Done;
        let errors = validate_plan_invariants(&plan);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("tasks remain incomplete"));
    }

    #[test]
    fn well_formed_plan_has_no_errors() {
        let plan = plan_with_tasks(1, vec![simple_task("a", true), stepped_task("b", false, &[true, false])]);
        assert!(validate_plan_invariants(&plan).is_empty());
    }
}
