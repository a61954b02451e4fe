//! Deterministic selection of the next unit of work within one plan.

use crate::plan::{Plan, Task};

/// The next task or step eligible for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionableItem {
    /// A simple task (no steps) executed as one unit.
    Task { task_index: usize },
    /// The first incomplete step of a task with a step breakdown.
    Step { task_index: usize, step_index: usize },
}

impl ActionableItem {
    pub fn task_index(&self) -> usize {
        match self {
            ActionableItem::Task { task_index } | ActionableItem::Step { task_index, .. } => {
                *task_index
            }
        }
    }
}

/// Find the first incomplete task in declaration order and, if it has steps,
/// its first incomplete step.
///
/// Returns `None` when every task is done. A task flagged incomplete whose steps
/// are all done is offered as a `Task` item so it can still be closed out.
pub fn find_next_actionable_item(plan: &Plan) -> Option<ActionableItem> {
    let (task_index, task) = plan
        .tasks
        .iter()
        .enumerate()
        .find(|(_, task)| !task.done)?;

    if task.is_simple() {
        return Some(ActionableItem::Task { task_index });
    }

    match task.steps.iter().position(|step| !step.done) {
        Some(step_index) => Some(ActionableItem::Step {
            task_index,
            step_index,
        }),
        None => Some(ActionableItem::Task { task_index }),
    }
}

/// An incomplete task together with its position in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncompleteTask<'a> {
    pub task_index: usize,
    pub task: &'a Task,
}

/// All not-done tasks, in plan order.
pub fn get_all_incomplete_tasks(plan: &Plan) -> Vec<IncompleteTask<'_>> {
    plan.tasks
        .iter()
        .enumerate()
        .filter(|(_, task)| !task.done)
        .map(|(task_index, task)| IncompleteTask { task_index, task })
        .collect()
}
