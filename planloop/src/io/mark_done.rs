//! Recording progress in plan files.
//!
//! Every operation re-reads the plan from disk before changing it, so callers
//! may hold a stale copy.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::actionable::{ActionableItem, find_next_actionable_item};
use crate::io::git::Git;
use crate::io::plan_store::PlanStore;
use crate::plan::{Plan, PlanId, PlanStatus};

#[derive(Debug, Clone, Copy)]
pub struct MarkStepOptions {
    /// How many consecutive steps of the task to mark, starting at the target.
    pub steps: usize,
    /// Commit the plan file afterwards.
    pub commit: bool,
}

impl Default for MarkStepOptions {
    fn default() -> Self {
        Self {
            steps: 1,
            commit: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkDoneOutcome {
    pub plan_complete: bool,
    pub message: String,
}

/// Mark `target` (or the next actionable item) done.
#[instrument(skip_all, fields(plan = %plan_path.display()))]
pub fn mark_step_done(
    store: &PlanStore,
    plan_path: &Path,
    opts: MarkStepOptions,
    target: Option<ActionableItem>,
    base_dir: &Path,
) -> Result<MarkDoneOutcome> {
    let mut plan = store.read(plan_path)?;
    let Some(item) = target.or_else(|| find_next_actionable_item(&plan)) else {
        return Ok(MarkDoneOutcome {
            plan_complete: plan.all_tasks_done(),
            message: format!("plan {} has no incomplete items", plan.id),
        });
    };

    let message = match item {
        ActionableItem::Task { task_index } => complete_task(&mut plan, task_index)?,
        ActionableItem::Step {
            task_index,
            step_index,
        } => {
            let task = plan
                .tasks
                .get_mut(task_index)
                .ok_or_else(|| anyhow!("task {} not in plan", task_index + 1))?;
            if step_index >= task.steps.len() {
                return Err(anyhow!(
                    "step {} not in task {}",
                    step_index + 1,
                    task_index + 1
                ));
            }
            let end = (step_index + opts.steps.max(1)).min(task.steps.len());
            for step in &mut task.steps[step_index..end] {
                step.done = true;
            }
            if task.steps.iter().all(|s| s.done) {
                task.done = true;
            }
            if end - step_index == 1 {
                format!("marked task {} step {} done", task_index + 1, step_index + 1)
            } else {
                format!(
                    "marked task {} steps {}-{} done",
                    task_index + 1,
                    step_index + 1,
                    end
                )
            }
        }
    };

    finish(store, plan_path, plan, opts.commit, base_dir, message)
}

/// Mark a whole task (and all its steps) done.
#[instrument(skip_all, fields(plan = %plan_path.display(), task_index))]
pub fn mark_task_done(
    store: &PlanStore,
    plan_path: &Path,
    task_index: usize,
    opts: MarkStepOptions,
    base_dir: &Path,
) -> Result<MarkDoneOutcome> {
    let mut plan = store.read(plan_path)?;
    let message = complete_task(&mut plan, task_index)?;
    finish(store, plan_path, plan, opts.commit, base_dir, message)
}

/// Set a plan's status directly (used for stubs and in-progress transitions).
pub fn set_plan_status(store: &PlanStore, plan_path: &Path, status: PlanStatus) -> Result<Plan> {
    let mut plan = store.read(plan_path)?;
    if plan.status == status {
        return Ok(plan);
    }
    debug!(plan = %plan.id, from = %plan.status, to = %status, "plan status change");
    plan.status = status;
    store.write(plan_path, &mut plan)?;
    if status == PlanStatus::Done {
        complete_parents(store, &plan)?;
    }
    Ok(plan)
}

fn complete_task(plan: &mut Plan, task_index: usize) -> Result<String> {
    let task = plan
        .tasks
        .get_mut(task_index)
        .ok_or_else(|| anyhow!("task {} not in plan {}", task_index + 1, plan.id))?;
    task.done = true;
    for step in &mut task.steps {
        step.done = true;
    }
    Ok(format!("marked task {} done: {}", task_index + 1, task.title))
}

fn finish(
    store: &PlanStore,
    plan_path: &Path,
    mut plan: Plan,
    commit: bool,
    base_dir: &Path,
    message: String,
) -> Result<MarkDoneOutcome> {
    let plan_complete = plan.all_tasks_done();
    plan.status = if plan_complete {
        PlanStatus::Done
    } else {
        PlanStatus::InProgress
    };
    store.write(plan_path, &mut plan)?;
    info!(plan = %plan.id, plan_complete, "{message}");

    if plan_complete {
        complete_parents(store, &plan)?;
    }
    if commit {
        let git = Git::new(base_dir);
        let committed = git
            .commit_paths(&[plan_path], &format!("plan {}: {message}", plan.id))
            .context("commit plan progress")?;
        debug!(committed, "plan progress commit");
    }

    Ok(MarkDoneOutcome {
        plan_complete,
        message,
    })
}

/// Walk up the parent chain, marking each parent done once all its children
/// are done or cancelled.
fn complete_parents(store: &PlanStore, plan: &Plan) -> Result<()> {
    let mut seen: HashSet<PlanId> = HashSet::from([plan.id.clone()]);
    let mut next = plan.parent.clone();

    while let Some(parent_id) = next.take() {
        if !seen.insert(parent_id.clone()) {
            warn!(plan = %parent_id, "parent cycle detected, stopping");
            break;
        }
        let index = store.index()?;
        let Some(parent) = index.get(&parent_id) else {
            warn!(plan = %plan.id, parent = %parent_id, "parent plan not found");
            break;
        };
        if parent.plan.status == PlanStatus::Done {
            break;
        }
        let all_children_finished = index
            .children_of(&parent_id)
            .all(|child| matches!(child.plan.status, PlanStatus::Done | PlanStatus::Cancelled));
        if !all_children_finished || !parent.plan.all_tasks_done() {
            break;
        }

        let path = parent.path.clone();
        let mut parent_plan = parent.plan.clone();
        parent_plan.status = PlanStatus::Done;
        store.write(&path, &mut parent_plan)?;
        info!(plan = %parent_id, "all child plans finished, parent marked done");
        next = parent_plan.parent.clone();
    }
    Ok(())
}
