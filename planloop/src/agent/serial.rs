//! Serial mode: one actionable item per executor call.

use anyhow::Result;
use tracing::{info, instrument};

use crate::agent::ExecutionOutcome;
use crate::agent::engine::{Completion, Engine};
use crate::core::actionable::{ActionableItem, find_next_actionable_item};
use crate::core::state::EngineState;
use crate::io::config::DocsMode;
use crate::io::executor::ExecutionMode;
use crate::io::mark_done::{MarkStepOptions, mark_step_done, mark_task_done};
use crate::plan::Plan;

/// Work through the plan item by item until it completes, fails or hits
/// `max_steps`. The limit is only checked between items.
#[instrument(skip_all, fields(plan = %engine.plan_path.display()))]
pub(crate) fn run_serial(engine: &mut Engine<'_>) -> Result<ExecutionOutcome> {
    let mut items_run = 0u32;
    loop {
        let plan = engine.load_plan()?;
        let Some(item) = find_next_actionable_item(&plan) else {
            match engine.complete_plan()? {
                Completion::Finished => {
                    engine.advance(EngineState::Completed)?;
                    return Ok(ExecutionOutcome::Completed);
                }
                Completion::Continue => continue,
                Completion::ReviewDeclined => return Ok(ExecutionOutcome::ReviewDeclined),
            }
        };
        if let Some(max) = engine.options.max_steps
            && items_run >= max
        {
            info!(items_run, "step limit reached");
            engine
                .output
                .log(&format!("Stopping after {items_run} step(s) as requested."));
            return Ok(ExecutionOutcome::StepLimitReached { steps: items_run });
        }

        let title = item_title(&plan, item);
        let prompt = engine.prompts.item_prompt(&plan, engine.plan_path, item)?;
        let (state, mode) = match item {
            ActionableItem::Step { .. } => (EngineState::StepExecuting, ExecutionMode::Normal),
            ActionableItem::Task { .. } => (EngineState::TaskExecuting, ExecutionMode::Simple),
        };
        engine.advance(state)?;
        engine.execute(&title, &prompt, mode, &plan)?;
        engine.run_post_apply()?;
        engine.update_docs(DocsMode::AfterIteration);

        engine.advance(EngineState::MarkingDone)?;
        let opts = MarkStepOptions {
            steps: 1,
            commit: engine.options.commit,
        };
        let marked = match item {
            ActionableItem::Step { .. } => {
                mark_step_done(engine.store, engine.plan_path, opts, Some(item), engine.base_dir)?
            }
            ActionableItem::Task { task_index } => {
                mark_task_done(engine.store, engine.plan_path, task_index, opts, engine.base_dir)?
            }
        };
        items_run += 1;
        engine.output.log(&marked.message);

        if marked.plan_complete {
            match engine.complete_plan()? {
                Completion::Finished => {
                    engine.advance(EngineState::Completed)?;
                    return Ok(ExecutionOutcome::Completed);
                }
                Completion::Continue => {}
                Completion::ReviewDeclined => return Ok(ExecutionOutcome::ReviewDeclined),
            }
        }
        engine.advance(EngineState::Looping)?;
    }
}

fn item_title(plan: &Plan, item: ActionableItem) -> String {
    let task_number = item.task_index() + 1;
    let task_title = plan
        .tasks
        .get(item.task_index())
        .map(|task| task.title.as_str())
        .unwrap_or_default();
    match item {
        ActionableItem::Task { .. } => format!("Task {task_number}: {task_title}"),
        ActionableItem::Step { step_index, .. } => {
            format!("Task {task_number} step {}: {task_title}", step_index + 1)
        }
    }
}
