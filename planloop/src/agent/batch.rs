//! Batch mode: hand the executor every incomplete task at once.
//!
//! The executor marks tasks done in the plan file itself. After each call the
//! plan is re-read; remaining tasks go into the next call, up to
//! `batch_max_iterations` calls per run.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::agent::ExecutionOutcome;
use crate::agent::engine::{Completion, Engine};
use crate::core::actionable::get_all_incomplete_tasks;
use crate::core::state::EngineState;
use crate::io::config::DocsMode;
use crate::io::executor::ExecutionMode;

#[instrument(skip_all, fields(plan = %engine.plan_path.display()))]
pub(crate) fn run_batch(engine: &mut Engine<'_>) -> Result<ExecutionOutcome> {
    let max_iterations = engine.options.batch_max_iterations;
    let mut iteration = 0u32;
    loop {
        let plan = engine.load_plan()?;
        let incomplete = get_all_incomplete_tasks(&plan);
        if incomplete.is_empty() {
            match engine.complete_plan()? {
                Completion::Finished => {
                    engine.advance(EngineState::Completed)?;
                    return Ok(ExecutionOutcome::Completed);
                }
                Completion::Continue => continue,
                Completion::ReviewDeclined => return Ok(ExecutionOutcome::ReviewDeclined),
            }
        }
        if iteration >= max_iterations {
            warn!(iteration, remaining = incomplete.len(), "batch iteration limit reached");
            engine.output.log(&format!(
                "Stopping after {iteration} batch iteration(s); {} task(s) remain.",
                incomplete.len()
            ));
            return Ok(ExecutionOutcome::IterationLimitReached {
                iterations: iteration,
            });
        }
        iteration += 1;

        let remaining = incomplete.len();
        let prompt = engine
            .prompts
            .batch_prompt(&plan, engine.plan_path, &incomplete)?;
        engine.advance(EngineState::TaskExecuting)?;
        engine.execute(
            &format!("Batch {iteration}: {remaining} task(s)"),
            &prompt,
            ExecutionMode::Batch,
            &plan,
        )?;
        engine.run_post_apply()?;
        engine.update_docs(DocsMode::AfterIteration);

        engine.advance(EngineState::MarkingDone)?;
        let after = engine.store.read(engine.plan_path)?;
        let left = get_all_incomplete_tasks(&after).len();
        let finished = remaining.saturating_sub(left);
        info!(iteration, finished, left, "batch iteration finished");
        engine.output.log(&format!(
            "Batch {iteration}: {finished} task(s) done, {left} remaining."
        ));
        if finished > 0 {
            engine.commit_plan(&format!(
                "plan {}: {finished} task(s) done in batch {iteration}",
                after.id
            ))?;
        }
        engine.advance(EngineState::Looping)?;
    }
}
