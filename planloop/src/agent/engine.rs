//! Shared machinery of the serial, batch and stub execution paths.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::agent::{AgentOptions, AgentServices, ExecutionOutcome, RunMode, batch, serial};
use crate::core::state::{EngineState, StateTracker};
use crate::error::ExecutorFailedError;
use crate::io::commands::{CommandRunner, run_post_apply_commands};
use crate::io::config::DocsMode;
use crate::io::executor::{
    CaptureOutput, ExecutionContext, ExecutionMode, Executor, ExecutorOutput, is_success,
};
use crate::io::git::Git;
use crate::io::mark_done::set_plan_status;
use crate::io::output::Output;
use crate::io::plan_store::PlanStore;
use crate::io::prompt::PromptBuilder;
use crate::io::prompter::Prompter;
use crate::io::summary::SummaryCollector;
use crate::plan::{Plan, PlanId, PlanStatus};

/// What happened after a plan ran out of incomplete tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    Finished,
    /// Final review appended tasks and the user chose to keep going.
    Continue,
    ReviewDeclined,
}

/// One engine run over one plan file. Owns the summary and the state tracker.
pub(crate) struct Engine<'a> {
    pub(crate) store: &'a PlanStore,
    pub(crate) plan_path: &'a Path,
    pub(crate) workspace: &'a Path,
    /// Repository holding the plan file; commits go here.
    pub(crate) base_dir: &'a Path,
    pub(crate) options: &'a AgentOptions,
    pub(crate) prompts: PromptBuilder,
    pub(crate) output: &'a Output,
    executor: &'a dyn Executor,
    commands: &'a dyn CommandRunner,
    prompter: &'a dyn Prompter,
    env: Vec<(String, String)>,
    summary: SummaryCollector,
    tracker: StateTracker,
    executor_calls: u32,
    parent_touched: bool,
    review_ran: bool,
}

pub(crate) struct EngineParts<'a> {
    pub store: &'a PlanStore,
    pub plan_path: &'a Path,
    pub workspace: &'a Path,
    pub base_dir: &'a Path,
    pub options: &'a AgentOptions,
    pub prompts: PromptBuilder,
    pub env: Vec<(String, String)>,
    pub summary: SummaryCollector,
}

impl<'a> Engine<'a> {
    pub(crate) fn new(parts: EngineParts<'a>, services: &'a AgentServices<'a>) -> Self {
        Self {
            store: parts.store,
            plan_path: parts.plan_path,
            workspace: parts.workspace,
            base_dir: parts.base_dir,
            options: parts.options,
            prompts: parts.prompts,
            output: &services.output,
            executor: services.executor,
            commands: services.commands,
            prompter: &*services.prompter,
            env: parts.env,
            summary: parts.summary,
            tracker: StateTracker::default(),
            executor_calls: 0,
            parent_touched: false,
            review_ran: false,
        }
    }

    pub(crate) fn executor_calls(&self) -> u32 {
        self.executor_calls
    }

    pub(crate) fn into_summary(self) -> SummaryCollector {
        self.summary
    }

    /// Drive the plan to a terminal outcome. Errors are fatal to the run.
    pub(crate) fn run(&mut self) -> Result<ExecutionOutcome> {
        self.advance(EngineState::WorkspaceAcquired)?;
        self.advance(EngineState::Looping)?;

        let plan = self.store.read(self.plan_path)?;
        if plan.status == PlanStatus::Done && plan.all_tasks_done() {
            self.output
                .log(&format!("Plan {} is already done.", plan.id));
            self.advance(EngineState::Completed)?;
            return Ok(ExecutionOutcome::Completed);
        }
        if plan.is_stub() {
            return self.run_stub();
        }
        match self.options.mode {
            RunMode::Batch => batch::run_batch(self),
            RunMode::Serial => serial::run_serial(self),
        }
    }

    /// Record the failure transition; the caller already holds the error.
    pub(crate) fn fail(&mut self) {
        if let Err(err) = self.advance(EngineState::Failed) {
            debug!(err = %format!("{err:#}"), "engine already terminal");
        }
    }

    pub(crate) fn advance(&mut self, to: EngineState) -> Result<()> {
        let from = self.tracker.current();
        self.tracker.advance(to).map_err(|err| anyhow!(err))?;
        debug!(%from, %to, "engine state");
        Ok(())
    }

    /// Fresh read of the plan. The first touch moves a pending plan to
    /// `in_progress`; once per run the parent follows unless it already is.
    pub(crate) fn load_plan(&mut self) -> Result<Plan> {
        let mut plan = self.store.read(self.plan_path)?;
        if plan.status == PlanStatus::Pending {
            plan = set_plan_status(self.store, self.plan_path, PlanStatus::InProgress)?;
            info!(plan = %plan.id, "plan started");
        }
        if !self.parent_touched {
            self.parent_touched = true;
            if let Some(parent) = &plan.parent {
                self.start_parent(parent)?;
            }
        }
        Ok(plan)
    }

    fn start_parent(&self, parent_id: &PlanId) -> Result<()> {
        let index = self.store.index()?;
        let Some(parent) = index.get(parent_id) else {
            warn!(parent = %parent_id, "parent plan not found, not marking it in progress");
            return Ok(());
        };
        if parent.plan.status == PlanStatus::InProgress {
            return Ok(());
        }
        set_plan_status(self.store, &parent.path, PlanStatus::InProgress)?;
        info!(parent = %parent_id, from = %parent.plan.status, "parent plan marked in progress");
        Ok(())
    }

    /// One executor call. A soft failure becomes [`ExecutorFailedError`].
    pub(crate) fn execute(
        &mut self,
        title: &str,
        prompt: &str,
        mode: ExecutionMode,
        plan: &Plan,
    ) -> Result<Option<ExecutorOutput>> {
        self.output.log(&format!("\n=== {title} ==="));
        let ctx = ExecutionContext {
            plan_id: plan.id.clone(),
            plan_title: plan.display_title(),
            plan_file_path: self.plan_path.to_path_buf(),
            workdir: self.workspace.to_path_buf(),
            mode,
            capture: CaptureOutput::Result,
            env: self.env.clone(),
        };
        let name = self.executor.name().to_string();
        let timer = self.summary.start_step(title, name.as_str());
        self.executor_calls += 1;

        match self.executor.execute(prompt, &ctx) {
            Err(err) => {
                let err = err.context(format!("{name} failed on '{title}'"));
                self.summary
                    .finish_step(timer, false, Some(&format!("{err:#}")));
                Err(err)
            }
            Ok(output) if !is_success(output.as_ref()) => {
                let details = output
                    .and_then(|output| output.failure_details)
                    .unwrap_or_default();
                self.summary
                    .finish_step(timer, false, Some(&details.summary));
                Err(ExecutorFailedError {
                    executor: name,
                    details,
                }
                .into())
            }
            Ok(output) => {
                let reply = output.as_ref().and_then(|output| output.content.as_deref());
                self.summary.finish_step(timer, true, reply);
                Ok(output)
            }
        }
    }

    pub(crate) fn run_post_apply(&mut self) -> Result<()> {
        if self.options.post_apply_commands.is_empty() {
            return Ok(());
        }
        let summary = &mut self.summary;
        run_post_apply_commands(
            &self.options.post_apply_commands,
            self.workspace,
            self.commands,
            self.output,
            |result| summary.record_command(result),
        )?;
        Ok(())
    }

    /// Documentation pass; failures are logged and never stop the run.
    pub(crate) fn update_docs(&mut self, when: DocsMode) {
        if self.options.update_docs != when || when == DocsMode::Never {
            return;
        }
        let attempt = (|| -> Result<()> {
            let plan = self.store.read(self.plan_path)?;
            let prompt = self.prompts.docs_prompt(&plan, self.plan_path)?;
            self.execute("Update documentation", &prompt, ExecutionMode::Docs, &plan)?;
            Ok(())
        })();
        if let Err(err) = attempt {
            warn!(err = %format!("{err:#}"), "documentation update failed");
            self.output.error_line(&format!("Documentation update failed: {err:#}"));
        }
    }

    fn capture_lessons(&mut self) {
        let attempt = (|| -> Result<()> {
            let plan = self.store.read(self.plan_path)?;
            let prompt = self.prompts.lessons_prompt(&plan, self.plan_path)?;
            self.execute("Record lessons learned", &prompt, ExecutionMode::Lessons, &plan)?;
            Ok(())
        })();
        if let Err(err) = attempt {
            warn!(err = %format!("{err:#}"), "lessons learned failed");
            self.output.error_line(&format!("Lessons learned failed: {err:#}"));
        }
    }

    /// Commit the plan file when `commit` is enabled.
    pub(crate) fn commit_plan(&self, message: &str) -> Result<()> {
        if !self.options.commit {
            return Ok(());
        }
        let committed = Git::new(self.base_dir)
            .commit_paths(&[self.plan_path], message)
            .context("commit plan progress")?;
        debug!(committed, "plan commit");
        Ok(())
    }

    /// Every task is done: force the status, then run the completion passes.
    pub(crate) fn complete_plan(&mut self) -> Result<Completion> {
        let plan = self.store.read(self.plan_path)?;
        if plan.status != PlanStatus::Done {
            set_plan_status(self.store, self.plan_path, PlanStatus::Done)?;
            self.commit_plan(&format!("plan {}: done", plan.id))?;
        }
        self.output
            .log(&format!("Plan {} complete: {}", plan.id, plan.display_title()));
        self.update_docs(DocsMode::AfterCompletion);

        if self.options.final_review && !self.review_ran && !plan.is_stub() {
            self.review_ran = true;
            let verdict = self.final_review()?;
            if verdict != Completion::Finished {
                return Ok(verdict);
            }
        }
        if self.options.lessons {
            self.capture_lessons();
        }
        Ok(Completion::Finished)
    }

    fn final_review(&mut self) -> Result<Completion> {
        let plan = self.store.read(self.plan_path)?;
        let before = plan.tasks.len();
        let prompt = self.prompts.review_prompt(&plan, self.plan_path)?;
        self.execute("Final review", &prompt, ExecutionMode::Review, &plan)?;

        let reviewed = self.store.read(self.plan_path)?;
        let added = reviewed.tasks.len().saturating_sub(before);
        if added == 0 || reviewed.all_tasks_done() {
            return Ok(Completion::Finished);
        }
        info!(plan = %reviewed.id, added, "final review appended tasks");
        let question = format!(
            "Final review added {added} task(s) to plan {}. Continue with them?",
            reviewed.id
        );
        if self.prompter.confirm(&question, true)? {
            if reviewed.status != PlanStatus::InProgress {
                set_plan_status(self.store, self.plan_path, PlanStatus::InProgress)?;
            }
            Ok(Completion::Continue)
        } else {
            self.output.log("Stopping; the new tasks stay open in the plan file.");
            Ok(Completion::ReviewDeclined)
        }
    }

    /// A plan without tasks runs as a single direct call.
    fn run_stub(&mut self) -> Result<ExecutionOutcome> {
        let plan = self.load_plan()?;
        let prompt = self.prompts.stub_prompt(&plan, self.plan_path)?;
        self.advance(EngineState::TaskExecuting)?;
        self.execute(
            &format!("Plan {}: {}", plan.id, plan.display_title()),
            &prompt,
            ExecutionMode::Simple,
            &plan,
        )?;
        self.run_post_apply()?;
        self.advance(EngineState::MarkingDone)?;
        self.complete_plan()?;
        self.advance(EngineState::Completed)?;
        Ok(ExecutionOutcome::Completed)
    }
}
