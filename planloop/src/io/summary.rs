//! Markdown execution summary written at the end of every agent run.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::failure::FailureDetails;
use crate::io::commands::PostApplyResult;
use crate::io::executor::tail;
use crate::io::git::Git;
use crate::io::prompt::collapse_blank_lines;
use crate::plan::Plan;

const SUMMARY_TEMPLATE: &str = include_str!("templates/summary.md");
const DETAIL_LIMIT_BYTES: usize = 2000;

/// One executor call as recorded in the summary.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub title: String,
    pub executor: String,
    pub success: bool,
    pub duration_secs: u64,
    /// Tail of the agent's reply on success, the error text on failure.
    pub detail: Option<String>,
}

/// One post-apply command as recorded in the summary.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub title: String,
    pub command: String,
    pub success: bool,
    pub allowed_failure: bool,
    pub exit_status: String,
}

impl From<&PostApplyResult> for CommandRecord {
    fn from(result: &PostApplyResult) -> Self {
        Self {
            title: result.title.clone(),
            command: result.command.clone(),
            success: result.passed(),
            allowed_failure: result.allowed_failure,
            exit_status: result.exit_status(),
        }
    }
}

/// Accumulates what happened during a run and renders it once at the end.
#[derive(Debug)]
pub struct SummaryCollector {
    plan_id: String,
    plan_title: String,
    mode: String,
    workspace: PathBuf,
    started_at: DateTime<Utc>,
    started: Instant,
    baseline: Option<String>,
    steps: Vec<StepRecord>,
    commands: Vec<CommandRecord>,
    error: Option<String>,
    failure: Option<FailureDetails>,
}

/// Timer for one step, finished with [`SummaryCollector::finish_step`].
#[derive(Debug)]
pub struct StepTimer {
    title: String,
    executor: String,
    started: Instant,
}

impl SummaryCollector {
    pub fn new(plan: &Plan, mode: &str, workspace: &Path) -> Self {
        let git = Git::new(workspace);
        let baseline = if git.is_repo() {
            git.head_sha().unwrap_or_else(|err| {
                warn!(err = %format!("{err:#}"), "could not read baseline commit");
                None
            })
        } else {
            None
        };
        Self {
            plan_id: plan.id.to_string(),
            plan_title: plan.display_title(),
            mode: mode.to_string(),
            workspace: workspace.to_path_buf(),
            started_at: Utc::now(),
            started: Instant::now(),
            baseline,
            steps: Vec::new(),
            commands: Vec::new(),
            error: None,
            failure: None,
        }
    }

    pub fn start_step(&self, title: impl Into<String>, executor: impl Into<String>) -> StepTimer {
        StepTimer {
            title: title.into(),
            executor: executor.into(),
            started: Instant::now(),
        }
    }

    /// Close the step. `detail` is cut to its last couple of kilobytes.
    pub fn finish_step(&mut self, timer: StepTimer, success: bool, detail: Option<&str>) {
        let detail = detail
            .map(|text| tail(text, DETAIL_LIMIT_BYTES).to_string())
            .filter(|text| !text.is_empty());
        self.steps.push(StepRecord {
            title: timer.title,
            executor: timer.executor,
            success,
            duration_secs: timer.started.elapsed().as_secs(),
            detail,
        });
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn record_command(&mut self, result: &PostApplyResult) {
        self.commands.push(CommandRecord::from(result));
    }

    pub fn commands(&self) -> &[CommandRecord] {
        &self.commands
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn record_failure(&mut self, details: FailureDetails) {
        self.failure = Some(details);
    }

    /// Render the summary with `outcome` as the final status line.
    pub fn render(&self, outcome: &str) -> Result<String> {
        let changed_files = self.changed_files();
        let mut env = Environment::new();
        env.add_template("summary", SUMMARY_TEMPLATE)
            .context("load summary template")?;
        let rendered = env
            .get_template("summary")
            .context("get summary template")?
            .render(context! {
                plan_id => &self.plan_id,
                plan_title => &self.plan_title,
                mode => &self.mode,
                outcome => outcome,
                workspace => self.workspace.display().to_string(),
                started_at => self.started_at.to_rfc3339(),
                ended_at => Utc::now().to_rfc3339(),
                duration_secs => self.started.elapsed().as_secs(),
                baseline => &self.baseline,
                steps => &self.steps,
                commands => &self.commands,
                failure => &self.failure,
                error => &self.error,
                changed_files => changed_files,
            })
            .context("render summary")?;
        let mut out = collapse_blank_lines(&rendered);
        out.push('\n');
        Ok(out)
    }

    /// Render and write to `<dir>/<plan-id>-<timestamp>.md`.
    pub fn write(&self, dir: &Path, outcome: &str) -> Result<(PathBuf, String)> {
        let rendered = self.render(outcome)?;
        fs::create_dir_all(dir).with_context(|| format!("create summary dir {}", dir.display()))?;
        let file_name = format!(
            "{}-{}.md",
            sanitize(&self.plan_id),
            self.started_at.format("%Y%m%d-%H%M%S")
        );
        let path = dir.join(file_name);
        fs::write(&path, &rendered).with_context(|| format!("write summary {}", path.display()))?;
        debug!(path = %path.display(), "summary written");
        Ok((path, rendered))
    }

    fn changed_files(&self) -> Vec<String> {
        let git = Git::new(&self.workspace);
        if !git.is_repo() {
            return Vec::new();
        }
        git.changed_files_since(self.baseline.as_deref())
            .unwrap_or_else(|err| {
                warn!(err = %format!("{err:#}"), "could not list changed files");
                Vec::new()
            })
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::commands::CommandOutcome;
    use crate::test_support::{plan_with_tasks, simple_task};

    #[test]
    fn renders_steps_failure_and_outcome() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = plan_with_tasks(4, vec![simple_task("Add parser", false)]);
        let mut summary = SummaryCollector::new(&plan, "serial", temp.path());
        let timer = summary.start_step("Task 1: Add parser", "codex");
        summary.finish_step(timer, false, Some("codex failed with status Some(1): boom"));
        summary.record_failure(FailureDetails {
            summary: "tests do not compile".to_string(),
            problems: "- missing trait impl".to_string(),
            ..FailureDetails::default()
        });

        let (path, rendered) = summary.write(&temp.path().join("summaries"), "failed").expect("write");
        assert!(path.file_name().expect("name").to_string_lossy().starts_with("4-"));
        assert_eq!(fs::read_to_string(&path).expect("read"), rendered);
        assert!(rendered.contains("- Outcome: failed"));
        assert!(rendered.contains("| 1 | Task 1: Add parser | codex | failed |"));
        assert!(rendered.contains("### 1. Task 1: Add parser"));
        assert!(rendered.contains("codex failed with status Some(1): boom"));
        assert!(rendered.contains("tests do not compile"));
        assert!(rendered.contains("### Problems"));
        assert!(!rendered.contains("### Requirements"));
    }

    #[test]
    fn empty_run_says_nothing_executed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = plan_with_tasks(1, vec![simple_task("a", false)]);
        let summary = SummaryCollector::new(&plan, "batch", temp.path());
        let rendered = summary.render("dry_run").expect("render");
        assert!(rendered.contains("No items were executed."));
        assert!(!rendered.contains("## Post-apply commands"));
        assert!(rendered.contains("None detected."));
    }

    #[test]
    fn long_detail_keeps_the_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = plan_with_tasks(2, vec![simple_task("a", false)]);
        let mut summary = SummaryCollector::new(&plan, "serial", temp.path());
        let reply = format!("{}final line", "x".repeat(5000));
        let timer = summary.start_step("Task 1: a", "claude-code");
        summary.finish_step(timer, true, Some(&reply));
        let timer = summary.start_step("Update documentation", "claude-code");
        summary.finish_step(timer, true, Some("  "));

        let steps = summary.steps();
        let detail = steps[0].detail.as_deref().expect("detail");
        assert!(detail.len() <= DETAIL_LIMIT_BYTES);
        assert!(detail.ends_with("final line"));
        assert_eq!(steps[1].detail, None);
    }

    #[test]
    fn renders_post_apply_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = plan_with_tasks(3, vec![simple_task("a", false)]);
        let mut summary = SummaryCollector::new(&plan, "batch", temp.path());
        summary.record_command(&PostApplyResult {
            title: "lint".to_string(),
            command: "cargo clippy".to_string(),
            outcome: CommandOutcome::Fail,
            exit_code: Some(101),
            timed_out: false,
            allowed_failure: true,
        });

        let rendered = summary.render("completed").expect("render");
        assert!(rendered.contains("## Post-apply commands"));
        assert!(rendered.contains("| lint | `cargo clippy` | failed (allowed) | 101 |"));
    }
}
