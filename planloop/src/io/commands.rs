//! Post-apply commands run in the workspace after each successful agent call.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::error::PostApplyCommandError;
use crate::io::config::PostApplyCommand;
use crate::io::output::Output;
use crate::io::process::run_command_with_timeout;

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Pass,
    Fail,
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub title: String,
    /// Shell source, run with `sh -c`.
    pub command: String,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl CommandRequest {
    pub fn from_config(command: &PostApplyCommand, workspace: &Path) -> Self {
        let workdir = match &command.workdir {
            Some(dir) => workspace.join(dir),
            None => workspace.to_path_buf(),
        };
        Self {
            title: command.title.clone(),
            command: command.command.clone(),
            workdir,
            env: command.env.clone(),
            timeout: Duration::from_secs(command.timeout_secs),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandReport {
    pub outcome: CommandOutcome,
    /// Combined stdout and stderr.
    pub output: String,
    /// `None` when the process was killed or ended by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

pub trait CommandRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandReport>;
}

/// Runs commands through `sh -c`.
pub struct ShellCommandRunner;

impl CommandRunner for ShellCommandRunner {
    #[instrument(skip_all, fields(title = %request.title))]
    fn run(&self, request: &CommandRequest) -> Result<CommandReport> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&request.workdir)
            .envs(&request.env);
        let output = run_command_with_timeout(cmd, None, request.timeout, request.output_limit_bytes)
            .with_context(|| format!("run post-apply command '{}'", request.title))?;

        let mut combined = output.stdout_lossy();
        combined.push_str(&output.stderr_lossy());
        let outcome = if output.status.success() && !output.timed_out {
            CommandOutcome::Pass
        } else {
            CommandOutcome::Fail
        };
        Ok(CommandReport {
            outcome,
            output: combined,
            exit_code: output.status.code(),
            timed_out: output.timed_out,
        })
    }
}

/// Result of one configured command, for the execution summary.
#[derive(Debug, Clone)]
pub struct PostApplyResult {
    pub title: String,
    pub command: String,
    pub outcome: CommandOutcome,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub allowed_failure: bool,
}

impl PostApplyResult {
    pub fn passed(&self) -> bool {
        self.outcome == CommandOutcome::Pass
    }

    pub fn exit_status(&self) -> String {
        match self.exit_code {
            Some(code) => code.to_string(),
            None if self.timed_out => "timed out".to_string(),
            None => "killed".to_string(),
        }
    }
}

/// Run every configured command in order, handing each result to `record`
/// as soon as it is known.
///
/// A failing command without `allow_failure` stops the run with
/// [`PostApplyCommandError`]; later commands are not started. The failing
/// command is still recorded.
pub fn run_post_apply_commands(
    commands: &[PostApplyCommand],
    workspace: &Path,
    runner: &dyn CommandRunner,
    output: &Output,
    mut record: impl FnMut(&PostApplyResult),
) -> Result<Vec<PostApplyResult>> {
    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        output.log(&format!("Running post-apply command: {}", command.title));
        let request = CommandRequest::from_config(command, workspace);
        let report = runner.run(&request)?;
        let result = PostApplyResult {
            title: command.title.clone(),
            command: command.command.clone(),
            outcome: report.outcome,
            exit_code: report.exit_code,
            timed_out: report.timed_out,
            allowed_failure: command.allow_failure,
        };
        record(&result);
        results.push(result);

        match report.outcome {
            CommandOutcome::Pass => info!(title = %command.title, "post-apply command passed"),
            CommandOutcome::Fail if command.allow_failure => {
                warn!(title = %command.title, timed_out = report.timed_out, "post-apply command failed (allowed)");
                output.error_line(report.output.trim_end());
            }
            CommandOutcome::Fail => {
                warn!(title = %command.title, timed_out = report.timed_out, "post-apply command failed");
                output.error_line(report.output.trim_end());
                return Err(PostApplyCommandError {
                    title: command.title.clone(),
                }
                .into());
            }
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(title: &str, script: &str, allow_failure: bool) -> PostApplyCommand {
        PostApplyCommand {
            title: title.to_string(),
            command: script.to_string(),
            allow_failure,
            ..PostApplyCommand::default()
        }
    }

    #[test]
    fn shell_runner_uses_workdir_and_env() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = command("env", "printf \"$GREETING\" > out.txt", false);
        cfg.env.insert("GREETING".to_string(), "hi".to_string());

        let report = ShellCommandRunner
            .run(&CommandRequest::from_config(&cfg, temp.path()))
            .expect("run");
        assert_eq!(report.outcome, CommandOutcome::Pass);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("out.txt")).expect("read"),
            "hi"
        );
    }

    #[test]
    fn failing_command_stops_the_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let commands = vec![
            command("lint", "exit 3", false),
            command("never", "touch ran.txt", false),
        ];
        let mut recorded = Vec::new();
        let err = run_post_apply_commands(
            &commands,
            temp.path(),
            &ShellCommandRunner,
            &Output::buffer().0,
            |result| recorded.push(result.clone()),
        )
        .unwrap_err();
        let failed = err
            .downcast_ref::<PostApplyCommandError>()
            .expect("post-apply error");
        assert_eq!(failed.title, "lint");
        assert!(!temp.path().join("ran.txt").exists());
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].exit_code, Some(3));
        assert_eq!(recorded[0].exit_status(), "3");
    }

    #[test]
    fn allowed_failures_continue() {
        let temp = tempfile::tempdir().expect("tempdir");
        let commands = vec![
            command("flaky", "exit 1", true),
            command("after", "touch ran.txt", false),
        ];
        let results = run_post_apply_commands(
            &commands,
            temp.path(),
            &ShellCommandRunner,
            &Output::buffer().0,
            |_| {},
        )
        .expect("run");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].outcome, CommandOutcome::Fail);
        assert!(!results[0].passed());
        assert!(results[1].passed());
        assert!(temp.path().join("ran.txt").exists());
    }
}
