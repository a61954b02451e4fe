//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples the execution loops from the agent backend
//! (`claude` or `codex`). Tests use scripted executors that return
//! predetermined outputs without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::failure::{FailureDetails, parse_failure_report};
use crate::io::config::ExecutorConfig;
use crate::io::output::Output;
use crate::io::process::{CommandOutput, ProcessLimits, StreamSource, run_command_streaming};
use crate::plan::PlanId;

/// Why the executor is being called; shapes prompts and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Normal,
    Simple,
    Batch,
    Review,
    Docs,
    Lessons,
}

/// How much of the agent's output to hand back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaptureOutput {
    #[default]
    None,
    /// The final message only.
    Result,
    /// Every assistant message.
    All,
}

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub plan_id: PlanId,
    pub plan_title: String,
    pub plan_file_path: PathBuf,
    /// Working directory of the agent (the workspace).
    pub workdir: PathBuf,
    pub mode: ExecutionMode,
    pub capture: CaptureOutput,
    /// Extra environment for the agent process, e.g. the tunnel socket.
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorOutput {
    pub success: Option<bool>,
    pub content: Option<String>,
    pub failure_details: Option<FailureDetails>,
}

impl ExecutorOutput {
    pub fn succeeded(content: Option<String>) -> Self {
        Self {
            success: Some(true),
            content,
            failure_details: None,
        }
    }

    pub fn failed(details: FailureDetails) -> Self {
        Self {
            success: Some(false),
            content: None,
            failure_details: Some(details),
        }
    }
}

/// Missing output and `success: None` both count as success.
pub fn is_success(output: Option<&ExecutorOutput>) -> bool {
    output.is_none_or(|output| output.success != Some(false))
}

/// Abstraction over agent execution backends.
pub trait Executor {
    fn name(&self) -> &str;

    /// Run the agent on `prompt`. `Err` means no structured result was obtained
    /// (spawn failure, crash, timeout without a result).
    fn execute(&self, prompt: &str, ctx: &ExecutionContext) -> Result<Option<ExecutorOutput>>;
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub model: Option<String>,
    pub timeout: Duration,
    pub inactivity_timeout: Option<Duration>,
    pub output_limit_bytes: usize,
}

impl ExecutorSettings {
    pub fn from_config(config: &ExecutorConfig, model_override: Option<String>) -> Self {
        Self {
            model: model_override.or_else(|| config.model.clone()),
            timeout: Duration::from_secs(config.timeout_secs),
            inactivity_timeout: (config.inactivity_timeout_secs > 0)
                .then(|| Duration::from_secs(config.inactivity_timeout_secs)),
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    fn limits(&self) -> ProcessLimits {
        ProcessLimits {
            timeout: self.timeout,
            inactivity_timeout: self.inactivity_timeout,
            output_limit_bytes: self.output_limit_bytes,
        }
    }
}

pub const CLAUDE_CODE: &str = "claude-code";
pub const CODEX: &str = "codex";

/// Select an executor backend by name.
pub fn build_executor(
    name: &str,
    settings: ExecutorSettings,
    output: Output,
) -> Result<Box<dyn Executor>> {
    match name {
        CLAUDE_CODE | "claude" => Ok(Box::new(ClaudeCodeExecutor::new(settings, output))),
        CODEX | "codex-cli" => Ok(Box::new(CodexExecutor::new(settings, output))),
        other => bail!("unknown executor '{other}' (expected {CLAUDE_CODE} or {CODEX})"),
    }
}

/// Final result event seen on the agent's stream.
#[derive(Debug, Clone, PartialEq)]
struct ResultSignal {
    success: bool,
    text: String,
}

/// Executor that spawns `claude --print` with stream-json output.
pub struct ClaudeCodeExecutor {
    settings: ExecutorSettings,
    output: Output,
    program: PathBuf,
}

impl ClaudeCodeExecutor {
    pub fn new(settings: ExecutorSettings, output: Output) -> Self {
        Self {
            settings,
            output,
            program: PathBuf::from("claude"),
        }
    }

    /// Use a different binary (tests, wrappers).
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

impl Executor for ClaudeCodeExecutor {
    fn name(&self) -> &str {
        CLAUDE_CODE
    }

    #[instrument(skip_all, fields(plan = %ctx.plan_id, mode = ?ctx.mode))]
    fn execute(&self, prompt: &str, ctx: &ExecutionContext) -> Result<Option<ExecutorOutput>> {
        info!(workdir = %ctx.workdir.display(), "starting claude");
        let mut cmd = Command::new(&self.program);
        cmd.arg("--print")
            .arg("--verbose")
            .arg("--output-format")
            .arg("stream-json");
        if let Some(model) = &self.settings.model {
            cmd.arg("--model").arg(model);
        }
        cmd.current_dir(&ctx.workdir)
            .envs(ctx.env.iter().map(|(k, v)| (k, v)));

        let mut last_result: Option<ResultSignal> = None;
        let mut transcript = String::new();
        let output = &self.output;
        let run = run_command_streaming(
            cmd,
            Some(prompt.as_bytes()),
            self.settings.limits(),
            &mut |source, line| match source {
                StreamSource::Stdout => {
                    handle_claude_line(line, output, &mut transcript, &mut last_result);
                }
                StreamSource::Stderr => debug!(line, "claude stderr"),
            },
        )
        .context("run claude")?;

        finish_run("claude", &run, last_result, transcript, ctx.capture)
    }
}

fn handle_claude_line(
    line: &str,
    output: &Output,
    transcript: &mut String,
    last_result: &mut Option<ResultSignal>,
) {
    let Ok(event) = serde_json::from_str::<Value>(line) else {
        if !line.trim().is_empty() {
            output.line(line);
        }
        return;
    };
    match event.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            let blocks = event
                .pointer("/message/content")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for block in blocks {
                if block.get("type").and_then(Value::as_str) == Some("text")
                    && let Some(text) = block.get("text").and_then(Value::as_str)
                {
                    output.line(text);
                    transcript.push_str(text);
                    transcript.push('\n');
                }
            }
        }
        Some("result") => {
            let is_error = event
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let subtype_ok = event
                .get("subtype")
                .and_then(Value::as_str)
                .is_none_or(|subtype| subtype == "success");
            let text = event
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            *last_result = Some(ResultSignal {
                success: subtype_ok && !is_error,
                text,
            });
        }
        _ => {}
    }
}

/// Executor that spawns `codex exec --json`.
pub struct CodexExecutor {
    settings: ExecutorSettings,
    output: Output,
    program: PathBuf,
}

impl CodexExecutor {
    pub fn new(settings: ExecutorSettings, output: Output) -> Self {
        Self {
            settings,
            output,
            program: PathBuf::from("codex"),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

impl Executor for CodexExecutor {
    fn name(&self) -> &str {
        CODEX
    }

    #[instrument(skip_all, fields(plan = %ctx.plan_id, mode = ?ctx.mode))]
    fn execute(&self, prompt: &str, ctx: &ExecutionContext) -> Result<Option<ExecutorOutput>> {
        info!(workdir = %ctx.workdir.display(), "starting codex exec");
        let scratch = tempfile::tempdir().context("create codex scratch dir")?;
        let last_message_path = scratch.path().join("last-message.txt");

        let mut cmd = Command::new(&self.program);
        cmd.arg("exec")
            .arg("--json")
            .arg("--sandbox")
            .arg("danger-full-access")
            // Workspaces are not always git checkouts.
            .arg("--skip-git-repo-check");
        if let Some(model) = &self.settings.model {
            cmd.arg("--model").arg(model);
        }
        cmd.arg("--output-last-message")
            .arg(&last_message_path)
            .arg("-")
            .current_dir(&ctx.workdir)
            .envs(ctx.env.iter().map(|(k, v)| (k, v)));

        let mut transcript = String::new();
        let output = &self.output;
        let run = run_command_streaming(
            cmd,
            Some(prompt.as_bytes()),
            self.settings.limits(),
            &mut |source, line| match source {
                StreamSource::Stdout => handle_codex_line(line, output, &mut transcript),
                StreamSource::Stderr => debug!(line, "codex stderr"),
            },
        )
        .context("run codex exec")?;

        let last_result = read_last_message(&last_message_path)?.map(|text| ResultSignal {
            success: true,
            text,
        });
        finish_run("codex exec", &run, last_result, transcript, ctx.capture)
    }
}

fn handle_codex_line(line: &str, output: &Output, transcript: &mut String) {
    let Ok(event) = serde_json::from_str::<Value>(line) else {
        return;
    };
    let item = event.get("item").unwrap_or(&event);
    let is_message = matches!(
        item.get("type").and_then(Value::as_str),
        Some("agent_message" | "assistant_message")
    );
    if is_message && let Some(text) = item.get("text").and_then(Value::as_str) {
        output.line(text);
        transcript.push_str(text);
        transcript.push('\n');
    }
}

fn read_last_message(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("read codex last message {}", path.display()))?;
    Ok((!text.trim().is_empty()).then_some(text))
}

/// Turn a finished (or killed) run into the executor contract.
///
/// A successful result observed before a kill still counts as success.
fn finish_run(
    label: &str,
    run: &CommandOutput,
    last_result: Option<ResultSignal>,
    transcript: String,
    capture: CaptureOutput,
) -> Result<Option<ExecutorOutput>> {
    match last_result {
        Some(signal) if signal.success => {
            if run.was_killed() {
                warn!(label, "agent was killed after reporting a result, keeping the result");
            } else if !run.status.success() {
                warn!(label, exit_code = ?run.status.code(), "agent exited non-zero after reporting a result");
            }
            if let Some(details) = parse_failure_report(&signal.text) {
                info!(label, summary = %details.summary, "agent reported failure");
                return Ok(Some(ExecutorOutput {
                    content: Some(signal.text),
                    ..ExecutorOutput::failed(details)
                }));
            }
            let content = match capture {
                CaptureOutput::None => None,
                CaptureOutput::Result => Some(signal.text),
                CaptureOutput::All => Some(transcript),
            };
            Ok(Some(ExecutorOutput::succeeded(content)))
        }
        Some(signal) => {
            let details = parse_failure_report(&signal.text).unwrap_or_else(|| FailureDetails {
                summary: if signal.text.trim().is_empty() {
                    format!("{label} reported an error result")
                } else {
                    signal.text.trim().to_string()
                },
                ..FailureDetails::default()
            });
            Ok(Some(ExecutorOutput::failed(details)))
        }
        None if run.inactive => Err(anyhow!("{label} produced no output within the inactivity window")),
        None if run.timed_out => Err(anyhow!("{label} timed out")),
        None if !run.status.success() => Err(anyhow!(
            "{label} failed with status {:?}: {}",
            run.status.code(),
            tail(&run.stderr_lossy(), 2000)
        )),
        None => {
            warn!(label, "agent exited cleanly without a result");
            let content = (capture == CaptureOutput::All).then_some(transcript);
            Ok(Some(ExecutorOutput {
                success: None,
                content,
                failure_details: None,
            }))
        }
    }
}

/// Last `max` bytes of `text`, cut on a char boundary.
pub(crate) fn tail(text: &str, max: usize) -> &str {
    let trimmed = text.trim_end();
    if trimmed.len() <= max {
        return trimmed;
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_program(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-agent");
        fs::write(&path, format!("#!/bin/sh\ncat > /dev/null\n{body}\n")).expect("write script");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    fn settings(inactivity_ms: u64) -> ExecutorSettings {
        ExecutorSettings {
            model: None,
            timeout: Duration::from_secs(20),
            inactivity_timeout: Some(Duration::from_millis(inactivity_ms)),
            output_limit_bytes: 100_000,
        }
    }

    fn ctx(dir: &Path, capture: CaptureOutput) -> ExecutionContext {
        ExecutionContext {
            plan_id: PlanId::Num(1),
            plan_title: "Plan".to_string(),
            plan_file_path: dir.join("1.yml"),
            workdir: dir.to_path_buf(),
            mode: ExecutionMode::Normal,
            capture,
            env: Vec::new(),
        }
    }

    #[test]
    fn success_rule_treats_missing_output_as_success() {
        assert!(is_success(None));
        assert!(is_success(Some(&ExecutorOutput::default())));
        assert!(!is_success(Some(&ExecutorOutput::failed(
            FailureDetails::default()
        ))));
    }

    #[test]
    fn unknown_executor_name_is_rejected() {
        let err = build_executor("mystery", settings(1000), Output::Local)
            .err()
            .expect("error");
        assert!(err.to_string().contains("unknown executor 'mystery'"));
        assert_eq!(
            build_executor("codex", settings(1000), Output::Local)
                .expect("codex")
                .name(),
            CODEX
        );
    }

    #[test]
    fn claude_stream_is_forwarded_and_result_captured() {
        let temp = tempfile::tempdir().expect("tempdir");
        let program = fake_program(
            temp.path(),
            r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"working on it"}]}}'
echo '{"type":"result","subtype":"success","is_error":false,"result":"all done"}'"#,
        );
        let (output, buf) = Output::buffer();
        let executor = ClaudeCodeExecutor::new(settings(5_000), output).with_program(program);

        let result = executor
            .execute("do it", &ctx(temp.path(), CaptureOutput::Result))
            .expect("execute")
            .expect("output");
        assert_eq!(result.success, Some(true));
        assert_eq!(result.content.as_deref(), Some("all done"));
        assert!(buf.lock().expect("buf").contains("working on it"));
    }

    #[test]
    fn late_result_before_inactivity_kill_counts_as_success() {
        let temp = tempfile::tempdir().expect("tempdir");
        let program = fake_program(
            temp.path(),
            r#"echo '{"type":"result","subtype":"success","is_error":false,"result":"ok"}'
exec sleep 5"#,
        );
        let executor = ClaudeCodeExecutor::new(settings(300), Output::buffer().0).with_program(program);

        let result = executor
            .execute("do it", &ctx(temp.path(), CaptureOutput::None))
            .expect("execute");
        assert!(is_success(result.as_ref()));
    }

    #[test]
    fn silent_agent_without_result_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let program = fake_program(temp.path(), "exec sleep 5");
        let executor = ClaudeCodeExecutor::new(settings(300), Output::buffer().0).with_program(program);

        let err = executor
            .execute("do it", &ctx(temp.path(), CaptureOutput::None))
            .unwrap_err();
        assert!(err.to_string().contains("inactivity"));
    }

    #[test]
    fn failure_report_becomes_soft_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let program = fake_program(
            temp.path(),
            r#"printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"FAILED: cannot build\nProblems:\n- missing lib"}'"#,
        );
        let executor = ClaudeCodeExecutor::new(settings(5_000), Output::buffer().0).with_program(program);

        let result = executor
            .execute("do it", &ctx(temp.path(), CaptureOutput::None))
            .expect("execute")
            .expect("output");
        assert_eq!(result.success, Some(false));
        let details = result.failure_details.expect("details");
        assert_eq!(details.summary, "cannot build");
        assert!(details.problems.contains("missing lib"));
    }

    #[test]
    fn codex_reads_last_message_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        // The last message path follows --output-last-message, which is the
        // second-to-last argument.
        let program = fake_program(
            temp.path(),
            r#"for arg; do prev="$last"; last="$arg"; done
echo '{"type":"item.completed","item":{"type":"agent_message","text":"patched"}}'
printf 'finished' > "$prev""#,
        );
        let (output, buf) = Output::buffer();
        let executor = CodexExecutor::new(settings(5_000), output).with_program(program);

        let result = executor
            .execute("do it", &ctx(temp.path(), CaptureOutput::Result))
            .expect("execute")
            .expect("output");
        assert_eq!(result.content.as_deref(), Some("finished"));
        assert!(buf.lock().expect("buf").contains("patched"));
    }
}
