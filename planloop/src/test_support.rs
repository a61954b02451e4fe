//! Test-only helpers: plan builders, scripted collaborators and a scratch git repo.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::failure::FailureDetails;
use crate::core::index::PlanIndex;
use crate::io::commands::{CommandOutcome, CommandReport, CommandRequest, CommandRunner};
use crate::io::config::{CONFIG_DIR, CONFIG_FILE, LoadedConfig, PlanloopConfig, write_config};
use crate::io::executor::{
    CaptureOutput, ExecutionContext, ExecutionMode, Executor, ExecutorOutput,
};
use crate::io::plan_store::{read_plan_file, write_plan_file};
use crate::plan::{Plan, PlanId, PlanStatus, Step, Task};

/// Plan `id` with deterministic title/goal and the given tasks.
pub fn plan_with_tasks(id: u64, tasks: Vec<Task>) -> Plan {
    let mut plan = Plan::new(PlanId::Num(id), format!("Plan {id}"));
    plan.goal = format!("Goal of plan {id}");
    plan.tasks = tasks;
    plan
}

pub fn simple_task(title: &str, done: bool) -> Task {
    Task {
        title: title.to_string(),
        description: format!("{title} description"),
        done,
        steps: Vec::new(),
    }
}

/// Task with one step per entry of `steps` (the entry is the step's `done`).
pub fn stepped_task(title: &str, done: bool, steps: &[bool]) -> Task {
    Task {
        steps: steps
            .iter()
            .enumerate()
            .map(|(i, done)| Step {
                prompt: format!("{title} step {}", i + 1),
                done: *done,
            })
            .collect(),
        ..simple_task(title, done)
    }
}

/// Non-stub plan with `status`; its single task is done iff the plan is.
pub fn plan_with_status(id: u64, status: PlanStatus) -> Plan {
    let mut plan = plan_with_tasks(id, vec![simple_task("work", status == PlanStatus::Done)]);
    plan.status = status;
    plan
}

/// In-memory index with paths `tasks/<id>.yml`.
pub fn index_of(plans: Vec<Plan>) -> PlanIndex {
    let mut index = PlanIndex::new();
    for plan in plans {
        let path = PathBuf::from(format!("tasks/{}.yml", plan.id));
        index.insert(plan, path);
    }
    index
}

/// Write `plan` to `<dir>/<id>.yml` and return the path.
pub fn write_plan(dir: &Path, plan: &Plan) -> Result<PathBuf> {
    let path = dir.join(format!("{}.yml", plan.id));
    let mut plan = plan.clone();
    write_plan_file(&path, &mut plan)?;
    Ok(path)
}

/// Reply text of a successful scripted call when the caller captures output.
pub const SCRIPTED_REPLY: &str = "scripted agent finished the work";

pub enum ScriptedResponse {
    Success,
    /// `Ok(None)`: a backend that reports nothing.
    NoResult,
    SoftFailure(FailureDetails),
    /// `Err(..)`: crash, spawn failure or timeout.
    Error(String),
}

type PlanUpdate = Box<dyn Fn(&mut Plan) + Send>;

/// One queued executor call.
pub struct ScriptedExec {
    pub response: ScriptedResponse,
    /// Applied to the plan file before responding, like an agent editing it.
    pub plan_update: Option<PlanUpdate>,
}

impl ScriptedExec {
    pub fn success() -> Self {
        Self {
            response: ScriptedResponse::Success,
            plan_update: None,
        }
    }

    pub fn with_update(response: ScriptedResponse, update: impl Fn(&mut Plan) + Send + 'static) -> Self {
        Self {
            response,
            plan_update: Some(Box::new(update)),
        }
    }

    pub fn respond(response: ScriptedResponse) -> Self {
        Self {
            response,
            plan_update: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub prompt: String,
    pub mode: ExecutionMode,
    pub env: Vec<(String, String)>,
}

/// Executor that pops queued responses; an empty queue is an error.
pub struct ScriptedExecutor {
    queue: Mutex<VecDeque<ScriptedExec>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedExecutor {
    pub fn new(execs: Vec<ScriptedExec>) -> Self {
        Self {
            queue: Mutex::new(execs.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }
}

impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    fn execute(&self, prompt: &str, ctx: &ExecutionContext) -> Result<Option<ExecutorOutput>> {
        self.calls
            .lock()
            .map_err(|_| anyhow!("calls lock poisoned"))?
            .push(RecordedCall {
                prompt: prompt.to_string(),
                mode: ctx.mode,
                env: ctx.env.clone(),
            });
        let exec = self
            .queue
            .lock()
            .map_err(|_| anyhow!("queue lock poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("scripted executor has no queued response"))?;

        if let Some(update) = &exec.plan_update {
            let mut plan = read_plan_file(&ctx.plan_file_path)?;
            update(&mut plan);
            write_plan_file(&ctx.plan_file_path, &mut plan)?;
        }

        match exec.response {
            ScriptedResponse::Success => {
                let reply = (ctx.capture != CaptureOutput::None).then(|| SCRIPTED_REPLY.to_string());
                Ok(Some(ExecutorOutput::succeeded(reply)))
            }
            ScriptedResponse::NoResult => Ok(None),
            ScriptedResponse::SoftFailure(details) => Ok(Some(ExecutorOutput::failed(details))),
            ScriptedResponse::Error(message) => bail!("{message}"),
        }
    }
}

/// Command runner returning queued outcomes; passes once the queue is empty.
pub struct ScriptedCommandRunner {
    outcomes: Mutex<VecDeque<CommandOutcome>>,
    titles: Mutex<Vec<String>>,
}

impl ScriptedCommandRunner {
    pub fn new(outcomes: Vec<CommandOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            titles: Mutex::new(Vec::new()),
        }
    }

    pub fn passing() -> Self {
        Self::new(Vec::new())
    }

    pub fn titles(&self) -> Vec<String> {
        self.titles.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

impl CommandRunner for ScriptedCommandRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandReport> {
        self.titles
            .lock()
            .map_err(|_| anyhow!("titles lock poisoned"))?
            .push(request.title.clone());
        let outcome = self
            .outcomes
            .lock()
            .map_err(|_| anyhow!("outcomes lock poisoned"))?
            .pop_front()
            .unwrap_or(CommandOutcome::Pass);
        let exit_code = match outcome {
            CommandOutcome::Pass => 0,
            CommandOutcome::Fail => 1,
        };
        Ok(CommandReport {
            outcome,
            output: format!("{} output", request.title),
            exit_code: Some(exit_code),
            timed_out: false,
        })
    }
}

/// Scratch git repository with a `.planloop/` directory and a `tasks/` dir.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "planloop@example.com"])?;
        repo.git(&["config", "user.name", "planloop tests"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        fs::create_dir_all(repo.root().join(CONFIG_DIR)).context("create config dir")?;
        fs::create_dir_all(repo.tasks_dir()).context("create tasks dir")?;
        fs::write(repo.root().join("README.md"), "test repo\n").context("write readme")?;
        fs::write(repo.root().join(".gitignore"), ".planloop.lock\n.planloop/summaries/\n")
            .context("write gitignore")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "initial"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root().join("tasks")
    }

    pub fn write_plan(&self, plan: &Plan) -> Result<PathBuf> {
        write_plan(&self.tasks_dir(), plan)
    }

    pub fn read_plan(&self, id: u64) -> Result<Plan> {
        read_plan_file(&self.tasks_dir().join(format!("{id}.yml")))
    }

    /// Write `config` to `.planloop/config.toml` and return it as loaded.
    pub fn configure(&self, config: PlanloopConfig) -> Result<LoadedConfig> {
        write_config(&self.root().join(CONFIG_DIR).join(CONFIG_FILE), &config)?;
        Ok(LoadedConfig {
            root: self.root().to_path_buf(),
            config,
        })
    }

    /// Stage everything and commit.
    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-q", "-m", message])
    }

    pub fn git_log(&self) -> Result<Vec<String>> {
        let output = Command::new("git")
            .args(["log", "--format=%s"])
            .current_dir(self.root())
            .output()
            .context("spawn git log")?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(String::from)
            .collect())
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .status()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !status.success() {
            bail!("git {} failed", args.join(" "));
        }
        Ok(())
    }
}
