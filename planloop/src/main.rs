//! Plan-driven agent loop runner.
//!
//! Plans live as YAML files under the repository's tasks directory. `planloop agent`
//! works through a plan with a coding agent; the other commands inspect and update
//! plans and workspace locks by hand.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use tracing::warn;

use planloop::agent::{AgentArgs, AgentOptions, AgentServices, run_agent};
use planloop::core::actionable::{ActionableItem, find_next_actionable_item};
use planloop::core::ready::{ReadySort, list_ready_plans};
use planloop::exit_codes;
use planloop::io::cleanup::CleanupRegistry;
use planloop::io::commands::ShellCommandRunner;
use planloop::io::config::{LoadedConfig, discover_config};
use planloop::io::executor::build_executor;
use planloop::io::lock::{LockKind, StalePolicy, acquire_lock, get_lock_info, is_lock_stale, release_lock};
use planloop::io::mark_done::{MarkStepOptions, mark_step_done, mark_task_done};
use planloop::io::output::Output;
use planloop::io::plan_store::{PlanCache, PlanStore};
use planloop::io::prompter::prompter_for;
use planloop::logging;
use planloop::plan::{Plan, Priority};
use planloop::select::{PlanSelector, resolve_plan_file};

#[derive(Parser)]
#[command(
    name = "planloop",
    version,
    about = "Work through YAML plans with a coding agent"
)]
struct Cli {
    /// Log progress diagnostics (`RUST_LOG` still wins).
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Config file to use instead of discovering `.planloop/config.toml`.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a plan through the configured executor until it is done.
    Agent(AgentCmd),
    /// List plans whose dependencies are all done.
    Ready {
        #[arg(long, value_enum, default_value_t = SortKey::Priority)]
        sort: SortKey,
        #[arg(long)]
        reverse: bool,
    },
    /// Print the next actionable task or step of a plan.
    Next {
        /// Plan id or path to a plan file.
        plan: String,
    },
    /// Mark the next step(s), or a whole task, done.
    Done {
        plan: String,
        /// 1-based task number to mark done with all its steps.
        #[arg(long, value_name = "N")]
        task: Option<usize>,
        /// Number of consecutive steps to mark done.
        #[arg(long, value_name = "N", default_value_t = 1, conflicts_with = "task")]
        steps: usize,
        /// Commit the plan file afterwards.
        #[arg(long)]
        commit: bool,
    },
    /// Inspect or manage workspace locks.
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
}

#[derive(Args, Debug)]
#[command(group(
    ArgGroup::new("selector").args(["plan", "next", "current", "latest", "next_ready"])
))]
struct AgentCmd {
    /// Plan id or path to a plan file. Defaults to `--current`.
    plan: Option<String>,
    /// Most urgent ready plan.
    #[arg(long)]
    next: bool,
    /// Most recently touched in-progress plan.
    #[arg(long)]
    current: bool,
    /// Most recently touched plan.
    #[arg(long)]
    latest: bool,
    /// First ready dependency of the given plan.
    #[arg(long, value_name = "ID")]
    next_ready: Option<String>,
    /// One task or step per executor call instead of batching.
    #[arg(long)]
    serial_tasks: bool,
    /// Stop after N items (serial mode).
    #[arg(long = "steps", value_name = "N")]
    max_steps: Option<u32>,
    #[arg(long, value_name = "NAME")]
    executor: Option<String>,
    #[arg(long, value_name = "NAME")]
    model: Option<String>,
    /// Print the prompt that would be sent and exit.
    #[arg(long)]
    dry_run: bool,
    /// Run in the named workspace under the workspace root.
    #[arg(long, value_name = "NAME")]
    workspace: Option<String>,
    /// Reuse the first unlocked workspace, or create one.
    #[arg(long)]
    auto_workspace: bool,
    /// Create a fresh workspace (with `--workspace`: only if it is locked).
    #[arg(long)]
    new_workspace: bool,
    /// Never ask; questions are answered "no".
    #[arg(long)]
    non_interactive: bool,
    /// Review the finished plan once and offer to run any tasks it adds.
    #[arg(long)]
    final_review: bool,
}

impl AgentCmd {
    fn selector(&self) -> PlanSelector {
        if let Some(plan) = &self.plan {
            PlanSelector::Reference(plan.clone())
        } else if let Some(parent) = &self.next_ready {
            PlanSelector::NextReady(parent.clone())
        } else if self.next {
            PlanSelector::Next
        } else if self.latest {
            PlanSelector::Latest
        } else {
            PlanSelector::Current
        }
    }

    fn args(&self) -> AgentArgs {
        AgentArgs {
            serial_tasks: self.serial_tasks,
            max_steps: self.max_steps,
            executor: self.executor.clone(),
            model: self.model.clone(),
            dry_run: self.dry_run,
            workspace: self.workspace.clone(),
            auto_workspace: self.auto_workspace,
            new_workspace: self.new_workspace,
            non_interactive: self.non_interactive,
            final_review: self.final_review,
        }
    }
}

#[derive(Subcommand, Debug)]
enum LockAction {
    /// Show who holds the lock.
    Status(LockTarget),
    /// Take a persistent lock that outlives this process.
    Acquire(LockTarget),
    /// Remove a persistent lock (or any lock with `--force`).
    Release {
        #[command(flatten)]
        target: LockTarget,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct LockTarget {
    /// Workspace directory. Defaults to the repository root.
    #[arg(long, value_name = "PATH")]
    workspace: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum SortKey {
    Priority,
    Id,
    Title,
    Created,
    Updated,
}

impl From<SortKey> for ReadySort {
    fn from(key: SortKey) -> Self {
        match key {
            SortKey::Priority => ReadySort::Priority,
            SortKey::Id => ReadySort::Id,
            SortKey::Title => ReadySort::Title,
            SortKey::Created => ReadySort::Created,
            SortKey::Updated => ReadySort::Updated,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = logging::init(cli.verbose) {
        eprintln!("warning: {err:#}");
    }

    let cleanup = CleanupRegistry::new();
    if let Err(err) = cleanup.listen_for_signals() {
        warn!(err = %format!("{err:#}"), "signal handling unavailable");
    }

    let code = match run(cli, &cleanup) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::for_error(&err)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli, cleanup: &CleanupRegistry) -> Result<i32> {
    let cwd = std::env::current_dir().context("read current directory")?;
    let loaded = discover_config(&cwd, cli.config.as_deref())?;
    match cli.command {
        Command::Agent(cmd) => cmd_agent(&cmd, &loaded, cleanup),
        Command::Ready { sort, reverse } => cmd_ready(&loaded, sort.into(), reverse),
        Command::Next { plan } => cmd_next(&loaded, &plan),
        Command::Done {
            plan,
            task,
            steps,
            commit,
        } => cmd_done(&loaded, &plan, task, steps, commit),
        Command::Lock { action } => cmd_lock(&loaded, action),
    }
}

fn store_for(loaded: &LoadedConfig) -> PlanStore {
    PlanStore::new(loaded.tasks_dir(), Arc::new(PlanCache::new()))
}

fn cmd_agent(cmd: &AgentCmd, loaded: &LoadedConfig, cleanup: &CleanupRegistry) -> Result<i32> {
    let command_line = std::env::args().collect::<Vec<_>>().join(" ");
    let options = AgentOptions::resolve(&cmd.args(), loaded, command_line)?;
    let output = Output::from_env();
    let prompter = prompter_for(&output, options.non_interactive);
    let executor = build_executor(
        &options.executor,
        options.executor_settings.clone(),
        output.clone(),
    )?;
    let services = AgentServices {
        executor: executor.as_ref(),
        commands: &ShellCommandRunner,
        prompter,
        output,
        cleanup: cleanup.clone(),
    };

    let report = run_agent(&cmd.selector(), &options, loaded, &services)?;
    if !options.dry_run {
        services.output.log(&format!(
            "Plan {}: {} after {} executor call(s)",
            report.plan_id,
            report.outcome.label(),
            report.executor_calls
        ));
    }
    Ok(report.outcome.exit_code())
}

fn cmd_ready(loaded: &LoadedConfig, sort: ReadySort, reverse: bool) -> Result<i32> {
    let index = store_for(loaded).index()?;
    let ready = list_ready_plans(&index, sort, reverse);
    if ready.is_empty() {
        println!("no ready plans");
        return Ok(exit_codes::OK);
    }
    for entry in ready {
        let plan = &entry.plan;
        println!(
            "{}\t{}\t{}\t{}",
            plan.id,
            priority_label(plan.priority),
            plan.status,
            plan.display_title()
        );
    }
    Ok(exit_codes::OK)
}

fn priority_label(priority: Option<Priority>) -> &'static str {
    match priority {
        None => "-",
        Some(Priority::Maybe) => "maybe",
        Some(Priority::Low) => "low",
        Some(Priority::Medium) => "medium",
        Some(Priority::High) => "high",
        Some(Priority::Urgent) => "urgent",
    }
}

fn cmd_next(loaded: &LoadedConfig, reference: &str) -> Result<i32> {
    let store = store_for(loaded);
    let path = resolve_plan_file(&PlanSelector::Reference(reference.to_string()), &store)?;
    let plan = store.read(&path)?;
    match find_next_actionable_item(&plan) {
        Some(item) => println!("{}", describe_item(&plan, item)),
        None => println!("plan {} has no incomplete tasks", plan.id),
    }
    Ok(exit_codes::OK)
}

fn describe_item(plan: &Plan, item: ActionableItem) -> String {
    let Some(task) = plan.tasks.get(item.task_index()) else {
        return String::new();
    };
    let number = item.task_index() + 1;
    match item {
        ActionableItem::Task { .. } => format!("task {number}: {}", task.title),
        ActionableItem::Step { step_index, .. } => {
            let prompt = task
                .steps
                .get(step_index)
                .map(|step| step.prompt.as_str())
                .unwrap_or_default();
            format!("task {number} step {}: {}\n{prompt}", step_index + 1, task.title)
        }
    }
}

fn cmd_done(
    loaded: &LoadedConfig,
    reference: &str,
    task: Option<usize>,
    steps: usize,
    commit: bool,
) -> Result<i32> {
    let store = store_for(loaded);
    let path = resolve_plan_file(&PlanSelector::Reference(reference.to_string()), &store)?;
    let opts = MarkStepOptions { steps, commit };
    let outcome = match task {
        Some(0) => anyhow::bail!("--task is 1-based"),
        Some(number) => mark_task_done(&store, &path, number - 1, opts, &loaded.root)?,
        None => mark_step_done(&store, &path, opts, None, &loaded.root)?,
    };
    println!("{}", outcome.message);
    if outcome.plan_complete {
        println!("plan complete");
    }
    Ok(exit_codes::OK)
}

fn cmd_lock(loaded: &LoadedConfig, action: LockAction) -> Result<i32> {
    let policy = StalePolicy::from_hours(loaded.config.workspace.stale_lock_hours);
    let workspace = |target: &LockTarget| -> PathBuf {
        target
            .workspace
            .clone()
            .unwrap_or_else(|| loaded.root.clone())
    };
    match action {
        LockAction::Status(target) => {
            let ws = workspace(&target);
            print_lock_status(&ws, policy)?;
        }
        LockAction::Acquire(target) => {
            let ws = workspace(&target);
            let acquired = acquire_lock(&ws, LockKind::Persistent, "planloop lock acquire", policy)?;
            if let Some(stale) = acquired.replaced_stale {
                println!("cleared stale lock held by pid {}", stale.pid);
            }
            println!("locked {}", ws.display());
        }
        LockAction::Release { target, force } => {
            let ws = workspace(&target);
            if release_lock(&ws, force) {
                println!("released {}", ws.display());
            } else {
                println!("no lock released in {}", ws.display());
            }
        }
    }
    Ok(exit_codes::OK)
}

fn print_lock_status(workspace: &Path, policy: StalePolicy) -> Result<()> {
    match get_lock_info(workspace)? {
        None => println!("{} is unlocked", workspace.display()),
        Some(info) => {
            let stale = if is_lock_stale(&info, policy) { " (stale)" } else { "" };
            println!(
                "{} locked{stale}: {:?} lock by pid {} on {} since {} ({})",
                workspace.display(),
                info.kind,
                info.pid,
                info.hostname,
                info.started_at.to_rfc3339(),
                info.command
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_agent_defaults_to_current_plan() {
        let cli = Cli::parse_from(["planloop", "agent"]);
        let Command::Agent(cmd) = cli.command else {
            panic!("expected agent command");
        };
        assert_eq!(cmd.selector(), PlanSelector::Current);
        assert!(!cmd.args().serial_tasks);
    }

    #[test]
    fn parse_agent_flags() {
        let cli = Cli::parse_from([
            "planloop",
            "--verbose",
            "agent",
            "12",
            "--serial-tasks",
            "--steps",
            "3",
            "--executor",
            "codex",
            "--workspace",
            "w1",
            "--new-workspace",
            "--non-interactive",
        ]);
        assert!(cli.verbose);
        let Command::Agent(cmd) = cli.command else {
            panic!("expected agent command");
        };
        assert_eq!(cmd.selector(), PlanSelector::Reference("12".to_string()));
        let args = cmd.args();
        assert!(args.serial_tasks);
        assert_eq!(args.max_steps, Some(3));
        assert_eq!(args.executor.as_deref(), Some("codex"));
        assert_eq!(args.workspace.as_deref(), Some("w1"));
        assert!(args.new_workspace && args.non_interactive);
    }

    #[test]
    fn parse_agent_next_ready() {
        let cli = Cli::parse_from(["planloop", "agent", "--next-ready", "7"]);
        let Command::Agent(cmd) = cli.command else {
            panic!("expected agent command");
        };
        assert_eq!(cmd.selector(), PlanSelector::NextReady("7".to_string()));
    }

    #[test]
    fn plan_selectors_conflict() {
        assert!(Cli::try_parse_from(["planloop", "agent", "12", "--next"]).is_err());
        assert!(Cli::try_parse_from(["planloop", "agent", "--latest", "--current"]).is_err());
    }

    #[test]
    fn parse_done_task() {
        let cli = Cli::parse_from(["planloop", "done", "4", "--task", "2", "--commit"]);
        assert!(matches!(
            cli.command,
            Command::Done {
                task: Some(2),
                steps: 1,
                commit: true,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["planloop", "done", "4", "--task", "2", "--steps", "2"]).is_err());
    }

    #[test]
    fn parse_lock_release_force() {
        let cli = Cli::parse_from(["planloop", "lock", "release", "--workspace", "/tmp/ws", "--force"]);
        let Command::Lock {
            action: LockAction::Release { target, force },
        } = cli.command
        else {
            panic!("expected lock release");
        };
        assert!(force);
        assert_eq!(target.workspace, Some(PathBuf::from("/tmp/ws")));
    }

    #[test]
    fn parse_ready_sort() {
        let cli = Cli::parse_from(["planloop", "ready", "--sort", "updated", "--reverse"]);
        assert!(matches!(
            cli.command,
            Command::Ready {
                sort: SortKey::Updated,
                reverse: true
            }
        ));
    }
}
