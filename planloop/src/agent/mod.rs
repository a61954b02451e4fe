//! `planloop agent`: drive one plan to completion through an executor.
//!
//! [`run_agent`] resolves the plan and workspace, takes the workspace lock, starts
//! the output tunnel and hands control to the engine. Whatever the engine returns
//! becomes one [`ExecutionOutcome`], and [`finish`] then flushes the summary,
//! notifies, closes the tunnel and releases the lock, each step isolated from the
//! others' failures.

mod batch;
mod engine;
mod serial;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::actionable::{find_next_actionable_item, get_all_incomplete_tasks};
use crate::error::ExecutorFailedError;
use crate::exit_codes;
use crate::io::cleanup::{CleanupRegistry, CleanupToken};
use crate::io::commands::CommandRunner;
use crate::io::config::{DocsMode, LoadedConfig, NotificationConfig, PostApplyCommand};
use crate::io::executor::{Executor, ExecutorSettings};
use crate::io::lock::{LockGuard, StalePolicy};
use crate::io::notify::{NotificationEvent, send_notification};
use crate::io::output::Output;
use crate::io::plan_store::{PlanCache, PlanStore, read_plan_file};
use crate::io::prompt::{DEFAULT_PROMPT_BUDGET_BYTES, PromptBuilder};
use crate::io::prompter::{Prompter, prompt_handler};
use crate::io::summary::SummaryCollector;
use crate::io::tunnel::{
    TUNNEL_SOCKET_ENV, TunnelMessage, TunnelServer, TunnelServerOptions, create_temp_tunnel_server,
};
use crate::io::workspace::{
    DEFAULT_WORKSPACE_DIR, WorkspaceRequest, WorkspaceSettings, resolve_workspace,
};
use crate::plan::{Plan, PlanId, PlanStatus};
use crate::select::{PlanSelector, resolve_plan_file};

use engine::{Engine, EngineParts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Every incomplete task in one executor call per iteration.
    #[default]
    Batch,
    /// One task or step per executor call.
    Serial,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Batch => "batch",
            RunMode::Serial => "serial",
        }
    }
}

/// Command-line switches of `planloop agent`, before merging with config.
#[derive(Debug, Clone, Default)]
pub struct AgentArgs {
    pub serial_tasks: bool,
    pub max_steps: Option<u32>,
    pub executor: Option<String>,
    pub model: Option<String>,
    pub dry_run: bool,
    pub workspace: Option<String>,
    pub auto_workspace: bool,
    pub new_workspace: bool,
    pub non_interactive: bool,
    pub final_review: bool,
}

/// Everything a run needs to know, resolved once from CLI args and config.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub mode: RunMode,
    /// Serial mode only: stop after this many items.
    pub max_steps: Option<u32>,
    pub batch_max_iterations: u32,
    pub executor: String,
    pub executor_settings: ExecutorSettings,
    pub dry_run: bool,
    pub workspace: WorkspaceRequest,
    pub workspace_settings: WorkspaceSettings,
    pub non_interactive: bool,
    pub final_review: bool,
    pub lessons: bool,
    pub update_docs: DocsMode,
    pub commit: bool,
    pub post_apply_commands: Vec<PostApplyCommand>,
    /// Relative to the workspace. `None` disables the summary file.
    pub summary_dir: Option<PathBuf>,
    pub notifications: NotificationConfig,
    pub tunnel: bool,
    pub prompt_budget_bytes: usize,
    /// Recorded in the lock file.
    pub command_line: String,
}

impl AgentOptions {
    pub fn resolve(args: &AgentArgs, loaded: &LoadedConfig, command_line: impl Into<String>) -> Result<Self> {
        let cfg = &loaded.config;
        if args.auto_workspace && args.workspace.is_some() {
            bail!("--auto-workspace cannot be combined with --workspace");
        }
        if args.max_steps == Some(0) {
            bail!("--steps must be at least 1");
        }

        let mode = if args.serial_tasks {
            RunMode::Serial
        } else {
            RunMode::Batch
        };
        if mode == RunMode::Batch && args.max_steps.is_some() {
            warn!("--steps only limits serial runs; pass --serial-tasks to use it");
        }

        let workspace = match (&args.workspace, args.auto_workspace, args.new_workspace) {
            (Some(name), _, _) => WorkspaceRequest::Named(name.clone()),
            (None, true, _) => WorkspaceRequest::Auto,
            (None, false, true) => WorkspaceRequest::New,
            (None, false, false) => WorkspaceRequest::Current,
        };
        let workspace_settings = WorkspaceSettings {
            repo_root: loaded.root.clone(),
            root_dir: loaded
                .workspace_root()
                .unwrap_or_else(|| loaded.root.join(DEFAULT_WORKSPACE_DIR)),
            source_dir: loaded.source_dir(),
            stale_policy: StalePolicy::from_hours(cfg.workspace.stale_lock_hours),
            new_on_conflict: args.new_workspace && args.workspace.is_some(),
        };

        Ok(Self {
            mode,
            max_steps: args.max_steps,
            batch_max_iterations: cfg.agent.batch_max_iterations,
            executor: args
                .executor
                .clone()
                .unwrap_or_else(|| cfg.executor.default.clone()),
            executor_settings: ExecutorSettings::from_config(&cfg.executor, args.model.clone()),
            dry_run: args.dry_run,
            workspace,
            workspace_settings,
            non_interactive: args.non_interactive,
            final_review: args.final_review || cfg.agent.final_review,
            lessons: cfg.agent.lessons,
            update_docs: cfg.agent.update_docs,
            commit: cfg.agent.commit,
            post_apply_commands: cfg.post_apply_commands.clone(),
            summary_dir: cfg.summary.enabled.then(|| cfg.summary.dir.clone()),
            notifications: cfg.notifications.clone(),
            tunnel: cfg.tunnel.enabled,
            prompt_budget_bytes: DEFAULT_PROMPT_BUDGET_BYTES,
            command_line: command_line.into(),
        })
    }
}

/// Collaborators injected by the caller.
pub struct AgentServices<'a> {
    pub executor: &'a dyn Executor,
    pub commands: &'a dyn CommandRunner,
    pub prompter: Arc<dyn Prompter>,
    pub output: Output,
    pub cleanup: CleanupRegistry,
}

/// How a run ended.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Completed,
    StepLimitReached { steps: u32 },
    IterationLimitReached { iterations: u32 },
    DryRun,
    /// Final review appended tasks and the user chose not to run them.
    ReviewDeclined,
    Failed(anyhow::Error),
}

impl ExecutionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed => "completed",
            ExecutionOutcome::StepLimitReached { .. } => "step_limit_reached",
            ExecutionOutcome::IterationLimitReached { .. } => "iteration_limit_reached",
            ExecutionOutcome::DryRun => "dry_run",
            ExecutionOutcome::ReviewDeclined => "review_declined",
            ExecutionOutcome::Failed(_) => "failed",
        }
    }

    /// Exit status of `planloop agent` for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutionOutcome::IterationLimitReached { .. } => exit_codes::FAILED,
            ExecutionOutcome::Failed(err) => exit_codes::for_error(err),
            _ => exit_codes::OK,
        }
    }

    fn message(&self) -> String {
        match self {
            ExecutionOutcome::Completed => "all tasks done".to_string(),
            ExecutionOutcome::StepLimitReached { steps } => format!("stopped after {steps} step(s)"),
            ExecutionOutcome::IterationLimitReached { iterations } => {
                format!("tasks remain after {iterations} batch iteration(s)")
            }
            ExecutionOutcome::DryRun => "dry run".to_string(),
            ExecutionOutcome::ReviewDeclined => "final review added tasks; not continued".to_string(),
            ExecutionOutcome::Failed(err) => format!("{err:#}"),
        }
    }
}

/// What `run_agent` hands back on any non-failed outcome.
#[derive(Debug)]
pub struct AgentReport {
    pub outcome: ExecutionOutcome,
    pub plan_id: PlanId,
    pub plan_path: PathBuf,
    pub workspace: PathBuf,
    pub summary_path: Option<PathBuf>,
    pub executor_calls: u32,
}

/// Resources that outlive the engine and are released by [`finish`].
struct RunResources {
    lock: Option<LockGuard>,
    tunnel: Option<TunnelServer>,
    tunnel_cleanup: Option<CleanupToken>,
    summary: Option<SummaryCollector>,
}

impl RunResources {
    fn none() -> Self {
        Self {
            lock: None,
            tunnel: None,
            tunnel_cleanup: None,
            summary: None,
        }
    }
}

/// Run the plan named by `selector`. A failed run is returned as `Err` after
/// cleanup; every other outcome comes back inside the report.
#[instrument(skip_all, fields(selector = ?selector, mode = options.mode.as_str()))]
pub fn run_agent(
    selector: &PlanSelector,
    options: &AgentOptions,
    config: &LoadedConfig,
    services: &AgentServices<'_>,
) -> Result<AgentReport> {
    let store = PlanStore::new(config.tasks_dir(), Arc::new(PlanCache::new()));
    let plan_path = resolve_plan_file(selector, &store)?;
    let plan = store.read(&plan_path)?;
    if matches!(plan.status, PlanStatus::Cancelled | PlanStatus::Deferred) {
        bail!("plan {} is {}; nothing to run", plan.id, plan.status);
    }
    let prompts = PromptBuilder::new(options.prompt_budget_bytes)?;

    let mut report = AgentReport {
        outcome: ExecutionOutcome::DryRun,
        plan_id: plan.id.clone(),
        plan_path: plan_path.clone(),
        workspace: config.root.clone(),
        summary_path: None,
        executor_calls: 0,
    };

    if options.dry_run {
        match dry_run_prompt(&plan, &plan_path, options.mode, &prompts)? {
            Some(prompt) => services.output.line(&prompt),
            None => services
                .output
                .log(&format!("Plan {} has no incomplete tasks.", plan.id)),
        }
        return finish(ExecutionOutcome::DryRun, report, RunResources::none(), options, services);
    }

    let workspace = resolve_workspace(&options.workspace, &options.workspace_settings)?;
    if workspace.created {
        services
            .output
            .log(&format!("Created workspace {}", workspace.path.display()));
    }
    report.workspace = workspace.path.clone();

    let (lock, acquired) = LockGuard::acquire(
        &workspace.path,
        &options.command_line,
        options.workspace_settings.stale_policy,
        &services.cleanup,
    )?;
    if let Some(stale) = &acquired.replaced_stale {
        services.output.log(&format!(
            "Cleared stale lock held by pid {} on {}",
            stale.pid, stale.hostname
        ));
    }
    let mut resources = RunResources {
        lock: Some(lock),
        ..RunResources::none()
    };

    if options.tunnel && std::env::var_os(TUNNEL_SOCKET_ENV).is_none() {
        match start_tunnel(services) {
            Ok((server, token)) => {
                resources.tunnel = Some(server);
                resources.tunnel_cleanup = Some(token);
            }
            Err(err) => {
                return finish(ExecutionOutcome::Failed(err), report, resources, options, services);
            }
        }
    }
    let env = resources
        .tunnel
        .as_ref()
        .map(|server| vec![server.env_entry()])
        .unwrap_or_default();

    let mode = if plan.is_stub() {
        "stub"
    } else {
        options.mode.as_str()
    };
    let summary = SummaryCollector::new(&plan, mode, &workspace.path);
    let mut engine = Engine::new(
        EngineParts {
            store: &store,
            plan_path: &plan_path,
            workspace: &workspace.path,
            base_dir: &config.root,
            options,
            prompts,
            env,
            summary,
        },
        services,
    );
    let outcome = match engine.run() {
        Ok(outcome) => outcome,
        Err(err) => {
            engine.fail();
            ExecutionOutcome::Failed(err)
        }
    };
    report.executor_calls = engine.executor_calls();
    resources.summary = Some(engine.into_summary());

    finish(outcome, report, resources, options, services)
}

fn dry_run_prompt(
    plan: &Plan,
    plan_path: &Path,
    mode: RunMode,
    prompts: &PromptBuilder,
) -> Result<Option<String>> {
    if plan.is_stub() {
        return prompts.stub_prompt(plan, plan_path).map(Some);
    }
    match mode {
        RunMode::Batch => {
            let tasks = get_all_incomplete_tasks(plan);
            if tasks.is_empty() {
                return Ok(None);
            }
            prompts.batch_prompt(plan, plan_path, &tasks).map(Some)
        }
        RunMode::Serial => match find_next_actionable_item(plan) {
            Some(item) => prompts.item_prompt(plan, plan_path, item).map(Some),
            None => Ok(None),
        },
    }
}

/// Start the top-level tunnel. Nested output lands in our own [`Output`]; nested
/// prompts are answered by our prompter.
fn start_tunnel(services: &AgentServices<'_>) -> Result<(TunnelServer, CleanupToken)> {
    let output = services.output.clone();
    let server = create_temp_tunnel_server(TunnelServerOptions {
        on_prompt_request: Some(prompt_handler(Arc::clone(&services.prompter))),
        on_output: Arc::new(move |message: &TunnelMessage| output.forward(message)),
    })?;
    let socket_dir = server
        .socket_path()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| server.socket_path().to_path_buf());
    let token = services.cleanup.register(move || {
        let _ = fs::remove_dir_all(&socket_dir);
    });
    debug!(socket = %server.socket_path().display(), "tunnel started");
    Ok((server, token))
}

/// Single exit path of a run. Each cleanup step logs its own failure and never
/// prevents the next one.
fn finish(
    outcome: ExecutionOutcome,
    mut report: AgentReport,
    resources: RunResources,
    options: &AgentOptions,
    services: &AgentServices<'_>,
) -> Result<AgentReport> {
    let RunResources {
        lock,
        tunnel,
        tunnel_cleanup,
        summary,
    } = resources;

    if let Some(mut summary) = summary {
        if let ExecutionOutcome::Failed(err) = &outcome {
            summary.record_error(format!("{err:#}"));
            if let Some(failed) = err.downcast_ref::<ExecutorFailedError>() {
                summary.record_failure(failed.details.clone());
            }
        }
        if let Some(dir) = &options.summary_dir {
            match summary.write(&report.workspace.join(dir), outcome.label()) {
                Ok((path, rendered)) => {
                    services.output.log(rendered.trim_end());
                    services
                        .output
                        .log(&format!("Summary written to {}", path.display()));
                    report.summary_path = Some(path);
                }
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "failed to write execution summary");
                }
            }
        }
    }

    if !matches!(outcome, ExecutionOutcome::DryRun) {
        notify(&outcome, &report, options);
    }

    if let Some(mut server) = tunnel {
        if let Err(err) = server.close() {
            warn!(err = %format!("{err:#}"), "failed to close output tunnel");
        }
        if let Some(token) = tunnel_cleanup {
            services.cleanup.unregister(token);
        }
    }

    if let Some(lock) = lock {
        lock.release();
    }

    info!(outcome = outcome.label(), calls = report.executor_calls, "agent run finished");
    match outcome {
        ExecutionOutcome::Failed(err) => Err(err),
        outcome => {
            report.outcome = outcome;
            Ok(report)
        }
    }
}

fn notify(outcome: &ExecutionOutcome, report: &AgentReport, options: &AgentOptions) {
    let plan_title = read_plan_file(&report.plan_path)
        .map(|plan| plan.display_title())
        .unwrap_or_default();
    let event = NotificationEvent {
        event: "agent_done".to_string(),
        plan_id: report.plan_id.to_string(),
        plan_title,
        status: outcome.label().to_string(),
        message: outcome.message(),
        workspace: report.workspace.display().to_string(),
    };
    if let Err(err) = send_notification(&options.notifications, &event, &report.workspace) {
        warn!(err = %format!("{err:#}"), "notification failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::PlanloopConfig;

    fn loaded(root: &Path) -> LoadedConfig {
        LoadedConfig {
            root: root.to_path_buf(),
            config: PlanloopConfig::default(),
        }
    }

    #[test]
    fn batch_is_the_default_mode() {
        let options =
            AgentOptions::resolve(&AgentArgs::default(), &loaded(Path::new("/repo")), "agent").expect("resolve");
        assert_eq!(options.mode, RunMode::Batch);
        assert_eq!(options.workspace, WorkspaceRequest::Current);
        assert_eq!(options.executor, "claude-code");
        assert_eq!(options.batch_max_iterations, 10);
        assert_eq!(
            options.workspace_settings.root_dir,
            Path::new("/repo").join(DEFAULT_WORKSPACE_DIR)
        );
        assert_eq!(options.summary_dir, Some(PathBuf::from(".planloop/summaries")));
    }

    #[test]
    fn cli_flags_override_config() {
        let mut config = loaded(Path::new("/repo"));
        config.config.agent.final_review = false;
        config.config.summary.enabled = false;
        let args = AgentArgs {
            serial_tasks: true,
            max_steps: Some(3),
            executor: Some("codex".to_string()),
            model: Some("fast".to_string()),
            final_review: true,
            ..AgentArgs::default()
        };
        let options = AgentOptions::resolve(&args, &config, "agent 4").expect("resolve");
        assert_eq!(options.mode, RunMode::Serial);
        assert_eq!(options.max_steps, Some(3));
        assert_eq!(options.executor, "codex");
        assert_eq!(options.executor_settings.model.as_deref(), Some("fast"));
        assert!(options.final_review);
        assert_eq!(options.summary_dir, None);
        assert_eq!(options.command_line, "agent 4");
    }

    #[test]
    fn workspace_flags_map_to_requests() {
        let config = loaded(Path::new("/repo"));
        let named = AgentArgs {
            workspace: Some("w1".to_string()),
            new_workspace: true,
            ..AgentArgs::default()
        };
        let options = AgentOptions::resolve(&named, &config, "agent").expect("resolve");
        assert_eq!(options.workspace, WorkspaceRequest::Named("w1".to_string()));
        assert!(options.workspace_settings.new_on_conflict);

        let fresh = AgentArgs {
            new_workspace: true,
            ..AgentArgs::default()
        };
        let options = AgentOptions::resolve(&fresh, &config, "agent").expect("resolve");
        assert_eq!(options.workspace, WorkspaceRequest::New);
        assert!(!options.workspace_settings.new_on_conflict);

        let conflicting = AgentArgs {
            workspace: Some("w1".to_string()),
            auto_workspace: true,
            ..AgentArgs::default()
        };
        assert!(AgentOptions::resolve(&conflicting, &config, "agent").is_err());
    }

    #[test]
    fn iteration_limit_is_a_failing_exit() {
        assert_eq!(ExecutionOutcome::Completed.exit_code(), exit_codes::OK);
        assert_eq!(
            ExecutionOutcome::StepLimitReached { steps: 2 }.exit_code(),
            exit_codes::OK
        );
        assert_eq!(
            ExecutionOutcome::IterationLimitReached { iterations: 10 }.exit_code(),
            exit_codes::FAILED
        );
        assert_eq!(ExecutionOutcome::ReviewDeclined.label(), "review_declined");
    }
}
