//! Repository configuration stored under `.planloop/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CONFIG_DIR: &str = ".planloop";
pub const CONFIG_FILE: &str = "config.toml";

/// Planloop configuration (TOML).
///
/// Edited by humans. Missing fields default to the values documented on each
/// field; unknown fields are rejected so typos surface early.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PlanloopConfig {
    /// Directory holding plan files, relative to the repository root.
    pub tasks_dir: PathBuf,
    pub executor: ExecutorConfig,
    pub agent: AgentConfig,
    /// Commands run after every executor call; each must pass.
    pub post_apply_commands: Vec<PostApplyCommand>,
    pub workspace: WorkspaceConfig,
    pub summary: SummaryConfig,
    pub notifications: NotificationConfig,
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Executor used when `--executor` is not given.
    pub default: String,
    pub model: Option<String>,
    /// Hard wall-clock ceiling for one executor call.
    pub timeout_secs: u64,
    /// Kill the agent after this long without output.
    pub inactivity_timeout_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DocsMode {
    #[default]
    Never,
    AfterIteration,
    AfterCompletion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Upper bound on batch-mode executor invocations per run.
    pub batch_max_iterations: u32,
    pub final_review: bool,
    pub lessons: bool,
    pub update_docs: DocsMode,
    /// Commit after each mark-done.
    pub commit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PostApplyCommand {
    pub title: String,
    pub command: String,
    /// Relative to the workspace root.
    pub workdir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub allow_failure: bool,
    pub timeout_secs: u64,
}

impl Default for PostApplyCommand {
    fn default() -> Self {
        Self {
            title: String::new(),
            command: String::new(),
            workdir: None,
            env: BTreeMap::new(),
            allow_failure: false,
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    /// Parent directory for named/auto workspaces.
    pub root_dir: Option<PathBuf>,
    /// Repository cloned into new workspaces. Defaults to the repository root.
    pub source_dir: Option<PathBuf>,
    pub stale_lock_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SummaryConfig {
    pub enabled: bool,
    /// Relative to the workspace root.
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct NotificationConfig {
    /// argv of a command that receives a JSON event on stdin.
    pub command: Option<Vec<String>>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    pub enabled: bool,
}

impl Default for PlanloopConfig {
    fn default() -> Self {
        Self {
            tasks_dir: PathBuf::from("tasks"),
            executor: ExecutorConfig::default(),
            agent: AgentConfig::default(),
            post_apply_commands: Vec::new(),
            workspace: WorkspaceConfig::default(),
            summary: SummaryConfig::default(),
            notifications: NotificationConfig::default(),
            tunnel: TunnelConfig::default(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default: "claude-code".to_string(),
            model: None,
            timeout_secs: 60 * 60,
            inactivity_timeout_secs: 15 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            batch_max_iterations: 10,
            final_review: false,
            lessons: false,
            update_docs: DocsMode::Never,
            commit: false,
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            source_dir: None,
            stale_lock_hours: 24,
        }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(".planloop/summaries"),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: 30,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl PlanloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tasks_dir.as_os_str().is_empty() {
            return Err(anyhow!("tasks_dir must not be empty"));
        }
        if self.executor.default.trim().is_empty() {
            return Err(anyhow!("executor.default must not be empty"));
        }
        if self.executor.timeout_secs == 0 {
            return Err(anyhow!("executor.timeout_secs must be > 0"));
        }
        if self.executor.inactivity_timeout_secs == 0 {
            return Err(anyhow!("executor.inactivity_timeout_secs must be > 0"));
        }
        if self.executor.output_limit_bytes == 0 {
            return Err(anyhow!("executor.output_limit_bytes must be > 0"));
        }
        if self.agent.batch_max_iterations == 0 {
            return Err(anyhow!("agent.batch_max_iterations must be > 0"));
        }
        if self.workspace.stale_lock_hours == 0 {
            return Err(anyhow!("workspace.stale_lock_hours must be > 0"));
        }
        for (i, cmd) in self.post_apply_commands.iter().enumerate() {
            if cmd.title.trim().is_empty() {
                return Err(anyhow!("post_apply_commands[{i}].title must not be empty"));
            }
            if cmd.command.trim().is_empty() {
                return Err(anyhow!(
                    "post_apply_commands[{i}] ({}) command must not be empty",
                    cmd.title
                ));
            }
            if cmd.timeout_secs == 0 {
                return Err(anyhow!(
                    "post_apply_commands[{i}] ({}) timeout_secs must be > 0",
                    cmd.title
                ));
            }
        }
        if let Some(command) = &self.notifications.command
            && command.first().is_none_or(|c| c.trim().is_empty())
        {
            return Err(anyhow!("notifications.command must be a non-empty array"));
        }
        Ok(())
    }
}

/// Config plus the repository root it was discovered in.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub root: PathBuf,
    pub config: PlanloopConfig,
}

impl LoadedConfig {
    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join(&self.config.tasks_dir)
    }

    pub fn source_dir(&self) -> PathBuf {
        match &self.config.workspace.source_dir {
            Some(dir) => self.root.join(dir),
            None => self.root.clone(),
        }
    }

    pub fn workspace_root(&self) -> Option<PathBuf> {
        self.config
            .workspace
            .root_dir
            .as_ref()
            .map(|dir| self.root.join(dir))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PlanloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<PlanloopConfig> {
    if !path.exists() {
        let cfg = PlanloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PlanloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Find the repository root (nearest ancestor holding `.planloop/` or `.git`)
/// and load its config. An explicit path skips discovery.
pub fn discover_config(start: &Path, explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        let config = load_config(path)?;
        let root = path
            .parent()
            .and_then(|dir| {
                if dir.file_name().is_some_and(|name| name == CONFIG_DIR) {
                    dir.parent()
                } else {
                    Some(dir)
                }
            })
            .map(Path::to_path_buf)
            .unwrap_or_else(|| start.to_path_buf());
        return Ok(LoadedConfig { root, config });
    }

    let root = start
        .ancestors()
        .find(|dir| dir.join(CONFIG_DIR).is_dir() || dir.join(".git").exists())
        .unwrap_or(start)
        .to_path_buf();
    let path = root.join(CONFIG_DIR).join(CONFIG_FILE);
    debug!(root = %root.display(), config = %path.display(), "discovered repository root");
    let config = load_config(&path)?;
    Ok(LoadedConfig { root, config })
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PlanloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PlanloopConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = PlanloopConfig {
            post_apply_commands: vec![PostApplyCommand {
                title: "format".to_string(),
                command: "cargo fmt".to_string(),
                ..PostApplyCommand::default()
            }],
            ..PlanloopConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "tasks_dir = \"plans\"\n[agent]\nupdate_docs = \"after-completion\"\n\n[[post_apply_commands]]\ntitle = \"lint\"\ncommand = \"just lint\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.tasks_dir, PathBuf::from("plans"));
        assert_eq!(cfg.agent.update_docs, DocsMode::AfterCompletion);
        assert_eq!(cfg.agent.batch_max_iterations, 10);
        assert_eq!(cfg.post_apply_commands[0].timeout_secs, 600);
    }

    #[test]
    fn rejects_empty_post_apply_command() {
        let cfg = PlanloopConfig {
            post_apply_commands: vec![PostApplyCommand {
                title: "noop".to_string(),
                ..PostApplyCommand::default()
            }],
            ..PlanloopConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("(noop) command must not be empty"));
    }

    #[test]
    fn discovery_walks_up_to_config_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join(CONFIG_DIR)).expect("mkdir");
        fs::create_dir_all(root.join("a/b")).expect("mkdir");
        let loaded = discover_config(&root.join("a/b"), None).expect("discover");
        assert_eq!(loaded.root, root);
        assert_eq!(loaded.tasks_dir(), root.join("tasks"));
    }
}
