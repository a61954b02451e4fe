//! Workspace lock file: one agent run per workspace.
//!
//! The lock is a JSON file at `<workspace>/.planloop.lock`, created with
//! exclusive-create semantics. A `pid` lock belongs to a live agent process and
//! is released when that process finishes; a `persistent` lock is a manual
//! reservation taken with `planloop lock acquire` and never goes stale.
//!
//! Staleness is checked before the lock is reclaimed, and the reclaim itself is
//! remove-then-create. Two processes reclaiming the same stale lock can race in
//! that window; the loser sees `AlreadyExists` and reports the workspace locked.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::WorkspaceLockedError;
use crate::io::cleanup::{CleanupRegistry, CleanupToken};

pub const LOCK_FILE_NAME: &str = ".planloop.lock";

const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Pid,
    Persistent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub kind: LockKind,
    pub pid: u32,
    pub hostname: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub version: String,
}

impl LockInfo {
    /// Lock record describing the current process.
    pub fn for_current_process(kind: LockKind, command: impl Into<String>) -> Self {
        Self {
            kind,
            pid: std::process::id(),
            hostname: current_hostname(),
            command: command.into(),
            started_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn is_owned_by_current_process(&self) -> bool {
        self.pid == std::process::id() && self.hostname == current_hostname()
    }
}

/// When a `pid` lock is considered abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalePolicy {
    pub max_age: Duration,
}

impl StalePolicy {
    pub fn from_hours(hours: u64) -> Self {
        Self {
            max_age: Duration::from_secs(hours.saturating_mul(60 * 60)),
        }
    }
}

impl Default for StalePolicy {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_STALE_AFTER,
        }
    }
}

/// Result of a successful [`acquire_lock`].
#[derive(Debug, Clone)]
pub struct AcquiredLock {
    pub info: LockInfo,
    /// The abandoned lock that was cleared to make room, if any.
    pub replaced_stale: Option<LockInfo>,
}

enum LockState {
    Free,
    Held(LockInfo),
    Corrupt(String),
}

pub fn lock_file_path(workspace: &Path) -> PathBuf {
    workspace.join(LOCK_FILE_NAME)
}

pub fn current_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Probe a pid with signal 0. Permission denied still means the process exists.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn read_lock_state(path: &Path) -> Result<LockState> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(LockState::Free),
        Err(err) => return Err(err).with_context(|| format!("read lock {}", path.display())),
    };
    match serde_json::from_str::<LockInfo>(&contents) {
        Ok(info) => Ok(LockState::Held(info)),
        Err(err) => Ok(LockState::Corrupt(err.to_string())),
    }
}

/// Current lock holder, if any. An unparseable lock file is an error here.
pub fn get_lock_info(workspace: &Path) -> Result<Option<LockInfo>> {
    let path = lock_file_path(workspace);
    match read_lock_state(&path)? {
        LockState::Free => Ok(None),
        LockState::Held(info) => Ok(Some(info)),
        LockState::Corrupt(reason) => Err(anyhow!(
            "lock file {} is unreadable: {reason}",
            path.display()
        )),
    }
}

/// Persistent locks never go stale. A `pid` lock is stale when its holder on
/// this host has exited, or when it is older than the policy allows.
pub fn is_lock_stale(info: &LockInfo, policy: StalePolicy) -> bool {
    if info.kind == LockKind::Persistent {
        return false;
    }
    if info.hostname == current_hostname() && !is_process_alive(info.pid) {
        return true;
    }
    // Clock skew can put started_at in the future; that is not "old".
    match (Utc::now() - info.started_at).to_std() {
        Ok(age) => age > policy.max_age,
        Err(_) => false,
    }
}

/// Take the workspace lock, clearing a stale one first.
///
/// Fails with [`WorkspaceLockedError`] when a live holder exists.
pub fn acquire_lock(
    workspace: &Path,
    kind: LockKind,
    command: &str,
    policy: StalePolicy,
) -> Result<AcquiredLock> {
    let path = lock_file_path(workspace);
    let mut replaced_stale = None;

    match read_lock_state(&path)? {
        LockState::Free => {}
        LockState::Held(holder) => {
            if !is_lock_stale(&holder, policy) {
                return Err(WorkspaceLockedError {
                    workspace: workspace.to_path_buf(),
                    holder,
                }
                .into());
            }
            warn!(
                workspace = %workspace.display(),
                pid = holder.pid,
                hostname = %holder.hostname,
                started_at = %holder.started_at.to_rfc3339(),
                "clearing stale workspace lock"
            );
            remove_lock_file(&path)?;
            replaced_stale = Some(holder);
        }
        LockState::Corrupt(reason) => {
            warn!(workspace = %workspace.display(), reason = %reason, "clearing unreadable workspace lock");
            remove_lock_file(&path)?;
        }
    }

    let info = LockInfo::for_current_process(kind, command);
    create_lock_file(workspace, &path, &info)?;
    info!(workspace = %workspace.display(), kind = ?kind, "workspace lock acquired");
    Ok(AcquiredLock {
        info,
        replaced_stale,
    })
}

fn create_lock_file(workspace: &Path, path: &Path, info: &LockInfo) -> Result<()> {
    fs::create_dir_all(workspace)
        .with_context(|| format!("create workspace {}", workspace.display()))?;
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return match read_lock_state(path)? {
                LockState::Held(holder) => Err(WorkspaceLockedError {
                    workspace: workspace.to_path_buf(),
                    holder,
                }
                .into()),
                _ => Err(anyhow!(
                    "lock file {} appeared while acquiring",
                    path.display()
                )),
            };
        }
        Err(err) => return Err(err).with_context(|| format!("create lock {}", path.display())),
    };
    let body = serde_json::to_string_pretty(info).context("serialize lock info")?;
    file.write_all(body.as_bytes())
        .with_context(|| format!("write lock {}", path.display()))?;
    Ok(())
}

fn remove_lock_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove lock {}", path.display())),
    }
}

/// Release the workspace lock. Never fails; problems are logged.
///
/// Without `force`, only a `pid` lock owned by this process or a persistent
/// lock is removed. Returns whether a lock file was removed.
pub fn release_lock(workspace: &Path, force: bool) -> bool {
    let path = lock_file_path(workspace);
    let state = match read_lock_state(&path) {
        Ok(state) => state,
        Err(err) => {
            warn!(workspace = %workspace.display(), err = %format!("{err:#}"), "cannot read workspace lock");
            return false;
        }
    };
    let removable = match &state {
        LockState::Free => {
            debug!(workspace = %workspace.display(), "no workspace lock to release");
            return false;
        }
        LockState::Held(info) => {
            force || info.kind == LockKind::Persistent || info.is_owned_by_current_process()
        }
        LockState::Corrupt(_) => force,
    };
    if !removable {
        warn!(workspace = %workspace.display(), "workspace lock belongs to another process; use --force");
        return false;
    }
    match remove_lock_file(&path) {
        Ok(()) => {
            info!(workspace = %workspace.display(), "workspace lock released");
            true
        }
        Err(err) => {
            warn!(workspace = %workspace.display(), err = %format!("{err:#}"), "failed to release workspace lock");
            false
        }
    }
}

/// Register a callback releasing a `pid` lock on termination.
///
/// Persistent locks outlive the process, so nothing is registered for them.
pub fn setup_cleanup_handlers(
    workspace: &Path,
    kind: LockKind,
    registry: &CleanupRegistry,
) -> Option<CleanupToken> {
    if kind == LockKind::Persistent {
        return None;
    }
    let workspace = workspace.to_path_buf();
    Some(registry.register(move || {
        release_lock(&workspace, false);
    }))
}

/// Held `pid` lock; released on drop.
pub struct LockGuard {
    workspace: PathBuf,
    registry: CleanupRegistry,
    token: Option<CleanupToken>,
    released: bool,
}

impl LockGuard {
    /// Acquire a `pid` lock and register its release with `registry`.
    pub fn acquire(
        workspace: &Path,
        command: &str,
        policy: StalePolicy,
        registry: &CleanupRegistry,
    ) -> Result<(Self, AcquiredLock)> {
        let acquired = acquire_lock(workspace, LockKind::Pid, command, policy)?;
        let token = setup_cleanup_handlers(workspace, LockKind::Pid, registry);
        let guard = Self {
            workspace: workspace.to_path_buf(),
            registry: registry.clone(),
            token,
            released: false,
        };
        Ok((guard, acquired))
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn release(mut self) -> bool {
        self.release_inner()
    }

    fn release_inner(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        if let Some(token) = self.token.take() {
            self.registry.unregister(token);
        }
        release_lock(&self.workspace, false)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
