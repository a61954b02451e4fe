//! Choosing (and creating) the workspace an agent run edits.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, info, warn};

use crate::error::WorkspaceLockedError;
use crate::io::git::clone_local;
use crate::io::lock::{StalePolicy, get_lock_info, is_lock_stale};

/// Default parent of named/auto workspaces, relative to the repository root.
pub const DEFAULT_WORKSPACE_DIR: &str = ".planloop/workspaces";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceRequest {
    /// The repository itself.
    Current,
    Named(String),
    /// First free existing workspace, else a new one.
    Auto,
    New,
}

#[derive(Debug, Clone)]
pub struct WorkspaceSettings {
    pub repo_root: PathBuf,
    pub root_dir: PathBuf,
    pub source_dir: PathBuf,
    pub stale_policy: StalePolicy,
    /// When a named workspace is locked, create a fresh one instead of failing.
    pub new_on_conflict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWorkspace {
    pub path: PathBuf,
    pub created: bool,
}

pub fn resolve_workspace(
    request: &WorkspaceRequest,
    settings: &WorkspaceSettings,
) -> Result<ResolvedWorkspace> {
    match request {
        WorkspaceRequest::Current => Ok(ResolvedWorkspace {
            path: settings.repo_root.clone(),
            created: false,
        }),
        WorkspaceRequest::Named(name) => resolve_named(name, settings),
        WorkspaceRequest::Auto => resolve_auto(settings),
        WorkspaceRequest::New => create_workspace(settings),
    }
}

fn resolve_named(name: &str, settings: &WorkspaceSettings) -> Result<ResolvedWorkspace> {
    let path = settings.root_dir.join(name);
    if !path.exists() {
        info!(workspace = %path.display(), "creating named workspace");
        clone_local(&settings.source_dir, &path)
            .with_context(|| format!("create workspace {name}"))?;
        return Ok(ResolvedWorkspace {
            path,
            created: true,
        });
    }

    match get_lock_info(&path) {
        Ok(Some(holder)) if !is_lock_stale(&holder, settings.stale_policy) => {
            if settings.new_on_conflict {
                info!(workspace = %path.display(), pid = holder.pid, "named workspace is locked, creating a new one");
                return create_workspace(settings);
            }
            Err(WorkspaceLockedError {
                workspace: path,
                holder,
            }
            .into())
        }
        _ => Ok(ResolvedWorkspace {
            path,
            created: false,
        }),
    }
}

fn resolve_auto(settings: &WorkspaceSettings) -> Result<ResolvedWorkspace> {
    for path in existing_workspaces(&settings.root_dir)? {
        if is_available(&path, settings.stale_policy) {
            debug!(workspace = %path.display(), "reusing free workspace");
            return Ok(ResolvedWorkspace {
                path,
                created: false,
            });
        }
    }
    create_workspace(settings)
}

/// Workspace directories under `root_dir`, in name order.
pub fn existing_workspaces(root_dir: &Path) -> Result<Vec<PathBuf>> {
    if !root_dir.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root_dir)
        .with_context(|| format!("read workspace root {}", root_dir.display()))?
    {
        let entry = entry.with_context(|| format!("read entry in {}", root_dir.display()))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn is_available(path: &Path, policy: StalePolicy) -> bool {
    match get_lock_info(path) {
        Ok(None) => true,
        Ok(Some(holder)) => is_lock_stale(&holder, policy),
        Err(err) => {
            warn!(workspace = %path.display(), err = %format!("{err:#}"), "unreadable workspace lock counts as stale");
            true
        }
    }
}

fn create_workspace(settings: &WorkspaceSettings) -> Result<ResolvedWorkspace> {
    let name = build_workspace_name(&generate_timestamp(), &generate_short_id());
    let path = settings.root_dir.join(&name);
    info!(workspace = %path.display(), "creating workspace");
    clone_local(&settings.source_dir, &path).with_context(|| format!("create workspace {name}"))?;
    Ok(ResolvedWorkspace {
        path,
        created: true,
    })
}

pub fn build_workspace_name(timestamp: &str, short_id: &str) -> String {
    format!("ws-{timestamp}-{short_id}")
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::lock::{LockKind, acquire_lock};

    fn settings(root: &Path) -> WorkspaceSettings {
        WorkspaceSettings {
            repo_root: root.to_path_buf(),
            root_dir: root.join("workspaces"),
            source_dir: root.to_path_buf(),
            stale_policy: StalePolicy::default(),
            new_on_conflict: false,
        }
    }

    #[test]
    fn workspace_name_uses_expected_format() {
        assert_eq!(
            build_workspace_name("20260101-120000", "abc123"),
            "ws-20260101-120000-abc123"
        );
        let id = generate_short_id();
        assert_eq!(id.len(), 6);
        assert_eq!(id, id.to_lowercase());
    }

    #[test]
    fn current_is_the_repository_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let resolved =
            resolve_workspace(&WorkspaceRequest::Current, &settings(temp.path())).expect("resolve");
        assert_eq!(resolved.path, temp.path());
        assert!(!resolved.created);
    }

    #[test]
    fn auto_skips_locked_workspaces() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = settings(temp.path());
        let busy = settings.root_dir.join("a");
        let free = settings.root_dir.join("b");
        fs::create_dir_all(&busy).expect("mkdir");
        fs::create_dir_all(&free).expect("mkdir");
        acquire_lock(&busy, LockKind::Persistent, "reserved", StalePolicy::default())
            .expect("lock");

        let resolved = resolve_workspace(&WorkspaceRequest::Auto, &settings).expect("resolve");
        assert_eq!(resolved.path, free);
    }

    #[test]
    fn locked_named_workspace_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = settings(temp.path());
        let named = settings.root_dir.join("feature");
        fs::create_dir_all(&named).expect("mkdir");
        acquire_lock(&named, LockKind::Pid, "agent", StalePolicy::default()).expect("lock");

        let err = resolve_workspace(&WorkspaceRequest::Named("feature".to_string()), &settings)
            .unwrap_err();
        assert!(err.downcast_ref::<WorkspaceLockedError>().is_some());
    }
}
