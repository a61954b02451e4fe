//! Error kinds callers branch on.
//!
//! Everything else travels as a plain `anyhow::Error`; these are recovered with
//! `downcast_ref` at the CLI boundary and in tests.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::failure::FailureDetails;
use crate::io::lock::LockInfo;
use crate::plan::PlanId;

#[derive(Debug, Error)]
#[error("plan not found: {reference}{}", .detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
pub struct PlanNotFoundError {
    pub reference: String,
    pub detail: Option<String>,
}

#[derive(Debug, Error)]
#[error("duplicate plan id {id}: declared by {} and {}", .first.display(), .second.display())]
pub struct DuplicatePlanIdError {
    pub id: PlanId,
    pub first: PathBuf,
    pub second: PathBuf,
}

#[derive(Debug, Error)]
#[error("plan file {} does not declare a numeric id", .path.display())]
pub struct NonNumericPlanIdError {
    pub path: PathBuf,
}

#[derive(Debug, Error)]
#[error(
    "workspace {} is locked by pid {} on {} since {} ({})",
    .workspace.display(),
    .holder.pid,
    .holder.hostname,
    .holder.started_at.to_rfc3339(),
    .holder.command
)]
pub struct WorkspaceLockedError {
    pub workspace: PathBuf,
    pub holder: LockInfo,
}

/// The executor returned a result explicitly marking failure.
#[derive(Debug, Error)]
#[error("{executor} reported failure: {}", .details.summary)]
pub struct ExecutorFailedError {
    pub executor: String,
    pub details: FailureDetails,
}

#[derive(Debug, Error)]
#[error("post-apply command '{title}' failed")]
pub struct PostApplyCommandError {
    pub title: String,
}
