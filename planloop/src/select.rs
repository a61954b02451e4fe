//! Resolving a user's plan reference to a plan file.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;

use crate::core::ready::{ReadySort, find_next_ready_dependency, list_ready_plans};
use crate::error::{NonNumericPlanIdError, PlanNotFoundError};
use crate::io::plan_store::{PlanStore, read_plan_file};
use crate::plan::{PlanId, PlanStatus};

/// How the caller named the plan to work on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanSelector {
    /// A plan id or a path to a plan file.
    Reference(String),
    /// Most urgent ready plan.
    Next,
    /// Most recently touched in-progress plan, else `Next`.
    Current,
    /// Most recently touched plan of any status.
    Latest,
    /// First ready dependency of the referenced plan.
    NextReady(String),
}

/// Resolve `selector` to the path of a plan file.
pub fn resolve_plan_file(selector: &PlanSelector, store: &PlanStore) -> Result<PathBuf> {
    let path = match selector {
        PlanSelector::Reference(reference) => resolve_reference(reference, store)?,
        PlanSelector::Next => next_ready(store)?,
        PlanSelector::Current => match current(store)? {
            Some(path) => path,
            None => next_ready(store)?,
        },
        PlanSelector::Latest => latest(store)?,
        PlanSelector::NextReady(reference) => {
            let parent = parent_id(reference, store)?;
            let index = store.index()?;
            let found = find_next_ready_dependency(&parent, &index);
            debug!(parent = %parent, message = %found.message, "ready dependency lookup");
            match found.plan {
                Some(entry) => entry.path.clone(),
                None => {
                    return Err(PlanNotFoundError {
                        reference: format!("next ready dependency of {parent}"),
                        detail: Some(found.message),
                    }
                    .into());
                }
            }
        }
    };
    debug!(selector = ?selector, path = %path.display(), "plan resolved");
    Ok(path)
}

fn resolve_reference(reference: &str, store: &PlanStore) -> Result<PathBuf> {
    if let Some(path) = existing_file(reference, store) {
        return Ok(path);
    }
    Ok(store.find(&PlanId::parse(reference))?.path)
}

fn existing_file(reference: &str, store: &PlanStore) -> Option<PathBuf> {
    let direct = Path::new(reference);
    if direct.is_file() {
        return Some(direct.to_path_buf());
    }
    let in_tasks = store.tasks_dir().join(reference);
    in_tasks.is_file().then_some(in_tasks)
}

/// A parent given as a file path must carry a numeric id; anything else is an id.
fn parent_id(reference: &str, store: &PlanStore) -> Result<PlanId> {
    let Some(path) = existing_file(reference, store) else {
        return Ok(PlanId::parse(reference));
    };
    let plan = read_plan_file(&path)?;
    match plan.id.as_num() {
        Some(id) => Ok(PlanId::Num(id)),
        None => Err(NonNumericPlanIdError { path }.into()),
    }
}

fn next_ready(store: &PlanStore) -> Result<PathBuf> {
    let index = store.index()?;
    list_ready_plans(&index, ReadySort::Priority, false)
        .first()
        .map(|entry| entry.path.clone())
        .ok_or_else(|| {
            PlanNotFoundError {
                reference: "next".to_string(),
                detail: Some("no ready plans".to_string()),
            }
            .into()
        })
}

fn current(store: &PlanStore) -> Result<Option<PathBuf>> {
    let index = store.index()?;
    Ok(index
        .iter()
        .filter(|entry| entry.plan.status == PlanStatus::InProgress)
        .max_by(|a, b| {
            a.plan
                .last_touched()
                .cmp(&b.plan.last_touched())
                .then_with(|| a.plan.id.cmp(&b.plan.id))
        })
        .map(|entry| entry.path.clone()))
}

fn latest(store: &PlanStore) -> Result<PathBuf> {
    let index = store.index()?;
    index
        .iter()
        .max_by(|a, b| {
            a.plan
                .last_touched()
                .cmp(&b.plan.last_touched())
                .then_with(|| a.plan.id.cmp(&b.plan.id))
        })
        .map(|entry| entry.path.clone())
        .ok_or_else(|| {
            PlanNotFoundError {
                reference: "latest".to_string(),
                detail: Some(format!("no plans in {}", store.tasks_dir().display())),
            }
            .into()
        })
}
