//! Plan file load/save helpers with schema + invariant validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::index::{IndexedPlan, PlanIndex};
use crate::core::invariants::validate_plan_invariants;
use crate::error::{DuplicatePlanIdError, PlanNotFoundError};
use crate::plan::{Plan, PlanId};

const PLAN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/plan.schema.json"
));

static PLAN_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(PLAN_SCHEMA).map_err(|err| format!("parse plan schema: {err}"))?;
    validator_for(&schema).map_err(|err| format!("invalid plan schema: {err}"))
});

/// True for files the store treats as plans.
pub fn is_plan_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yml" | "yaml")
    )
}

/// Load and validate a plan file (schema + invariants).
pub fn read_plan_file(path: &Path) -> Result<Plan> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let value: Value = serde_yaml::from_str(&contents)
        .with_context(|| format!("parse plan {}", path.display()))?;
    validate_schema(&value).with_context(|| format!("validate plan {}", path.display()))?;
    let plan: Plan = serde_json::from_value(value)
        .with_context(|| format!("deserialize plan {}", path.display()))?;
    let errors = validate_plan_invariants(&plan);
    if !errors.is_empty() {
        return Err(anyhow!(
            "plan invariants failed in {}: {}",
            path.display(),
            errors.join("; ")
        ));
    }
    Ok(plan)
}

/// Stamp `updatedAt` and atomically write the plan (temp file + rename).
pub fn write_plan_file(path: &Path, plan: &mut Plan) -> Result<()> {
    let now = Utc::now();
    plan.updated_at = Some(now);
    if plan.created_at.is_none() {
        plan.created_at = Some(now);
    }
    let buf = serde_yaml::to_string(plan).context("serialize plan yaml")?;
    write_atomic(path, &buf)?;
    debug!(path = %path.display(), id = %plan.id, status = %plan.status, "plan written");
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("plan path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("plan path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp plan {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace plan {}", path.display()))?;
    Ok(())
}

fn validate_schema(plan: &Value) -> Result<()> {
    let validator = PLAN_VALIDATOR.as_ref().map_err(|err| anyhow!("{err}"))?;
    if validator.is_valid(plan) {
        return Ok(());
    }
    let messages = validator
        .iter_errors(plan)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    Err(anyhow!("plan schema validation failed: {}", messages.join("; ")))
}

/// Scan `tasks_dir` recursively and index every plan by id.
///
/// Unreadable files are skipped with a warning; two files declaring the same
/// id are a hard error.
pub fn read_all_plans(tasks_dir: &Path) -> Result<PlanIndex> {
    let mut index = PlanIndex::new();
    if !tasks_dir.exists() {
        debug!(dir = %tasks_dir.display(), "tasks dir missing, empty index");
        return Ok(index);
    }

    let mut paths: Vec<PathBuf> = WalkDir::new(tasks_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(err = %err, "skipping unreadable tasks dir entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_plan_file(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    paths.sort();

    for path in paths {
        let plan = match read_plan_file(&path) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(path = %path.display(), err = %format!("{err:#}"), "skipping invalid plan file");
                continue;
            }
        };
        let id = plan.id.clone();
        if let Some(previous) = index.insert(plan, path.clone()) {
            return Err(DuplicatePlanIdError {
                id,
                first: previous.path,
                second: path,
            }
            .into());
        }
    }

    debug!(dir = %tasks_dir.display(), plans = index.len(), "plans indexed");
    Ok(index)
}

/// Explicit, shareable cache of plan indexes keyed by tasks directory.
#[derive(Debug, Default)]
pub struct PlanCache {
    entries: Mutex<HashMap<PathBuf, Arc<PlanIndex>>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_load(&self, tasks_dir: &Path) -> Result<Arc<PlanIndex>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("plan cache lock poisoned"))?;
        if let Some(index) = entries.get(tasks_dir) {
            return Ok(Arc::clone(index));
        }
        let index = Arc::new(read_all_plans(tasks_dir)?);
        entries.insert(tasks_dir.to_path_buf(), Arc::clone(&index));
        Ok(index)
    }

    /// Drop every cached index.
    pub fn invalidate(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

/// Plan store bound to one tasks directory.
#[derive(Debug, Clone)]
pub struct PlanStore {
    tasks_dir: PathBuf,
    cache: Arc<PlanCache>,
}

impl PlanStore {
    pub fn new(tasks_dir: impl Into<PathBuf>, cache: Arc<PlanCache>) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
            cache,
        }
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    /// Cached index of every plan in the tasks directory.
    pub fn index(&self) -> Result<Arc<PlanIndex>> {
        self.cache.get_or_load(&self.tasks_dir)
    }

    /// Fresh read, bypassing the cache.
    pub fn read(&self, path: &Path) -> Result<Plan> {
        read_plan_file(path)
    }

    /// Write through to disk and invalidate cached indexes.
    pub fn write(&self, path: &Path, plan: &mut Plan) -> Result<()> {
        write_plan_file(path, plan)?;
        self.cache.invalidate();
        Ok(())
    }

    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    /// Look a plan up by id.
    pub fn find(&self, id: &PlanId) -> Result<IndexedPlan> {
        self.index()?
            .get(id)
            .cloned()
            .ok_or_else(|| {
                PlanNotFoundError {
                    reference: id.to_string(),
                    detail: Some(format!("no plan with this id in {}", self.tasks_dir.display())),
                }
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanStatus;
    use crate::test_support::{plan_with_tasks, simple_task, stepped_task};

    #[test]
    fn write_then_read_round_trips_and_stamps_updated_at() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("1.plan.yml");
        let mut plan = plan_with_tasks(1, vec![stepped_task("a", false, &[true, false])]);
        assert!(plan.updated_at.is_none());

        write_plan_file(&path, &mut plan).expect("write");
        assert!(plan.updated_at.is_some());
        let loaded = read_plan_file(&path).expect("read");
        assert_eq!(loaded, plan);
    }

    #[test]
    fn schema_rejects_unknown_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("bad.yml");
        fs::write(&path, "id: 1\nstatus: sleeping\ntasks: []\n").expect("write");
        let err = read_plan_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(read_plan_file(&temp.path().join("nope.yml")).is_err());
    }

    #[test]
    fn duplicate_ids_fail_loudly() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut a = plan_with_tasks(5, vec![simple_task("a", false)]);
        let mut b = plan_with_tasks(5, vec![simple_task("b", false)]);
        write_plan_file(&temp.path().join("a.yml"), &mut a).expect("write a");
        write_plan_file(&temp.path().join("nested/b.yml"), &mut b).expect("write b");

        let err = read_all_plans(temp.path()).unwrap_err();
        let dup = err
            .downcast_ref::<DuplicatePlanIdError>()
            .expect("duplicate id error");
        assert_eq!(dup.id, PlanId::Num(5));
    }

    #[test]
    fn index_skips_invalid_files_and_ignores_other_extensions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut ok = plan_with_tasks(1, vec![simple_task("a", false)]);
        write_plan_file(&temp.path().join("ok.yml"), &mut ok).expect("write");
        fs::write(temp.path().join("broken.yml"), "id: [not, valid]\n").expect("write");
        fs::write(temp.path().join("notes.md"), "# notes\n").expect("write");

        let index = read_all_plans(temp.path()).expect("index");
        assert_eq!(index.len(), 1);
        assert!(index.plan(&PlanId::Num(1)).is_some());
    }

    #[test]
    fn store_writes_invalidate_cached_index() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = PlanStore::new(temp.path(), Arc::new(PlanCache::new()));
        let path = temp.path().join("1.yml");
        let mut plan = plan_with_tasks(1, vec![simple_task("a", false)]);
        store.write(&path, &mut plan).expect("write");
        assert_eq!(
            store.find(&PlanId::Num(1)).expect("find").plan.status,
            PlanStatus::Pending
        );

        plan.status = PlanStatus::InProgress;
        store.write(&path, &mut plan).expect("write");
        assert_eq!(
            store.find(&PlanId::Num(1)).expect("find").plan.status,
            PlanStatus::InProgress
        );
    }
}
