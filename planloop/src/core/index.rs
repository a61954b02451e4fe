//! In-memory view of every plan in a tasks directory.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::plan::{Plan, PlanId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedPlan {
    pub plan: Plan,
    pub path: PathBuf,
}

/// Plans keyed by id. Ids are unique; the loader rejects duplicates before
/// an index is ever built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanIndex {
    plans: BTreeMap<PlanId, IndexedPlan>,
}

impl PlanIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a plan, returning the entry it displaced (if any).
    pub fn insert(&mut self, plan: Plan, path: PathBuf) -> Option<IndexedPlan> {
        self.plans
            .insert(plan.id.clone(), IndexedPlan { plan, path })
    }

    pub fn get(&self, id: &PlanId) -> Option<&IndexedPlan> {
        self.plans.get(id)
    }

    pub fn plan(&self, id: &PlanId) -> Option<&Plan> {
        self.plans.get(id).map(|entry| &entry.plan)
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Entries in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexedPlan> {
        self.plans.values()
    }

    /// Plans whose `parent` is `id`, in id order.
    pub fn children_of<'a>(&'a self, id: &'a PlanId) -> impl Iterator<Item = &'a IndexedPlan> {
        self.plans
            .values()
            .filter(move |entry| entry.plan.parent.as_ref() == Some(id))
    }
}
