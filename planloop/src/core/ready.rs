//! Dependency readiness across plans.

use std::cmp::Ordering;

use crate::core::index::{IndexedPlan, PlanIndex};
use crate::plan::{Plan, PlanId, PlanStatus};

/// Why a declared dependency was not offered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocker {
    Missing,
    Finished(PlanStatus),
    Unavailable(PlanStatus),
    WaitingOn(Vec<PlanId>),
}

/// Outcome of the single-pick resolver. `plan: None` is a normal result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyDependency<'a> {
    pub plan: Option<&'a IndexedPlan>,
    pub message: String,
}

/// Ids in `plan.dependencies` that are not yet `done` (missing ids count as unmet).
pub fn unmet_dependencies(plan: &Plan, index: &PlanIndex) -> Vec<PlanId> {
    plan.dependencies
        .iter()
        .filter(|dep| index.plan(dep).map(|p| p.status) != Some(PlanStatus::Done))
        .cloned()
        .collect()
}

/// A plan is ready when its status permits work and every dependency is done.
pub fn is_ready(plan: &Plan, index: &PlanIndex) -> bool {
    plan.status.is_actionable() && unmet_dependencies(plan, index).is_empty()
}

fn classify(id: &PlanId, index: &PlanIndex) -> Result<(), Blocker> {
    let Some(plan) = index.plan(id) else {
        return Err(Blocker::Missing);
    };
    match plan.status {
        PlanStatus::Done | PlanStatus::Cancelled => return Err(Blocker::Finished(plan.status)),
        PlanStatus::Deferred => return Err(Blocker::Unavailable(plan.status)),
        PlanStatus::Pending | PlanStatus::InProgress => {}
    }
    let unmet = unmet_dependencies(plan, index);
    if !unmet.is_empty() {
        return Err(Blocker::WaitingOn(unmet));
    }
    Ok(())
}

/// Pick the first dependency of `parent_id`, in declaration order, that is ready.
///
/// Only the parent's direct dependency list is considered. Ties are broken by
/// declaration order alone; priority ordering belongs to [`list_ready_plans`].
pub fn find_next_ready_dependency<'a>(
    parent_id: &PlanId,
    index: &'a PlanIndex,
) -> ReadyDependency<'a> {
    let Some(parent) = index.plan(parent_id) else {
        return ReadyDependency {
            plan: None,
            message: format!("Plan {parent_id} not found"),
        };
    };
    if parent.dependencies.is_empty() {
        return ReadyDependency {
            plan: None,
            message: format!("Plan {parent_id} has no dependencies"),
        };
    }

    let mut reasons = Vec::new();
    for dep in &parent.dependencies {
        match classify(dep, index) {
            Ok(()) => {
                let entry = index.get(dep);
                return ReadyDependency {
                    plan: entry,
                    message: format!("Found ready dependency {dep} of plan {parent_id}"),
                };
            }
            Err(blocker) => reasons.push(describe(dep, &blocker)),
        }
    }

    ReadyDependency {
        plan: None,
        message: format!(
            "No ready dependencies for plan {parent_id}: {}",
            reasons.join("; ")
        ),
    }
}

fn describe(id: &PlanId, blocker: &Blocker) -> String {
    match blocker {
        Blocker::Missing => format!("{id} not found"),
        Blocker::Finished(status) => format!("{id} is {status}"),
        Blocker::Unavailable(status) => format!("{id} is {status}"),
        Blocker::WaitingOn(ids) => {
            let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
            format!("{id} waiting on {}", ids.join(", "))
        }
    }
}

/// Sort keys for [`list_ready_plans`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadySort {
    #[default]
    Priority,
    Id,
    Title,
    Created,
    Updated,
}

/// Every ready plan that has tasks, sorted. `Priority` puts the most urgent first,
/// then ascending id; the other keys sort ascending. `reverse` flips the result.
pub fn list_ready_plans(index: &PlanIndex, sort: ReadySort, reverse: bool) -> Vec<&IndexedPlan> {
    let mut ready: Vec<&IndexedPlan> = index
        .iter()
        .filter(|entry| !entry.plan.is_stub() && is_ready(&entry.plan, index))
        .collect();

    ready.sort_by(|a, b| compare(&a.plan, &b.plan, sort));
    if reverse {
        ready.reverse();
    }
    ready
}

fn compare(a: &Plan, b: &Plan, sort: ReadySort) -> Ordering {
    let by_id = || a.id.cmp(&b.id);
    match sort {
        ReadySort::Priority => b.priority.cmp(&a.priority).then_with(by_id),
        ReadySort::Id => by_id(),
        ReadySort::Title => a.title.cmp(&b.title).then_with(by_id),
        ReadySort::Created => a.created_at.cmp(&b.created_at).then_with(by_id),
        ReadySort::Updated => a.updated_at.cmp(&b.updated_at).then_with(by_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Priority;
    use crate::test_support::{index_of, plan_with_status};

    #[test]
    fn returns_pending_dependency_and_skips_done_one() {
        let mut parent = plan_with_status(1, PlanStatus::Pending);
        parent.dependencies = vec![PlanId::Num(2), PlanId::Num(3)];
        let index = index_of(vec![
            parent,
            plan_with_status(2, PlanStatus::Done),
            plan_with_status(3, PlanStatus::Pending),
            plan_with_status(4, PlanStatus::Pending),
        ]);

        let found = find_next_ready_dependency(&PlanId::Num(1), &index);
        let plan = found.plan.expect("ready dependency");
        assert_eq!(plan.plan.id, PlanId::Num(3));
    }

    #[test]
    fn first_ready_in_declaration_order_wins_over_priority() {
        let mut parent = plan_with_status(1, PlanStatus::Pending);
        parent.dependencies = vec![PlanId::Num(5), PlanId::Num(2)];
        let mut low = plan_with_status(5, PlanStatus::Pending);
        low.priority = Some(Priority::Low);
        let mut urgent = plan_with_status(2, PlanStatus::Pending);
        urgent.priority = Some(Priority::Urgent);
        let index = index_of(vec![parent, low, urgent]);

        let found = find_next_ready_dependency(&PlanId::Num(1), &index);
        assert_eq!(found.plan.expect("ready").plan.id, PlanId::Num(5));
    }

    #[test]
    fn unmet_sub_dependencies_yield_none_with_message() {
        let mut parent = plan_with_status(1, PlanStatus::InProgress);
        parent.dependencies = vec![PlanId::Num(2), PlanId::Num(3)];
        let mut a = plan_with_status(2, PlanStatus::Pending);
        a.dependencies = vec![PlanId::Num(4)];
        let mut b = plan_with_status(3, PlanStatus::Pending);
        b.dependencies = vec![PlanId::Num(4), PlanId::Num(9)];
        let index = index_of(vec![parent, a, b, plan_with_status(4, PlanStatus::Pending)]);

        let found = find_next_ready_dependency(&PlanId::Num(1), &index);
        assert!(found.plan.is_none());
        assert!(found.message.contains("2 waiting on 4"));
        assert!(found.message.contains("3 waiting on 4, 9"));
    }

    #[test]
    fn missing_parent_is_a_value_not_an_error() {
        let index = index_of(vec![plan_with_status(2, PlanStatus::Pending)]);
        let found = find_next_ready_dependency(&PlanId::Num(99), &index);
        assert!(found.plan.is_none());
        assert!(found.message.contains("not found"));
    }

    #[test]
    fn resolver_is_idempotent() {
        let mut parent = plan_with_status(1, PlanStatus::Pending);
        parent.dependencies = vec![PlanId::Num(2)];
        let index = index_of(vec![parent, plan_with_status(2, PlanStatus::InProgress)]);
        let before = index.clone();

        let first = find_next_ready_dependency(&PlanId::Num(1), &index);
        let second = find_next_ready_dependency(&PlanId::Num(1), &index);
        assert_eq!(first, second);
        assert_eq!(index, before);
    }

    #[test]
    fn list_ready_sorts_by_priority_then_id() {
        let mut a = plan_with_status(3, PlanStatus::Pending);
        a.priority = Some(Priority::High);
        let mut b = plan_with_status(1, PlanStatus::Pending);
        b.priority = Some(Priority::Low);
        let mut c = plan_with_status(2, PlanStatus::Pending);
        c.priority = Some(Priority::High);
        let mut blocked = plan_with_status(4, PlanStatus::Pending);
        blocked.dependencies = vec![PlanId::Num(1)];
        let index = index_of(vec![a, b, c, blocked, plan_with_status(5, PlanStatus::Done)]);

        let ids: Vec<PlanId> = list_ready_plans(&index, ReadySort::Priority, false)
            .iter()
            .map(|entry| entry.plan.id.clone())
            .collect();
        assert_eq!(ids, vec![PlanId::Num(2), PlanId::Num(3), PlanId::Num(1)]);
    }
}
