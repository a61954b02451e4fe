use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Plan identifier. Numeric ids are the norm; string ids are tolerated for
/// hand-written plans but never produced by the tooling.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum PlanId {
    Num(u64),
    Text(String),
}

impl PlanId {
    /// Parse user input: digits become `Num`, anything else `Text`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<u64>() {
            Ok(n) => PlanId::Num(n),
            Err(_) => PlanId::Text(trimmed.to_string()),
        }
    }

    pub fn as_num(&self) -> Option<u64> {
        match self {
            PlanId::Num(n) => Some(*n),
            PlanId::Text(_) => None,
        }
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanId::Num(n) => write!(f, "{n}"),
            PlanId::Text(s) => f.write_str(s),
        }
    }
}

impl Ord for PlanId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PlanId::Num(a), PlanId::Num(b)) => a.cmp(b),
            (PlanId::Num(_), PlanId::Text(_)) => Ordering::Less,
            (PlanId::Text(_), PlanId::Num(_)) => Ordering::Greater,
            (PlanId::Text(a), PlanId::Text(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for PlanId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Cancelled,
    Deferred,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::InProgress => "in_progress",
            PlanStatus::Done => "done",
            PlanStatus::Cancelled => "cancelled",
            PlanStatus::Deferred => "deferred",
        }
    }

    /// Statuses a plan may be picked up from.
    pub fn is_actionable(&self) -> bool {
        matches!(self, PlanStatus::Pending | PlanStatus::InProgress)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared in ascending urgency so the derived `Ord` sorts `Urgent` last.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Maybe,
    Low,
    Medium,
    High,
    Urgent,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    pub prompt: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

impl Task {
    /// A task without a step breakdown runs as one unit.
    pub fn is_simple(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: PlanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default)]
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<PlanId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<PlanId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub docs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Plan {
    pub fn new(id: PlanId, title: impl Into<String>) -> Self {
        Self {
            id,
            uuid: None,
            title: title.into(),
            goal: String::new(),
            details: None,
            status: PlanStatus::Pending,
            priority: None,
            parent: None,
            dependencies: Vec::new(),
            docs: Vec::new(),
            created_at: None,
            updated_at: None,
            tasks: Vec::new(),
        }
    }

    /// A plan with no tasks is a stub, executed through the direct path only.
    pub fn is_stub(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn all_tasks_done(&self) -> bool {
        self.tasks.iter().all(|task| task.done)
    }

    pub fn display_title(&self) -> String {
        if self.title.trim().is_empty() {
            format!("plan {}", self.id)
        } else {
            self.title.clone()
        }
    }

    /// Timestamp used by "latest" ordering.
    pub fn last_touched(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_id_parse_prefers_numbers() {
        assert_eq!(PlanId::parse(" 42 "), PlanId::Num(42));
        assert_eq!(PlanId::parse("auth-refactor"), PlanId::Text("auth-refactor".to_string()));
    }

    #[test]
    fn plan_ids_sort_numbers_before_text() {
        let mut ids = vec![
            PlanId::Text("b".to_string()),
            PlanId::Num(10),
            PlanId::Text("a".to_string()),
            PlanId::Num(2),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                PlanId::Num(2),
                PlanId::Num(10),
                PlanId::Text("a".to_string()),
                PlanId::Text("b".to_string()),
            ]
        );
    }

    #[test]
    fn yaml_round_trip_uses_camel_case_and_untagged_ids() {
        let raw = "id: 7\ntitle: T\ngoal: G\nstatus: in_progress\nparent: 3\ndependencies: [1, setup]\ntasks:\n  - title: a\n    steps:\n      - prompt: do it\n";
        let plan: Plan = serde_yaml::from_str(raw).expect("parse");
        assert_eq!(plan.id, PlanId::Num(7));
        assert_eq!(plan.status, PlanStatus::InProgress);
        assert_eq!(plan.parent, Some(PlanId::Num(3)));
        assert_eq!(
            plan.dependencies,
            vec![PlanId::Num(1), PlanId::Text("setup".to_string())]
        );
        assert!(!plan.tasks[0].done);
        assert!(!plan.tasks[0].is_simple());
    }

    #[test]
    fn priority_orders_by_urgency() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::Low > Priority::Maybe);
    }
}
