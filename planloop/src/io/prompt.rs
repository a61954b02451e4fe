//! Prompt builder for executor input.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections go first.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::actionable::{ActionableItem, IncompleteTask};
use crate::plan::{Plan, Task};

pub const DEFAULT_PROMPT_BUDGET_BYTES: usize = 100_000;

const TEMPLATES: &[(&str, &str)] = &[
    ("failure", include_str!("prompts/failure.md")),
    ("plan", include_str!("prompts/plan.md")),
    ("docs_list", include_str!("prompts/docs_list.md")),
    ("step", include_str!("prompts/step.md")),
    ("task", include_str!("prompts/task.md")),
    ("batch", include_str!("prompts/batch.md")),
    ("stub", include_str!("prompts/stub.md")),
    ("review", include_str!("prompts/review.md")),
    ("docs", include_str!("prompts/docs.md")),
    ("lessons", include_str!("prompts/lessons.md")),
];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex is valid")
});

/// Drop order when over budget.
const DROP_ORDER: &[&str] = &["docs", "history"];

#[derive(Debug, Clone, Serialize)]
struct PlanContext {
    id: String,
    title: String,
    goal: String,
    details: Option<String>,
    file: String,
    docs: Vec<String>,
}

impl PlanContext {
    fn new(plan: &Plan, plan_path: &Path) -> Self {
        Self {
            id: plan.id.to_string(),
            title: plan.display_title(),
            goal: plan.goal.trim().to_string(),
            details: plan
                .details
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
            file: plan_path.display().to_string(),
            docs: plan.docs.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct StepContext {
    prompt: String,
    done: bool,
}

#[derive(Debug, Clone, Serialize)]
struct TaskContext {
    /// 1-based position in the plan.
    number: usize,
    title: String,
    description: String,
    steps: Vec<StepContext>,
}

impl TaskContext {
    fn new(task_index: usize, task: &Task) -> Self {
        Self {
            number: task_index + 1,
            title: task.title.clone(),
            description: task.description.trim().to_string(),
            steps: task
                .steps
                .iter()
                .map(|step| StepContext {
                    prompt: step.prompt.clone(),
                    done: step.done,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Renders executor prompts from the embedded templates.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in TEMPLATES {
            env.add_template(name, source)
                .with_context(|| format!("load prompt template {name}"))?;
        }
        Ok(Self { env, budget_bytes })
    }

    /// Prompt for one actionable item (a step or a simple task).
    pub fn item_prompt(&self, plan: &Plan, plan_path: &Path, item: ActionableItem) -> Result<String> {
        let task_index = item.task_index();
        let task = plan
            .tasks
            .get(task_index)
            .with_context(|| format!("task {} not in plan {}", task_index + 1, plan.id))?;
        let plan_ctx = PlanContext::new(plan, plan_path);
        let task_ctx = TaskContext::new(task_index, task);

        match item {
            ActionableItem::Step { step_index, .. } => {
                let step = task.steps.get(step_index).with_context(|| {
                    format!("step {} not in task {}", step_index + 1, task_index + 1)
                })?;
                let completed: Vec<&str> = task
                    .steps
                    .iter()
                    .filter(|s| s.done)
                    .map(|s| s.prompt.as_str())
                    .collect();
                self.render(
                    "step",
                    context! {
                        plan => plan_ctx,
                        task => task_ctx,
                        completed => completed,
                        step => context! {
                            number => step_index + 1,
                            total => task.steps.len(),
                            prompt => step.prompt.trim(),
                        },
                    },
                )
            }
            ActionableItem::Task { .. } => self.render(
                "task",
                context! {
                    plan => plan_ctx,
                    task => task_ctx,
                    completed => completed_task_titles(plan),
                },
            ),
        }
    }

    /// One prompt covering every incomplete task.
    pub fn batch_prompt(
        &self,
        plan: &Plan,
        plan_path: &Path,
        tasks: &[IncompleteTask<'_>],
    ) -> Result<String> {
        let tasks: Vec<TaskContext> = tasks
            .iter()
            .map(|t| TaskContext::new(t.task_index, t.task))
            .collect();
        self.render(
            "batch",
            context! { plan => PlanContext::new(plan, plan_path), tasks => tasks },
        )
    }

    /// Prompt for a plan without tasks.
    pub fn stub_prompt(&self, plan: &Plan, plan_path: &Path) -> Result<String> {
        self.render("stub", context! { plan => PlanContext::new(plan, plan_path) })
    }

    pub fn review_prompt(&self, plan: &Plan, plan_path: &Path) -> Result<String> {
        let tasks: Vec<TaskContext> = plan
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| TaskContext::new(i, t))
            .collect();
        self.render(
            "review",
            context! { plan => PlanContext::new(plan, plan_path), tasks => tasks },
        )
    }

    pub fn docs_prompt(&self, plan: &Plan, plan_path: &Path) -> Result<String> {
        self.render(
            "docs",
            context! {
                plan => PlanContext::new(plan, plan_path),
                completed => completed_task_titles(plan),
            },
        )
    }

    pub fn lessons_prompt(&self, plan: &Plan, plan_path: &Path) -> Result<String> {
        self.render(
            "lessons",
            context! {
                plan => PlanContext::new(plan, plan_path),
                completed => completed_task_titles(plan),
            },
        )
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let rendered = self
            .env
            .get_template(name)
            .with_context(|| format!("get prompt template {name}"))?
            .render(ctx)
            .with_context(|| format!("render prompt template {name}"))?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

fn completed_task_titles(plan: &Plan) -> Vec<&str> {
    plan.tasks
        .iter()
        .filter(|t| t.done)
        .map(|t| t.title.as_str())
        .collect()
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = collapse_blank_lines(rendered[whole.end()..end].trim());
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

/// Templates leave runs of blank lines around conditional blocks.
pub(crate) fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    let mut out = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan_with_tasks, simple_task, stepped_task};
    use std::path::PathBuf;

    fn builder() -> PromptBuilder {
        PromptBuilder::new(DEFAULT_PROMPT_BUDGET_BYTES).expect("templates")
    }

    #[test]
    fn step_prompt_names_current_step_and_completed_ones() {
        let mut plan = plan_with_tasks(7, vec![stepped_task("Wire API", false, &[true, false])]);
        plan.tasks[0].steps[0].prompt = "Add the route".to_string();
        plan.tasks[0].steps[1].prompt = "Write the handler".to_string();
        let item = ActionableItem::Step {
            task_index: 0,
            step_index: 1,
        };

        let prompt = builder()
            .item_prompt(&plan, &PathBuf::from("tasks/7.yml"), item)
            .expect("render");
        assert!(prompt.contains("Step 2 of 2:\nWrite the handler"));
        assert!(prompt.contains("- Add the route"));
        assert!(prompt.contains("Plan file: tasks/7.yml"));
        assert!(prompt.contains("FAILED: <one-line summary>"));
        assert!(!prompt.contains("section:"));
    }

    #[test]
    fn batch_prompt_lists_every_incomplete_task_with_its_plan_number() {
        let plan = plan_with_tasks(
            3,
            vec![
                simple_task("done already", true),
                simple_task("second", false),
                simple_task("third", false),
            ],
        );
        let tasks = crate::core::actionable::get_all_incomplete_tasks(&plan);

        let prompt = builder()
            .batch_prompt(&plan, Path::new("3.yml"), &tasks)
            .expect("render");
        assert!(prompt.contains("Process 2 task(s)"));
        assert!(prompt.contains("2. second"));
        assert!(prompt.contains("3. third"));
        assert!(!prompt.contains("done already"));
        assert!(prompt.contains("`done: true`"));
    }

    #[test]
    fn budget_drops_docs_before_history() {
        let mut plan = plan_with_tasks(1, vec![stepped_task("t", false, &[true, false])]);
        plan.tasks[0].steps[0].prompt = "earlier work ".repeat(20);
        plan.docs = vec!["docs/architecture.md".repeat(30)];
        let item = ActionableItem::Step {
            task_index: 0,
            step_index: 1,
        };
        let full = builder()
            .item_prompt(&plan, Path::new("1.yml"), item)
            .expect("render");
        let docs_len = "docs/architecture.md".repeat(30).len();

        let tight = PromptBuilder::new(full.len() - docs_len)
            .expect("templates")
            .item_prompt(&plan, Path::new("1.yml"), item)
            .expect("render");
        assert!(!tight.contains("### Reference Docs"));
        assert!(tight.contains("### Completed Steps"));
    }

    #[test]
    fn stub_prompt_carries_goal() {
        let mut plan = plan_with_tasks(9, Vec::new());
        plan.goal = "Ship dark mode".to_string();
        let prompt = builder().stub_prompt(&plan, Path::new("9.yml")).expect("render");
        assert!(prompt.contains("Goal: Ship dark mode"));
        assert!(prompt.contains("no task breakdown"));
    }
}
