//! CLI tests: spawn the planloop binary inside a scratch repository and check
//! output and exit codes.

use std::process::{Command, Output};

use planloop::exit_codes;
use planloop::io::lock::lock_file_path;
use planloop::plan::{PlanId, PlanStatus, Priority};
use planloop::test_support::{TestRepo, plan_with_status, plan_with_tasks, simple_task, stepped_task};

fn planloop(repo: &TestRepo, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_planloop"))
        .current_dir(repo.root())
        .env_remove("PLANLOOP_OUTPUT_SOCKET")
        .args(args)
        .output()
        .expect("spawn planloop")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn ready_lists_plans_most_urgent_first() {
    let repo = TestRepo::new().expect("repo");
    let mut low = plan_with_status(1, PlanStatus::Pending);
    low.priority = Some(Priority::Low);
    let mut urgent = plan_with_status(2, PlanStatus::Pending);
    urgent.priority = Some(Priority::Urgent);
    let mut blocked = plan_with_status(3, PlanStatus::Pending);
    blocked.dependencies = vec![PlanId::Num(1)];
    for plan in [&low, &urgent, &blocked] {
        repo.write_plan(plan).expect("write");
    }

    let output = planloop(&repo, &["ready"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let ids: Vec<String> = stdout(&output)
        .lines()
        .filter_map(|line| line.split('\t').next().map(String::from))
        .collect();
    assert_eq!(ids, vec!["2".to_string(), "1".to_string()]);
}

#[test]
fn next_prints_first_incomplete_step() {
    let repo = TestRepo::new().expect("repo");
    repo.write_plan(&plan_with_tasks(
        5,
        vec![simple_task("setup", true), stepped_task("wire", false, &[true, false])],
    ))
    .expect("write");

    let output = planloop(&repo, &["next", "5"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let text = stdout(&output);
    assert!(text.contains("task 2 step 2: wire"), "stdout: {text}");
    assert!(text.contains("wire step 2"));
}

#[test]
fn unknown_plan_exits_with_not_found() {
    let repo = TestRepo::new().expect("repo");
    let output = planloop(&repo, &["next", "404"]);
    assert_eq!(output.status.code(), Some(exit_codes::NOT_FOUND));
}

#[test]
fn done_marks_task_and_completes_plan() {
    let repo = TestRepo::new().expect("repo");
    repo.write_plan(&plan_with_tasks(6, vec![stepped_task("only", false, &[false, false])]))
        .expect("write");

    let output = planloop(&repo, &["done", "6", "--task", "1"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(stdout(&output).contains("plan complete"));
    let plan = repo.read_plan(6).expect("read");
    assert!(plan.tasks[0].steps.iter().all(|step| step.done));
    assert_eq!(plan.status, PlanStatus::Done);
}

#[test]
fn lock_acquire_blocks_until_released() {
    let repo = TestRepo::new().expect("repo");

    let acquired = planloop(&repo, &["lock", "acquire"]);
    assert_eq!(acquired.status.code(), Some(exit_codes::OK));
    assert!(lock_file_path(repo.root()).exists());

    let again = planloop(&repo, &["lock", "acquire"]);
    assert_eq!(again.status.code(), Some(exit_codes::LOCKED));

    let status = planloop(&repo, &["lock", "status"]);
    assert!(stdout(&status).contains("Persistent lock"));

    let released = planloop(&repo, &["lock", "release"]);
    assert_eq!(released.status.code(), Some(exit_codes::OK));
    assert!(!lock_file_path(repo.root()).exists());
}
