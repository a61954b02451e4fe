//! Plan-driven agent loop runner.
//!
//! A plan is a YAML file listing tasks (optionally broken into steps). The agent
//! engine picks the next unit of work, hands it to a coding-agent executor, runs
//! post-apply checks and marks progress back into the plan file until every task
//! is done. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (actionable item selection, dependency
//!   readiness, engine state transitions). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (plan files, locks, git, processes,
//!   the output tunnel). Isolated behind traits where tests need to substitute them.
//!
//! Orchestration modules ([`agent`], [`select`]) coordinate core logic with I/O
//! to implement CLI commands.

pub mod agent;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod plan;
pub mod select;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
