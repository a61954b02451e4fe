//! Side-effecting helpers used by the engine and CLI commands.

pub mod cleanup;
pub mod commands;
pub mod config;
pub mod executor;
pub mod git;
pub mod lock;
pub mod mark_done;
pub mod notify;
pub mod output;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod prompter;
pub mod summary;
pub mod tunnel;
pub mod workspace;
