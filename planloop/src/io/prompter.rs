//! Yes/no decisions that need a human.

use std::sync::Arc;

use anyhow::{Context, Result};
use dialoguer::Confirm;

use crate::io::output::Output;
use crate::io::tunnel::{PromptHandler, PromptRequest, TunnelClient};

pub trait Prompter: Send + Sync {
    fn confirm(&self, message: &str, default: bool) -> Result<bool>;
}

/// Asks on the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn confirm(&self, message: &str, default: bool) -> Result<bool> {
        Confirm::new()
            .with_prompt(message)
            .default(default)
            .interact()
            .context("read confirmation from terminal")
    }
}

/// Forwards the question to the outermost planloop process.
#[derive(Debug, Clone)]
pub struct TunnelPrompter {
    client: Arc<TunnelClient>,
}

impl TunnelPrompter {
    pub fn new(client: Arc<TunnelClient>) -> Self {
        Self { client }
    }
}

impl Prompter for TunnelPrompter {
    fn confirm(&self, message: &str, default: bool) -> Result<bool> {
        self.client.request_prompt(message, default)
    }
}

/// Always gives the same answer. Used for `--non-interactive` runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedPrompter(pub bool);

impl Prompter for FixedPrompter {
    fn confirm(&self, _message: &str, _default: bool) -> Result<bool> {
        Ok(self.0)
    }
}

/// Pick the prompter for this process.
pub fn prompter_for(output: &Output, non_interactive: bool) -> Arc<dyn Prompter> {
    if non_interactive {
        return Arc::new(FixedPrompter(false));
    }
    match output.tunnel_client() {
        Some(client) => Arc::new(TunnelPrompter::new(client)),
        None => Arc::new(TerminalPrompter),
    }
}

/// Adapt a prompter into a tunnel server's prompt handler.
pub fn prompt_handler(prompter: Arc<dyn Prompter>) -> PromptHandler {
    Arc::new(move |request: &PromptRequest| prompter.confirm(&request.message, request.default))
}
