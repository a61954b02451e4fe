//! Diagnostic tracing for planloop.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG`, output to stderr.
//!   Never forwarded through the output tunnel.
//!
//! - **User output (`io/output`)**: Step headers, agent output and summaries.
//!   Printed locally or forwarded to the top-level process.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn`, or `planloop=info` when `verbose` is set.
///
/// # Example
/// ```bash
/// RUST_LOG=planloop=debug planloop agent 12
/// ```
/// Fails when a global subscriber is already installed.
pub fn init(verbose: bool) -> Result<()> {
    let fallback = if verbose { "warn,planloop=info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init()
        .context("install tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_reports_an_error() {
        // The first call may fail too if another test in this binary got there first.
        let _ = init(false);
        let err = init(true).unwrap_err();
        assert!(format!("{err:#}").contains("install tracing subscriber"));
    }
}
