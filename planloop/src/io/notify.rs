//! Run-finished notifications delivered to a user-configured command.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::io::config::NotificationConfig;
use crate::io::process::run_command_with_timeout;

const NOTIFY_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// JSON payload written to the command's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub event: String,
    pub plan_id: String,
    pub plan_title: String,
    pub status: String,
    pub message: String,
    pub workspace: String,
}

/// Deliver `event`. Returns `Ok(false)` when no command is configured.
#[instrument(skip_all, fields(event = %event.event, status = %event.status))]
pub fn send_notification(config: &NotificationConfig, event: &NotificationEvent, cwd: &Path) -> Result<bool> {
    let Some(argv) = config.command.as_deref() else {
        return Ok(false);
    };
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("notifications.command is empty"))?;

    let payload = serde_json::to_vec(event).context("serialize notification")?;
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    let output = run_command_with_timeout(
        cmd,
        Some(&payload),
        Duration::from_secs(config.timeout_secs),
        NOTIFY_OUTPUT_LIMIT_BYTES,
    )
    .with_context(|| format!("run notification command {program}"))?;

    if output.timed_out {
        bail!("notification command timed out after {}s", config.timeout_secs);
    }
    if !output.status.success() {
        bail!(
            "notification command exited with {:?}: {}",
            output.status.code(),
            output.stderr_lossy().trim()
        );
    }
    debug!("notification delivered");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> NotificationEvent {
        NotificationEvent {
            event: "agent_done".to_string(),
            plan_id: "12".to_string(),
            plan_title: "Search".to_string(),
            status: "completed".to_string(),
            message: "all tasks done".to_string(),
            workspace: "/tmp/ws".to_string(),
        }
    }

    #[test]
    fn unconfigured_is_a_no_op() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sent = send_notification(&NotificationConfig::default(), &event(), temp.path())
            .expect("notify");
        assert!(!sent);
    }

    #[test]
    fn command_receives_json_on_stdin() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = NotificationConfig {
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat > payload.json".to_string(),
            ]),
            timeout_secs: 10,
        };
        assert!(send_notification(&config, &event(), temp.path()).expect("notify"));
        let payload: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(temp.path().join("payload.json")).expect("read"),
        )
        .expect("json");
        assert_eq!(payload["plan_id"], "12");
        assert_eq!(payload["status"], "completed");
    }

    #[test]
    fn failing_command_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = NotificationConfig {
            command: Some(vec!["false".to_string()]),
            timeout_secs: 10,
        };
        assert!(send_notification(&config, &event(), temp.path()).is_err());
    }
}
