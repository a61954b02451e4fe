//! Helpers for running child processes with timeouts and bounded output.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long to keep draining pipes after a kill before giving up on them.
const DRAIN_AFTER_KILL: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// Killed because no output arrived within the inactivity window.
    pub inactive: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Killed by either timeout.
    pub fn was_killed(&self) -> bool {
        self.timed_out || self.inactive
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub timeout: Duration,
    pub inactivity_timeout: Option<Duration>,
    pub output_limit_bytes: usize,
}

/// Which pipe a streamed line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        if let Err(e) = child_stdin.write_all(input) {
            // The child may exit without reading everything; its status tells the story.
            warn!(err = %e, "failed to write child stdin");
        }
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        inactive: false,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

enum StreamEvent {
    Line(StreamSource, Vec<u8>),
    /// One reader reached end of file.
    Closed,
}

/// Run a command, handing every output line to `on_line` as it arrives.
///
/// Besides the overall timeout, the child is killed when neither pipe produces a
/// line for `inactivity_timeout`. Captured output is bounded the same way as
/// [`run_command_with_timeout`].
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), inactivity_secs = ?limits.inactivity_timeout.map(|d| d.as_secs())))]
pub fn run_command_streaming(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    limits: ProcessLimits,
    on_line: &mut dyn FnMut(StreamSource, &str),
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning streaming child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel();
    spawn_line_reader(stdout, StreamSource::Stdout, tx.clone());
    spawn_line_reader(stderr, StreamSource::Stderr, tx);

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        if let Err(e) = child_stdin.write_all(input) {
            warn!(err = %e, "failed to write child stdin");
        }
    }

    let started = Instant::now();
    let mut last_activity = started;
    let mut open_streams = 2;
    let mut capture = Capture::new(limits.output_limit_bytes);
    let mut timed_out = false;
    let mut inactive = false;

    while open_streams > 0 {
        let now = Instant::now();
        let overall_left = limits.timeout.saturating_sub(now - started);
        let idle_left = limits
            .inactivity_timeout
            .map(|window| window.saturating_sub(now - last_activity));
        if overall_left.is_zero() {
            timed_out = true;
            break;
        }
        if idle_left.is_some_and(|left| left.is_zero()) {
            inactive = true;
            break;
        }
        let wait = idle_left.map_or(overall_left, |left| left.min(overall_left));

        match rx.recv_timeout(wait) {
            Ok(StreamEvent::Line(source, line)) => {
                last_activity = Instant::now();
                capture.push(source, &line);
                let text = String::from_utf8_lossy(&line);
                on_line(source, text.trim_end_matches(['\n', '\r']));
            }
            Ok(StreamEvent::Closed) => open_streams -= 1,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = if timed_out || inactive {
        warn!(timed_out, inactive, "command exceeded its time limits, killing");
        child.kill().context("kill command")?;
        let status = child.wait().context("wait command after kill")?;
        // Grandchildren may still hold the pipes; drain briefly, then let the readers go.
        let deadline = Instant::now() + DRAIN_AFTER_KILL;
        while open_streams > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(left) {
                Ok(StreamEvent::Line(source, line)) => {
                    capture.push(source, &line);
                    let text = String::from_utf8_lossy(&line);
                    on_line(source, text.trim_end_matches(['\n', '\r']));
                }
                Ok(StreamEvent::Closed) => open_streams -= 1,
                Err(_) => break,
            }
        }
        status
    } else {
        let left = limits.timeout.saturating_sub(started.elapsed());
        match child.wait_timeout(left).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!("command kept running after closing its output, killing");
                timed_out = true;
                child.kill().context("kill command")?;
                child.wait().context("wait command after kill")?
            }
        }
    };

    if capture.stdout_truncated > 0 || capture.stderr_truncated > 0 {
        warn!(
            stdout_truncated = capture.stdout_truncated,
            stderr_truncated = capture.stderr_truncated,
            "output truncated"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, inactive, "streaming command finished");
    Ok(CommandOutput {
        status,
        stdout: capture.stdout,
        stderr: capture.stderr,
        stdout_truncated: capture.stdout_truncated,
        stderr_truncated: capture.stderr_truncated,
        timed_out,
        inactive,
    })
}

fn spawn_line_reader<R: Read + Send + 'static>(
    reader: R,
    source: StreamSource,
    tx: mpsc::Sender<StreamEvent>,
) {
    thread::spawn(move || {
        let mut buf_reader = BufReader::new(reader);
        loop {
            let mut line = Vec::new();
            match buf_reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(StreamEvent::Line(source, line)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(err = %e, ?source, "failed to read child output");
                    break;
                }
            }
        }
        let _ = tx.send(StreamEvent::Closed);
    });
}

struct Capture {
    limit: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_truncated: usize,
    stderr_truncated: usize,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: 0,
            stderr_truncated: 0,
        }
    }

    fn push(&mut self, source: StreamSource, line: &[u8]) {
        let (buf, truncated) = match source {
            StreamSource::Stdout => (&mut self.stdout, &mut self.stdout_truncated),
            StreamSource::Stderr => (&mut self.stderr, &mut self.stderr_truncated),
        };
        let remaining = self.limit.saturating_sub(buf.len());
        let keep = line.len().min(remaining);
        buf.extend_from_slice(&line[..keep]);
        *truncated += line.len() - keep;
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn limits(timeout_ms: u64, inactivity_ms: Option<u64>) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_millis(timeout_ms),
            inactivity_timeout: inactivity_ms.map(Duration::from_millis),
            output_limit_bytes: 1024,
        }
    }

    #[test]
    fn captures_output_and_stdin() {
        let output = run_command_with_timeout(
            sh("cat; echo err >&2"),
            Some(b"hello\n"),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout_lossy(), "hello\n");
        assert_eq!(output.stderr_lossy(), "err\n");
        assert!(!output.was_killed());
    }

    #[test]
    fn truncates_beyond_limit() {
        let output =
            run_command_with_timeout(sh("printf 'abcdef'"), None, Duration::from_secs(10), 3)
                .expect("run");
        assert_eq!(output.stdout, b"abc");
        assert_eq!(output.stdout_truncated, 3);
    }

    #[test]
    fn streams_lines_in_order() {
        let mut seen = Vec::new();
        let output = run_command_streaming(
            sh("echo one; echo two; echo oops >&2"),
            None,
            limits(10_000, Some(5_000)),
            &mut |source, line| seen.push((source, line.to_string())),
        )
        .expect("run");
        assert!(output.status.success());
        let stdout: Vec<_> = seen
            .iter()
            .filter(|(source, _)| *source == StreamSource::Stdout)
            .map(|(_, line)| line.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "two"]);
        assert!(seen.contains(&(StreamSource::Stderr, "oops".to_string())));
    }

    #[test]
    fn silent_child_is_killed_for_inactivity() {
        let output = run_command_streaming(
            sh("echo started; exec sleep 5"),
            None,
            limits(10_000, Some(200)),
            &mut |_, _| {},
        )
        .expect("run");
        assert!(output.inactive);
        assert!(!output.timed_out);
        assert_eq!(output.stdout_lossy(), "started\n");
    }

    #[test]
    fn overall_timeout_applies_while_streaming() {
        let output = run_command_streaming(
            sh("while true; do echo tick; sleep 0.05; done"),
            None,
            limits(300, Some(5_000)),
            &mut |_, _| {},
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
    }
}
