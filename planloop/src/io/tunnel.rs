//! Local output tunnel between nested planloop processes.
//!
//! The outermost process owns the terminal and listens on a Unix socket whose
//! path is exported to children as [`TUNNEL_SOCKET_ENV`]. A nested process that
//! finds the variable connects and sends newline-delimited JSON
//! [`TunnelMessage`]s instead of printing. A `prompt_request` is answered on the
//! same connection with a [`TunnelReply::PromptResponse`].

use std::fs;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;
use tracing::{debug, warn};

pub const TUNNEL_SOCKET_ENV: &str = "PLANLOOP_OUTPUT_SOCKET";

const SOCKET_FILE_NAME: &str = "output.sock";
const POLL_INTERVAL: Duration = Duration::from_millis(25);
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Client → server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelMessage {
    Log { message: String },
    Stdout { data: String },
    Stderr { data: String },
    Structured { event: Value },
    PromptRequest {
        request_id: u64,
        message: String,
        default: bool,
    },
}

/// Server → client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelReply {
    PromptResponse {
        request_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub message: String,
    pub default: bool,
}

pub type PromptHandler = Arc<dyn Fn(&PromptRequest) -> Result<bool> + Send + Sync>;
pub type OutputSink = Arc<dyn Fn(&TunnelMessage) + Send + Sync>;

#[derive(Clone)]
pub struct TunnelServerOptions {
    /// Answers prompt requests. Without one, requests get an error reply.
    pub on_prompt_request: Option<PromptHandler>,
    /// Receives every non-prompt message.
    pub on_output: OutputSink,
}

impl Default for TunnelServerOptions {
    fn default() -> Self {
        Self {
            on_prompt_request: None,
            on_output: Arc::new(print_locally),
        }
    }
}

/// Write a forwarded message to this process's stdout/stderr.
pub fn print_locally(message: &TunnelMessage) {
    match message {
        TunnelMessage::Stdout { data } => {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(data.as_bytes());
            let _ = stdout.flush();
        }
        TunnelMessage::Stderr { data } => {
            let mut stderr = std::io::stderr().lock();
            let _ = stderr.write_all(data.as_bytes());
            let _ = stderr.flush();
        }
        TunnelMessage::Log { message } => eprintln!("{message}"),
        TunnelMessage::Structured { event } => println!("{event}"),
        TunnelMessage::PromptRequest { .. } => {}
    }
}

type Workers = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// Listening tunnel endpoint. Closed explicitly or on drop.
pub struct TunnelServer {
    socket_path: PathBuf,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    workers: Workers,
    temp_dir: Option<TempDir>,
}

/// Bind a tunnel server at `socket_path`.
pub fn create_tunnel_server(socket_path: &Path, options: TunnelServerOptions) -> Result<TunnelServer> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .with_context(|| format!("remove leftover socket {}", socket_path.display()))?;
    }
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("bind tunnel socket {}", socket_path.display()))?;
    listener
        .set_nonblocking(true)
        .context("set tunnel listener non-blocking")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let workers: Workers = Arc::new(Mutex::new(Vec::new()));
    let accept_thread = {
        let shutdown = Arc::clone(&shutdown);
        let workers = Arc::clone(&workers);
        thread::Builder::new()
            .name("planloop-tunnel".to_string())
            .spawn(move || accept_loop(listener, options, shutdown, workers))
            .context("spawn tunnel accept thread")?
    };
    debug!(socket = %socket_path.display(), "tunnel server listening");

    Ok(TunnelServer {
        socket_path: socket_path.to_path_buf(),
        shutdown,
        accept_thread: Some(accept_thread),
        workers,
        temp_dir: None,
    })
}

/// Bind a tunnel server inside a fresh temporary directory, removed on close.
pub fn create_temp_tunnel_server(options: TunnelServerOptions) -> Result<TunnelServer> {
    let temp_dir = tempfile::Builder::new()
        .prefix("planloop-tunnel-")
        .tempdir()
        .context("create tunnel temp dir")?;
    let mut server = create_tunnel_server(&temp_dir.path().join(SOCKET_FILE_NAME), options)?;
    server.temp_dir = Some(temp_dir);
    Ok(server)
}

impl TunnelServer {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Environment entry handing the socket to child processes.
    pub fn env_entry(&self) -> (String, String) {
        (
            TUNNEL_SOCKET_ENV.to_string(),
            self.socket_path.display().to_string(),
        )
    }

    pub fn is_closed(&self) -> bool {
        self.accept_thread.is_none()
    }

    /// Stop accepting, drain open connections and remove the socket. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        let Some(accept_thread) = self.accept_thread.take() else {
            return Ok(());
        };
        self.shutdown.store(true, Ordering::SeqCst);
        if accept_thread.join().is_err() {
            warn!("tunnel accept thread panicked");
        }
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for worker in workers {
            if worker.join().is_err() {
                warn!("tunnel connection thread panicked");
            }
        }

        let mut result = Ok(());
        match fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                result = Err(anyhow!(err))
                    .with_context(|| format!("remove socket {}", self.socket_path.display()));
            }
        }
        if let Some(temp_dir) = self.temp_dir.take() {
            let path = temp_dir.path().to_path_buf();
            if let Err(err) = temp_dir.close() {
                result = Err(anyhow!(err))
                    .with_context(|| format!("remove tunnel dir {}", path.display()));
            }
        }
        debug!(socket = %self.socket_path.display(), "tunnel server closed");
        result
    }
}

impl Drop for TunnelServer {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(err = %format!("{err:#}"), "failed to close tunnel server");
        }
    }
}

fn accept_loop(
    listener: UnixListener,
    options: TunnelServerOptions,
    shutdown: Arc<AtomicBool>,
    workers: Workers,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let options = options.clone();
                let shutdown = Arc::clone(&shutdown);
                let spawned = thread::Builder::new()
                    .name("planloop-tunnel-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = serve_connection(stream, &options, &shutdown) {
                            warn!(err = %format!("{err:#}"), "tunnel connection failed");
                        }
                    });
                match spawned {
                    Ok(handle) => {
                        if let Ok(mut workers) = workers.lock() {
                            workers.push(handle);
                        }
                    }
                    Err(err) => warn!(err = %err, "failed to spawn tunnel connection thread"),
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(err) => {
                warn!(err = %err, "tunnel accept failed");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn serve_connection(
    stream: UnixStream,
    options: &TunnelServerOptions,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream
        .set_nonblocking(false)
        .context("set tunnel connection blocking")?;
    stream
        .set_read_timeout(Some(POLL_INTERVAL * 4))
        .context("set tunnel read timeout")?;
    let mut writer = stream.try_clone().context("clone tunnel stream")?;
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                if !buf.is_empty() {
                    handle_line(&buf, options, &mut writer)?;
                }
                return Ok(());
            }
            Ok(_) if buf.ends_with(b"\n") => {
                handle_line(&buf, options, &mut writer)?;
                buf.clear();
            }
            Ok(_) => {}
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                // Keep partial bytes; only give up once the server is closing.
                if shutdown.load(Ordering::SeqCst) {
                    return Ok(());
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err).context("read tunnel message"),
        }
        if buf.len() > MAX_LINE_BYTES {
            bail!("tunnel message exceeds {MAX_LINE_BYTES} bytes");
        }
    }
}

fn handle_line(line: &[u8], options: &TunnelServerOptions, writer: &mut UnixStream) -> Result<()> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }
    let message: TunnelMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(err = %err, "ignoring malformed tunnel message");
            return Ok(());
        }
    };

    match message {
        TunnelMessage::PromptRequest {
            request_id,
            message,
            default,
        } => {
            let request = PromptRequest { message, default };
            let reply = match &options.on_prompt_request {
                Some(handler) => match handler(&request) {
                    Ok(value) => TunnelReply::PromptResponse {
                        request_id,
                        value: Some(value),
                        error: None,
                    },
                    Err(err) => TunnelReply::PromptResponse {
                        request_id,
                        value: None,
                        error: Some(format!("{err:#}")),
                    },
                },
                None => TunnelReply::PromptResponse {
                    request_id,
                    value: None,
                    error: Some("no prompt handler on the tunnel server".to_string()),
                },
            };
            write_json_line(writer, &reply)
        }
        other => {
            (options.on_output)(&other);
            Ok(())
        }
    }
}

fn write_json_line<T: Serialize>(writer: &mut UnixStream, value: &T) -> Result<()> {
    let mut line = serde_json::to_string(value).context("serialize tunnel message")?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .context("write tunnel message")?;
    writer.flush().context("flush tunnel message")
}

/// Connection from a nested process to the outer tunnel server.
pub struct TunnelClient {
    socket_path: PathBuf,
    writer: Mutex<UnixStream>,
    reader: Mutex<BufReader<UnixStream>>,
    next_request_id: AtomicU64,
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl TunnelClient {
    pub fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .with_context(|| format!("connect to tunnel {}", socket_path.display()))?;
        let reader = stream.try_clone().context("clone tunnel stream")?;
        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            writer: Mutex::new(stream),
            reader: Mutex::new(BufReader::new(reader)),
            next_request_id: AtomicU64::new(1),
        })
    }

    /// Connect to the socket named by [`TUNNEL_SOCKET_ENV`], if set.
    pub fn from_env() -> Option<Result<Self>> {
        let path = std::env::var_os(TUNNEL_SOCKET_ENV)?;
        if path.is_empty() {
            return None;
        }
        Some(Self::connect(Path::new(&path)))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn send(&self, message: &TunnelMessage) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("tunnel writer lock poisoned"))?;
        write_json_line(&mut writer, message)
    }

    /// Ask the outer process to answer a yes/no prompt. Blocks until answered.
    pub fn request_prompt(&self, message: &str, default: bool) -> Result<bool> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        // Hold the reader across send + receive so concurrent prompts pair up.
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| anyhow!("tunnel reader lock poisoned"))?;
        self.send(&TunnelMessage::PromptRequest {
            request_id,
            message: message.to_string(),
            default,
        })?;

        let mut line = String::new();
        loop {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .context("read tunnel prompt response")?;
            if read == 0 {
                bail!("tunnel closed before answering prompt");
            }
            let reply: TunnelReply = match serde_json::from_str(line.trim()) {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(err = %err, "ignoring malformed tunnel reply");
                    continue;
                }
            };
            let TunnelReply::PromptResponse {
                request_id: id,
                value,
                error,
            } = reply;
            if id != request_id {
                debug!(expected = request_id, got = id, "skipping unrelated prompt response");
                continue;
            }
            return match (value, error) {
                (_, Some(error)) => Err(anyhow!("prompt failed in outer process: {error}")),
                (Some(value), None) => Ok(value),
                (None, None) => Err(anyhow!("prompt response carried no value")),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_options() -> (TunnelServerOptions, Arc<Mutex<Vec<TunnelMessage>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let options = TunnelServerOptions {
            on_prompt_request: Some(Arc::new(|request: &PromptRequest| {
                Ok(request.message.contains("yes"))
            })),
            on_output: Arc::new(move |message: &TunnelMessage| {
                sink.lock().expect("sink").push(message.clone());
            }),
        };
        (options, seen)
    }

    #[test]
    fn messages_use_type_tags() {
        let json = serde_json::to_string(&TunnelMessage::Stdout {
            data: "hi\n".to_string(),
        })
        .expect("serialize");
        assert_eq!(json, r#"{"type":"stdout","data":"hi\n"}"#);

        let reply: TunnelReply =
            serde_json::from_str(r#"{"type":"prompt_response","request_id":3,"value":true}"#)
                .expect("parse");
        assert_eq!(
            reply,
            TunnelReply::PromptResponse {
                request_id: 3,
                value: Some(true),
                error: None
            }
        );
    }

    #[test]
    fn forwards_output_and_answers_prompts() {
        let (options, seen) = collecting_options();
        let mut server = create_temp_tunnel_server(options).expect("server");
        let client = TunnelClient::connect(server.socket_path()).expect("client");

        client
            .send(&TunnelMessage::Stdout {
                data: "step 1\n".to_string(),
            })
            .expect("send");
        assert!(client.request_prompt("say yes?", false).expect("prompt"));
        assert!(!client.request_prompt("say no?", true).expect("prompt"));
        drop(client);

        server.close().expect("close");
        let seen = seen.lock().expect("seen");
        assert_eq!(
            *seen,
            vec![TunnelMessage::Stdout {
                data: "step 1\n".to_string()
            }]
        );
    }

    #[test]
    fn prompt_without_handler_is_an_error() {
        let server = create_temp_tunnel_server(TunnelServerOptions {
            on_prompt_request: None,
            on_output: Arc::new(|_: &TunnelMessage| {}),
        })
        .expect("server");
        let client = TunnelClient::connect(server.socket_path()).expect("client");
        let err = client.request_prompt("continue?", true).unwrap_err();
        assert!(err.to_string().contains("no prompt handler"));
    }

    #[test]
    fn close_removes_socket_and_temp_dir() {
        let mut server = create_temp_tunnel_server(TunnelServerOptions::default()).expect("server");
        let socket = server.socket_path().to_path_buf();
        let dir = socket.parent().expect("parent").to_path_buf();
        assert!(socket.exists());

        server.close().expect("close");
        server.close().expect("second close is a no-op");
        assert!(server.is_closed());
        assert!(!socket.exists());
        assert!(!dir.exists());
    }

    #[test]
    fn open_client_does_not_block_close() {
        let (options, _) = collecting_options();
        let mut server = create_temp_tunnel_server(options).expect("server");
        let _client = TunnelClient::connect(server.socket_path()).expect("client");
        server.close().expect("close with live client");
    }
}
