//! User-facing output: printed locally or forwarded through the tunnel.

use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::io::tunnel::{TunnelClient, TunnelMessage, print_locally};

/// Where user-facing output goes. Cheap to clone.
#[derive(Debug, Clone)]
pub enum Output {
    Local,
    Tunnel(Arc<TunnelClient>),
    /// In-memory sink for tests and for capturing a rendered summary.
    Buffer(Arc<Mutex<String>>),
}

impl Output {
    /// Forward to the enclosing process when a tunnel socket is advertised.
    pub fn from_env() -> Self {
        match TunnelClient::from_env() {
            None => Output::Local,
            Some(Ok(client)) => Output::Tunnel(Arc::new(client)),
            Some(Err(err)) => {
                warn!(err = %format!("{err:#}"), "tunnel socket unreachable, printing locally");
                Output::Local
            }
        }
    }

    pub fn buffer() -> (Self, Arc<Mutex<String>>) {
        let buf = Arc::new(Mutex::new(String::new()));
        (Output::Buffer(Arc::clone(&buf)), buf)
    }

    pub fn is_tunneled(&self) -> bool {
        matches!(self, Output::Tunnel(_))
    }

    pub fn tunnel_client(&self) -> Option<Arc<TunnelClient>> {
        match self {
            Output::Tunnel(client) => Some(Arc::clone(client)),
            _ => None,
        }
    }

    /// One line to stdout.
    pub fn line(&self, text: &str) {
        self.emit(TunnelMessage::Stdout {
            data: format!("{text}\n"),
        });
    }

    /// One line to stderr.
    pub fn error_line(&self, text: &str) {
        self.emit(TunnelMessage::Stderr {
            data: format!("{text}\n"),
        });
    }

    /// A status message (step headers, warnings shown to the user).
    pub fn log(&self, text: &str) {
        self.emit(TunnelMessage::Log {
            message: text.to_string(),
        });
    }

    /// Re-emit a message received from a nested process.
    pub fn forward(&self, message: &TunnelMessage) {
        if !matches!(message, TunnelMessage::PromptRequest { .. }) {
            self.emit(message.clone());
        }
    }

    fn emit(&self, message: TunnelMessage) {
        match self {
            Output::Local => print_locally(&message),
            Output::Tunnel(client) => {
                if let Err(err) = client.send(&message) {
                    warn!(err = %format!("{err:#}"), "tunnel send failed, printing locally");
                    print_locally(&message);
                }
            }
            Output::Buffer(buf) => {
                let mut buf = match buf.lock() {
                    Ok(buf) => buf,
                    Err(poisoned) => poisoned.into_inner(),
                };
                match &message {
                    TunnelMessage::Stdout { data } | TunnelMessage::Stderr { data } => {
                        buf.push_str(data);
                    }
                    TunnelMessage::Log { message } => {
                        buf.push_str(message);
                        buf.push('\n');
                    }
                    TunnelMessage::Structured { event } => {
                        buf.push_str(&event.to_string());
                        buf.push('\n');
                    }
                    TunnelMessage::PromptRequest { .. } => {}
                }
            }
        }
    }
}
