//! Exit-time cleanup callbacks and termination-signal handling.
//!
//! Callbacks live in an explicit [`CleanupRegistry`] rather than process-global
//! state. [`CleanupRegistry::listen_for_signals`] must be called before any other
//! thread is spawned: it blocks SIGINT/SIGTERM/SIGHUP in the calling thread so
//! that every later thread inherits the mask, and a dedicated thread receives the
//! signal synchronously, runs the callbacks and exits with `128 + signo`.
//! Child processes start with a clean mask (std resets it on spawn).

use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};
use nix::sys::signal::{SigSet, Signal};
use tracing::{debug, warn};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Callbacks {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

/// Handle returned by [`CleanupRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupToken(u64);

#[derive(Clone, Default)]
pub struct CleanupRegistry {
    inner: Arc<Mutex<Callbacks>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: impl FnOnce() + Send + 'static) -> CleanupToken {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.push((id, Box::new(callback)));
        CleanupToken(id)
    }

    /// Remove a callback without running it.
    pub fn unregister(&self, token: CleanupToken) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.entries.retain(|(id, _)| *id != token.0);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run and drop every callback, most recently registered first.
    pub fn run_all(&self) {
        let entries = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut inner.entries)
        };
        debug!(count = entries.len(), "running cleanup callbacks");
        for (_, callback) in entries.into_iter().rev() {
            callback();
        }
    }

    /// Route SIGINT/SIGTERM/SIGHUP to a thread that runs cleanup and exits.
    pub fn listen_for_signals(&self) -> Result<()> {
        let mut set = SigSet::empty();
        for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            set.add(signal);
        }
        set.thread_block().context("block termination signals")?;

        let registry = self.clone();
        thread::Builder::new()
            .name("planloop-signals".to_string())
            .spawn(move || match set.wait() {
                Ok(signal) => {
                    warn!(signal = ?signal, "received termination signal, cleaning up");
                    registry.run_all();
                    std::process::exit(128 + signal as i32);
                }
                Err(err) => warn!(err = %err, "waiting for signals failed"),
            })
            .context("spawn signal thread")?;
        Ok(())
    }
}
