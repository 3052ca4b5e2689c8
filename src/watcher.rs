//! Filesystem watch over the message tree
//!
//! Raw notify events are funnelled through one channel into a background
//! thread that debounces them per session id. A stop signal travels on the
//! same channel so the thread exits deterministically.

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{OcsightError, Result};
use crate::session_index::session_id_from;
use crate::session_loader::ActiveSlot;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

pub type ChangeCallback = Box<dyn Fn(&str) + Send + 'static>;

enum Signal {
    Fs(notify::Result<notify::Event>),
    Stop,
}

/// Per-key quiet-period tracker
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<String, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Record activity for `id`, restarting its quiet period
    pub fn touch(&mut self, id: &str, now: Instant) {
        self.pending.insert(id.to_string(), now);
    }

    /// Ids whose last activity is at least one window old; they are removed
    pub fn settled(&mut self, now: Instant) -> Vec<String> {
        let window = self.window;
        let mut ready: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, last)| now.duration_since(**last) >= window)
            .map(|(id, _)| id.clone())
            .collect();
        ready.sort();
        for id in &ready {
            self.pending.remove(id);
        }
        ready
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Session ids touched by an event on `msg_*` files
fn sessions_in(event: &notify::Event) -> Vec<String> {
    let mut ids: Vec<String> = event
        .paths
        .iter()
        .filter_map(|p| p.to_str())
        .filter(|p| p.contains("msg_"))
        .filter_map(session_id_from)
        .collect();
    ids.dedup();
    ids
}

fn run_loop(receiver: Receiver<Signal>, slot: ActiveSlot, window: Duration, on_change: ChangeCallback) {
    let mut debouncer = Debouncer::new(window);
    let tick = (window / 4).max(Duration::from_millis(10));

    loop {
        let timeout = if debouncer.is_idle() {
            Duration::from_secs(3600)
        } else {
            tick
        };

        match receiver.recv_timeout(timeout) {
            Ok(Signal::Fs(Ok(event))) => {
                let now = Instant::now();
                for id in sessions_in(&event) {
                    if slot.invalidate(&id) {
                        debug!(session_id = %id, "active session invalidated");
                    }
                    debouncer.touch(&id, now);
                }
            }
            Ok(Signal::Fs(Err(e))) => warn!("Watch error: {}", e),
            Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        for id in debouncer.settled(Instant::now()) {
            on_change(&id);
        }
    }
}

pub struct SessionWatcher {
    watcher: Option<RecommendedWatcher>,
    sender: Sender<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl SessionWatcher {
    /// Watch `<data_dir>/storage/message` and call `on_change` once per
    /// settled burst of writes to a session
    pub fn start(data_dir: &Path, slot: ActiveSlot, on_change: ChangeCallback) -> Result<Self> {
        Self::start_with(data_dir, slot, DEFAULT_DEBOUNCE, on_change)
    }

    pub fn start_with(
        data_dir: &Path,
        slot: ActiveSlot,
        window: Duration,
        on_change: ChangeCallback,
    ) -> Result<Self> {
        let root = data_dir.join("storage").join("message");
        let (mut watcher, sender) = Self::spawn(slot, window, on_change)?;
        let notify_watcher = {
            let forward = sender.clone();
            let mut w = RecommendedWatcher::new(
                move |res| {
                    // receiver gone means the watcher is shutting down
                    let _ = forward.send(Signal::Fs(res));
                },
                Config::default(),
            )
            .map_err(|e| OcsightError::other(format!("Failed to create watcher: {}", e)))?;
            w.watch(&root, RecursiveMode::Recursive).map_err(|e| {
                OcsightError::other(format!("Failed to watch {}: {}", root.display(), e))
            })?;
            w
        };
        watcher.watcher = Some(notify_watcher);
        debug!(path = %root.display(), "watching message tree");
        Ok(watcher)
    }

    fn spawn(
        slot: ActiveSlot,
        window: Duration,
        on_change: ChangeCallback,
    ) -> Result<(Self, Sender<Signal>)> {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("ocsight-watcher".into())
            .spawn(move || run_loop(receiver, slot, window, on_change))?;
        Ok((
            Self {
                watcher: None,
                sender: sender.clone(),
                handle: Some(handle),
            },
            sender,
        ))
    }

    /// Stop listening and join the debounce thread. Safe to call twice.
    pub fn stop(&mut self) {
        self.watcher.take();
        let _ = self.sender.send(Signal::Stop);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("watcher thread panicked");
            }
        }
    }
}

impl Drop for SessionWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
