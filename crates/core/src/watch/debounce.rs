//! Per-path debouncing of change notifications.
//!
//! Each path has at most one pending deadline. A new notification for a path pushes its
//! deadline out to a full window from now; a deadline that passes without being pushed fires
//! the action once and is discarded. Actions run on the debouncer's worker thread, one at a
//! time, so actions for the same path never overlap.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error};
use parking_lot::{Condvar, Mutex, MutexGuard};

#[derive(Default)]
struct State {
    pending: HashMap<PathBuf, Instant>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

pub struct Debouncer {
    shared: Arc<Shared>,
    window: Duration,
    worker: Option<JoinHandle<()>>,
}

impl Debouncer {
    pub fn new<F>(window: Duration, action: F) -> Self
    where
        F: Fn(&Path) + Send + 'static,
    {
        let shared = Arc::new(Shared { state: Mutex::new(State::default()), wake: Condvar::new() });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("hotswap-debounce".into())
            .spawn(move || run_worker(&worker_shared, action))
            .map_err(|e| error!("Failed to start debounce worker: {e}"))
            .ok();
        Self { shared, window, worker }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a notification for `path`, (re)starting its window.
    pub fn add(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let deadline = Instant::now() + self.window;
        let mut state = self.shared.state.lock();
        if state.pending.insert(path.clone(), deadline).is_some() {
            debug!("Debounce window reset for {}", path.display());
        }
        drop(state);
        self.shared.wake.notify_one();
    }

    /// Number of paths waiting for their window to settle.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker<F: Fn(&Path)>(shared: &Shared, action: F) {
    let mut state = shared.state.lock();
    while !state.shutdown {
        let now = Instant::now();
        let due: Vec<PathBuf> = state
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        if !due.is_empty() {
            for path in &due {
                state.pending.remove(path);
            }
            MutexGuard::unlocked(&mut state, || {
                for path in &due {
                    action(path);
                }
            });
            continue;
        }

        match state.pending.values().min().copied() {
            Some(deadline) => {
                shared.wake.wait_until(&mut state, deadline);
            }
            None => shared.wake.wait(&mut state),
        }
    }
}
