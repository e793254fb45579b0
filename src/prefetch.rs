//! I/O prefetcher
//!
//! Sliding-window read-ahead for the upcoming manifest entries on a worker.
//! The worker schedules the paths of its current chunk; a background thread
//! reads file bytes ahead of the consumer, keeping at most `window` files
//! resident. `take` hands the bytes over (or falls back to a direct read on
//! any prefetch miss), so a prefetcher failure can slow the pipeline but
//! never change its behavior.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

struct PrefetchState {
    /// Loaded bytes (or the read error, reported on take)
    loaded: HashMap<PathBuf, std::io::Result<Vec<u8>>>,
    /// Paths scheduled and not yet loaded
    queue: Vec<PathBuf>,
    /// Paths the consumer took over mid-load; their late results are dropped
    /// instead of occupying window slots
    abandoned: HashSet<PathBuf>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PrefetchState>,
    cond: Condvar,
    window: usize,
}

/// Per-worker read-ahead
pub struct Prefetcher {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Prefetcher {
    pub fn new(window: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PrefetchState {
                loaded: HashMap::new(),
                queue: Vec::new(),
                abandoned: HashSet::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
            window: window.max(1),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("prefetcher".to_string())
            .spawn(move || prefetch_loop(thread_shared))
            .expect("failed to spawn prefetcher thread");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Queue upcoming paths for read-ahead
    pub fn schedule(&self, paths: impl IntoIterator<Item = PathBuf>) {
        let mut state = self.shared.state.lock().unwrap();
        state.queue.extend(paths);
        self.shared.cond.notify_all();
    }

    /// Take the bytes for `path`, falling back to a direct read when the
    /// prefetcher has not loaded it (or failed to)
    pub fn take(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(result) = state.loaded.remove(path) {
                self.shared.cond.notify_all();
                return result;
            }
            // Still queued: dequeue it and read directly. Neither queued nor
            // loaded: a load is in flight, mark it so the late result is
            // dropped instead of occupying a window slot.
            let was_queued = state.queue.iter().any(|p| p == path);
            if was_queued {
                state.queue.retain(|p| p != path);
            } else {
                state.abandoned.insert(path.to_path_buf());
            }
        }
        std::fs::read(path)
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn prefetch_loop(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutdown {
                    return;
                }
                // Window full or nothing queued: wait
                if state.loaded.len() < shared.window && !state.queue.is_empty() {
                    break;
                }
                state = shared.cond.wait(state).unwrap();
            }
            state.queue.remove(0)
        };

        let bytes = std::fs::read(&next);
        let mut state = shared.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        if !state.abandoned.remove(&next) {
            state.loaded.insert(next, bytes);
        }
        shared.cond.notify_all();
    }
}
