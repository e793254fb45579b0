//! Work dispatcher
//!
//! The dispatcher owns this node's slice of the manifest and the worker pool.
//! Entries flow through a bounded chunk queue (multi-producer from the feeder
//! and the manifest broadcast path, multi-consumer across workers); the queue
//! bound is the backpressure: producers block while no free slot exists.
//!
//! Each document walks a monotonic state machine:
//! `pending → reserved → parsing → staging → writing → done`, with `failed`
//! as a sink from any state except `done`, and a direct `reserved → done`
//! edge for cache hits.

use crate::manifest::ManifestEntry;
use crate::Result;
use crossbeam::channel::{bounded, Receiver, Sender};
use std::fmt;

/// Chunks queued between the feeder and the workers
pub type Chunk = Vec<ManifestEntry>;

/// How many chunks may sit in the queue before producers block
const QUEUE_DEPTH_CHUNKS: usize = 4;

/// Per-document processing state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocState {
    Pending,
    Reserved,
    Parsing,
    Staging,
    Writing,
    Done,
    Failed,
}

impl DocState {
    /// Whether `self → next` is a legal transition
    pub fn can_advance_to(self, next: DocState) -> bool {
        use DocState::*;
        match (self, next) {
            (Pending, Reserved)
            | (Reserved, Parsing)
            | (Parsing, Staging)
            | (Staging, Writing)
            | (Writing, Done)
            // Cache hit skips the parse entirely
            | (Reserved, Done) => true,
            // Failure is a sink from everywhere but done
            (from, Failed) => from != Done && from != Failed,
            _ => false,
        }
    }
}

impl fmt::Display for DocState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DocState::Pending => "pending",
            DocState::Reserved => "reserved",
            DocState::Parsing => "parsing",
            DocState::Staging => "staging",
            DocState::Writing => "writing",
            DocState::Done => "done",
            DocState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracker enforcing monotonic transitions for one document
#[derive(Debug)]
pub struct DocTracker {
    state: DocState,
}

impl DocTracker {
    pub fn new() -> Self {
        Self {
            state: DocState::Pending,
        }
    }

    pub fn state(&self) -> DocState {
        self.state
    }

    /// Advance, panicking in debug builds on an illegal transition; illegal
    /// transitions in release builds are coerced to `Failed` and reported by
    /// the caller as an internal bug.
    pub fn advance(&mut self, next: DocState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            debug_assert!(false, "illegal transition {} -> {}", self.state, next);
            anyhow::bail!("illegal document state transition {} -> {}", self.state, next);
        }
        self.state = next;
        Ok(())
    }
}

impl Default for DocTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The bounded chunk queue between feeder and workers
pub struct ChunkQueue {
    tx: Sender<Chunk>,
    rx: Receiver<Chunk>,
}

impl ChunkQueue {
    pub fn new() -> Self {
        let (tx, rx) = bounded(QUEUE_DEPTH_CHUNKS);
        Self { tx, rx }
    }

    pub fn sender(&self) -> Sender<Chunk> {
        self.tx.clone()
    }

    pub fn receiver(&self) -> Receiver<Chunk> {
        self.rx.clone()
    }

    /// Drop the queue-owned sender so workers drain and exit once the
    /// feeder's clone is gone too
    pub fn close(self) -> Receiver<Chunk> {
        self.rx
    }
}

impl Default for ChunkQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Split an assignment into dispatcher chunks and feed the queue.
///
/// Blocks on the bounded queue for backpressure; returns when every chunk is
/// queued or every receiver is gone (shutdown).
pub fn feed_chunks(entries: Vec<ManifestEntry>, chunk_size: usize, tx: Sender<Chunk>) {
    let mut chunk = Vec::with_capacity(chunk_size);
    for entry in entries {
        chunk.push(entry);
        if chunk.len() == chunk_size {
            if tx.send(std::mem::replace(&mut chunk, Vec::with_capacity(chunk_size))).is_err() {
                return;
            }
        }
    }
    if !chunk.is_empty() {
        let _ = tx.send(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn entries(n: usize) -> Vec<ManifestEntry> {
        (0..n)
            .map(|i| ManifestEntry::plain(PathBuf::from(format!("/d/{}.pdf", i))))
            .collect()
    }

    #[test]
    fn happy_path_transitions() {
        let mut t = DocTracker::new();
        for next in [
            DocState::Reserved,
            DocState::Parsing,
            DocState::Staging,
            DocState::Writing,
            DocState::Done,
        ] {
            t.advance(next).unwrap();
        }
        assert_eq!(t.state(), DocState::Done);
    }

    #[test]
    fn cache_hit_shortcut() {
        let mut t = DocTracker::new();
        t.advance(DocState::Reserved).unwrap();
        t.advance(DocState::Done).unwrap();
    }

    #[test]
    fn failed_is_a_sink_except_from_done() {
        for from in [
            DocState::Pending,
            DocState::Reserved,
            DocState::Parsing,
            DocState::Staging,
            DocState::Writing,
        ] {
            assert!(from.can_advance_to(DocState::Failed), "{} -> failed", from);
        }
        assert!(!DocState::Done.can_advance_to(DocState::Failed));
        assert!(!DocState::Failed.can_advance_to(DocState::Reserved));
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn illegal_transition_is_an_error() {
        let mut t = DocTracker::new();
        assert!(t.advance(DocState::Writing).is_err());
    }

    #[test]
    fn chunks_preserve_order_and_cover_everything() {
        let queue = ChunkQueue::new();
        let tx = queue.sender();
        let rx = queue.close();
        let feeder = std::thread::spawn(move || feed_chunks(entries(10), 4, tx));

        let mut seen = Vec::new();
        while let Ok(chunk) = rx.recv() {
            assert!(chunk.len() <= 4);
            seen.extend(chunk.into_iter().map(|e| e.path));
        }
        feeder.join().unwrap();
        assert_eq!(seen.len(), 10);
        assert_eq!(seen[0], PathBuf::from("/d/0.pdf"));
        assert_eq!(seen[9], PathBuf::from("/d/9.pdf"));
    }

    #[test]
    fn bounded_queue_applies_backpressure() {
        let queue = ChunkQueue::new();
        let tx = queue.sender();
        let rx = queue.close();
        // Fill the queue beyond its bound from a thread; it must block until
        // we drain.
        let feeder = std::thread::spawn(move || {
            feed_chunks(entries(100), 1, tx);
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        let mut drained = 0;
        while let Ok(_) = rx.recv_timeout(std::time::Duration::from_millis(200)) {
            drained += 1;
        }
        feeder.join().unwrap();
        assert_eq!(drained, 100);
    }
}
