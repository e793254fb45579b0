//! L1 per-node result cache
//!
//! An embedded LMDB store with memory-mapped zero-copy reads, ACID
//! transactions, and a configurable map size (default 10 GiB). LMDB is
//! natively single-writer/multi-reader; the dispatcher additionally
//! designates one writer thread per node, and workers submit store requests
//! over a node-local channel. The writer batches pending stores into one
//! write transaction and acknowledges after commit, so an acknowledged store
//! is durable.
//!
//! Lookups are O(log n) B-tree descents against the reader's snapshot;
//! `count()` reads the entry cardinality from the database stat without
//! scanning.

use super::CachedDocument;
use crate::Result;
use anyhow::Context;
use crossbeam::channel::{bounded, Sender};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use std::path::Path;
use std::thread::JoinHandle;
use tracing::{error, warn};

/// Pending stores drained into a single write transaction
const WRITE_BATCH: usize = 64;

/// Store request submitted to the designated writer thread
struct StoreRequest {
    key: Vec<u8>,
    value: Vec<u8>,
    ack: Sender<()>,
}

/// Handle to the node's L1 cache
///
/// Cloning shares the environment (readers are per-call transactions) and the
/// store channel. The writer thread exits when every handle is dropped.
#[derive(Clone)]
pub struct L1Cache {
    env: Env,
    db: Database<Bytes, Bytes>,
    store_tx: Sender<StoreRequest>,
}

impl L1Cache {
    /// Open (or create) the cache under `dir` with the given map size
    pub fn open(dir: &Path, map_size_mb: u64) -> Result<(Self, L1Writer)> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create cache dir: {}", dir.display()))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size((map_size_mb as usize) * 1024 * 1024)
                .max_dbs(1)
                .open(dir)
        }
        .with_context(|| format!("Failed to open L1 cache env: {}", dir.display()))?;

        let mut wtxn = env.write_txn().context("Failed to begin L1 init txn")?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("results"))
            .context("Failed to create L1 results database")?;
        wtxn.commit().context("Failed to commit L1 init txn")?;

        let (store_tx, store_rx) = bounded::<StoreRequest>(WRITE_BATCH * 4);
        let writer_env = env.clone();
        let writer_db = db;
        let handle = std::thread::Builder::new()
            .name("l1-writer".to_string())
            .spawn(move || {
                writer_loop(writer_env, writer_db, store_rx);
            })
            .context("Failed to spawn L1 writer thread")?;

        Ok((
            Self { env, db, store_tx },
            L1Writer {
                handle: Some(handle),
            },
        ))
    }

    /// Look up a cached document. A miss (or a decode failure) returns `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<CachedDocument>> {
        let rtxn = self.env.read_txn().context("Failed to begin L1 read txn")?;
        // Zero-copy: the value slice borrows the mmap until the txn drops
        match self.db.get(&rtxn, key).context("L1 lookup failed")? {
            Some(blob) => Ok(CachedDocument::from_bytes(blob)),
            None => Ok(None),
        }
    }

    /// Submit a store to the designated writer and wait for the commit ack
    pub fn put(&self, key: Vec<u8>, doc: &CachedDocument) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.store_tx
            .send(StoreRequest {
                key,
                value: doc.to_bytes(),
                ack: ack_tx,
            })
            .context("L1 writer channel closed")?;
        ack_rx.recv().context("L1 writer dropped the ack")?;
        Ok(())
    }

    /// Entry cardinality without scanning
    pub fn count(&self) -> Result<u64> {
        let rtxn = self.env.read_txn().context("Failed to begin L1 read txn")?;
        Ok(self.db.len(&rtxn).context("L1 stat failed")?)
    }
}

/// Owner of the writer thread; dropping joins it after the last sender closes
pub struct L1Writer {
    handle: Option<JoinHandle<()>>,
}

impl L1Writer {
    /// Join the writer after all cache handles (and their senders) are gone
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for L1Writer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn writer_loop(
    env: Env,
    db: Database<Bytes, Bytes>,
    store_rx: crossbeam::channel::Receiver<StoreRequest>,
) {
    loop {
        // Block for the first request, then drain a bounded batch
        let first = match store_rx.recv() {
            Ok(req) => req,
            Err(_) => return,
        };
        let mut batch = vec![first];
        while batch.len() < WRITE_BATCH {
            match store_rx.try_recv() {
                Ok(req) => batch.push(req),
                Err(_) => break,
            }
        }

        let mut wtxn = match env.write_txn() {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "L1 write txn failed; dropping {} stores", batch.len());
                continue;
            }
        };
        let mut failed = false;
        for req in &batch {
            if let Err(e) = db.put(&mut wtxn, &req.key, &req.value) {
                warn!(error = %e, "L1 put failed");
                failed = true;
                break;
            }
        }
        if failed {
            drop(wtxn);
            continue;
        }
        match wtxn.commit() {
            Ok(()) => {
                for req in batch {
                    let _ = req.ack.send(());
                }
            }
            Err(e) => {
                error!(error = %e, "L1 commit failed; dropping {} stores", batch.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{ContentKind, ParseResult, ParseStatus};

    fn sample_doc(words: i64) -> CachedDocument {
        let mut parse = ParseResult::new(ParseStatus::Ok, ContentKind::Pdf);
        parse.word_count = words;
        parse.set_sha256(&"ab".repeat(32));
        parse.set_mime_type("application/pdf");
        CachedDocument {
            parse,
            stage_record: vec![9, 9, 9],
        }
    }

    #[test]
    fn put_get_count_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, writer) = L1Cache::open(dir.path(), 64).unwrap();

        assert!(cache.get(b"missing").unwrap().is_none());
        assert_eq!(cache.count().unwrap(), 0);

        cache.put(b"doc-1".to_vec(), &sample_doc(10)).unwrap();
        cache.put(b"doc-2".to_vec(), &sample_doc(20)).unwrap();

        let hit = cache.get(b"doc-1").unwrap().unwrap();
        assert_eq!(hit.parse.word_count, 10);
        assert_eq!(hit.stage_record, vec![9, 9, 9]);
        assert_eq!(cache.count().unwrap(), 2);

        drop(cache);
        writer.join();
    }

    #[test]
    fn reopen_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (cache, writer) = L1Cache::open(dir.path(), 64).unwrap();
            cache.put(b"persist".to_vec(), &sample_doc(7)).unwrap();
            drop(cache);
            writer.join();
        }
        let (cache, writer) = L1Cache::open(dir.path(), 64).unwrap();
        assert_eq!(cache.get(b"persist").unwrap().unwrap().parse.word_count, 7);
        drop(cache);
        writer.join();
    }

    #[test]
    fn concurrent_readers_during_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, writer) = L1Cache::open(dir.path(), 64).unwrap();
        let mut threads = Vec::new();
        for t in 0..4 {
            let cache = cache.clone();
            threads.push(std::thread::spawn(move || {
                for i in 0..25 {
                    let key = format!("k-{}-{}", t, i).into_bytes();
                    cache.put(key.clone(), &sample_doc(i)).unwrap();
                    assert!(cache.get(&key).unwrap().is_some());
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(cache.count().unwrap(), 100);
        drop(cache);
        writer.join();
    }
}
