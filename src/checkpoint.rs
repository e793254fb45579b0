//! Checkpoint journal and resume
//!
//! Each node appends one line-delimited JSON record per completed document:
//! `{key, status, class?, ts}`. The journal is fsynced every
//! `checkpoint-interval-docs` documents (the worker flushes the output shards
//! first, preserving write-before-checkpoint ordering) and once at shutdown.
//! On startup with `resume=true` the journal is read back into a skip-set and
//! the dispatcher filters matching entries out of the local assignment; a
//! truncated final line from a crash is discarded.

use crate::abi::ParseStatus;
use crate::fault::FaultClass;
use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// One journal line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// Encoded L1 cache key
    pub key: String,
    pub status: ParseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<FaultClass>,
    /// Completed from the result cache without a parse
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cached: bool,
    pub ts: DateTime<Utc>,
}

impl CheckpointEntry {
    pub fn new(key: String, status: ParseStatus, class: Option<FaultClass>) -> Self {
        Self {
            key,
            status,
            class,
            cached: false,
            ts: Utc::now(),
        }
    }

    pub fn cached_hit(key: String) -> Self {
        Self {
            key,
            status: ParseStatus::Ok,
            class: None,
            cached: true,
            ts: Utc::now(),
        }
    }
}

/// Append-only per-node journal
pub struct Checkpoint {
    writer: BufWriter<File>,
    path: PathBuf,
    interval_docs: u64,
    appended_since_sync: u64,
}

/// Journal file name for a locale
pub fn journal_path(output_dir: &Path, locale_id: usize) -> PathBuf {
    output_dir.join(format!("checkpoint-{}.jsonl", locale_id))
}

impl Checkpoint {
    /// Open the journal for appending, creating it (and the output dir) as
    /// needed
    pub fn open(output_dir: &Path, locale_id: usize, interval_docs: u64) -> Result<Self> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create output dir: {}", output_dir.display()))?;
        let path = journal_path(output_dir, locale_id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open checkpoint journal: {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            interval_docs: interval_docs.max(1),
            appended_since_sync: 0,
        })
    }

    /// Append one terminal record. Returns true when the fsync cadence is
    /// due; the caller flushes the output shards first, then calls [`sync`].
    ///
    /// [`sync`]: Checkpoint::sync
    pub fn append(&mut self, entry: &CheckpointEntry) -> Result<bool> {
        let line = serde_json::to_string(entry).context("Failed to serialize checkpoint entry")?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.appended_since_sync += 1;
        Ok(self.appended_since_sync >= self.interval_docs)
    }

    /// Flush buffered lines and fsync the journal
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer
            .get_ref()
            .sync_data()
            .with_context(|| format!("Failed to fsync journal: {}", self.path.display()))?;
        self.appended_since_sync = 0;
        Ok(())
    }
}

/// Load the skip-set for resume. A missing journal is an empty set; a
/// truncated (unparseable) final line is discarded, earlier bad lines are
/// reported.
pub fn load_skip_set(output_dir: &Path, locale_id: usize) -> Result<HashSet<String>> {
    let path = journal_path(output_dir, locale_id);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read journal: {}", path.display()))
        }
    };

    let lines: Vec<&str> = content.lines().collect();
    let mut skip = HashSet::new();
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CheckpointEntry>(line) {
            Ok(entry) => {
                skip.insert(entry.key);
            }
            Err(e) if i == lines.len() - 1 => {
                // Crash mid-append: the torn tail is expected, drop it
                tracing::warn!(
                    journal = %path.display(),
                    error = %e,
                    "Discarding truncated final journal line"
                );
            }
            Err(e) => {
                anyhow::bail!(
                    "Corrupt journal line {} in {}: {}",
                    i + 1,
                    path.display(),
                    e
                );
            }
        }
    }
    Ok(skip)
}

/// One error-journal line, written for every classified per-document failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub path: String,
    pub class: FaultClass,
    pub status: ParseStatus,
    pub msg: String,
    pub ts: DateTime<Utc>,
}

/// Per-node failure journal. Failures land here, never on standard error.
pub struct ErrorJournal {
    writer: BufWriter<File>,
}

impl ErrorJournal {
    pub fn open(output_dir: &Path, locale_id: usize) -> Result<Self> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create output dir: {}", output_dir.display()))?;
        let path = output_dir.join(format!("errors-{}.jsonl", locale_id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open error journal: {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn record(&mut self, path: &Path, class: FaultClass, status: ParseStatus, msg: &str) -> Result<()> {
        let record = ErrorRecord {
            path: path.display().to_string(),
            class,
            status,
            msg: msg.to_string(),
            ts: Utc::now(),
        };
        let line = serde_json::to_string(&record)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
