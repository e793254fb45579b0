//! Manifest loading and node partitioning
//!
//! The work list arrives in one of two formats, auto-detected from the first
//! non-empty line:
//!
//! - **Plain**: one filesystem path per line
//! - **Enriched**: one JSON object per line with required `path`, `size`,
//!   `mtime` (nanoseconds) and an optional `kind` hint
//!
//! Enriched manifests let the conduit skip its stat call, which matters at
//! archival scale. Node assignment is a deterministic modulo partition so a
//! re-run with the same manifest and node count reproduces the same
//! assignment.

use crate::abi::ContentKind;
use crate::Result;
use anyhow::Context;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Manifest format, auto-detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Plain,
    Enriched,
}

/// One document to process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, rename = "mtime", skip_serializing_if = "Option::is_none")]
    pub mtime_ns: Option<u64>,
    #[serde(default, rename = "kind", skip_serializing_if = "Option::is_none")]
    pub kind_hint: Option<ContentKind>,
}

impl ManifestEntry {
    pub fn plain(path: PathBuf) -> Self {
        Self {
            path,
            size: None,
            mtime_ns: None,
            kind_hint: None,
        }
    }
}

/// The loaded work list
#[derive(Debug, Clone)]
pub struct Manifest {
    pub format: ManifestFormat,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Load and auto-detect. An unreadable manifest is a fatal startup error
    /// (exit code 2 at the CLI boundary).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        Self::from_string(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))
    }

    pub fn from_string(content: &str) -> Result<Self> {
        let first = content.lines().map(str::trim).find(|l| !l.is_empty());
        let format = match first {
            None => {
                return Ok(Self {
                    format: ManifestFormat::Plain,
                    entries: Vec::new(),
                })
            }
            Some(line) if line.starts_with('{') => ManifestFormat::Enriched,
            Some(_) => ManifestFormat::Plain,
        };

        let lines: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        let entries = match format {
            ManifestFormat::Plain => lines
                .into_iter()
                .map(|l| ManifestEntry::plain(PathBuf::from(l)))
                .collect(),
            ManifestFormat::Enriched => {
                // One JSON object per line; parse in parallel, order preserved
                let parsed: Result<Vec<ManifestEntry>> = lines
                    .par_iter()
                    .map(|line| {
                        serde_json::from_str::<ManifestEntry>(line)
                            .with_context(|| format!("Bad enriched manifest line: {}", line))
                    })
                    .collect();
                let entries = parsed?;
                for e in &entries {
                    if e.size.is_none() || e.mtime_ns.is_none() {
                        anyhow::bail!(
                            "Enriched manifest entry missing size/mtime: {}",
                            e.path.display()
                        );
                    }
                }
                entries
            }
        };

        Ok(Self { format, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// This locale's deterministic slice of the manifest:
    /// entry `i` belongs to locale `i % num_locales`.
    pub fn partition(&self, locale_id: usize, num_locales: usize) -> Vec<ManifestEntry> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(i, _)| i % num_locales == locale_id)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Write an assignment (or a whole manifest) back out, preserving the
    /// source format
    pub fn export(
        path: &Path,
        format: ManifestFormat,
        entries: &[ManifestEntry],
    ) -> Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create assignment export: {}", path.display()))?;
        let mut w = std::io::BufWriter::new(file);
        for entry in entries {
            match format {
                ManifestFormat::Plain => writeln!(w, "{}", entry.path.display())?,
                ManifestFormat::Enriched => {
                    writeln!(w, "{}", serde_json::to_string(entry)?)?
                }
            }
        }
        w.flush()?;
        Ok(())
    }
}
