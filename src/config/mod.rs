//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.

pub mod cli;
pub mod toml;
pub mod validator;

use crate::abi::{OutputFormat, StageMask};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub manifest: ManifestConfig,
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Work-list configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Path to the manifest file (plain path list or enriched JSONL)
    pub path: PathBuf,
    /// How nodes obtain the manifest
    #[serde(default)]
    pub mode: ManifestMode,
    /// Write this locale's effective (filtered) assignment to a file
    pub export_assignment: Option<PathBuf>,
}

/// Manifest distribution mode across nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ManifestMode {
    /// Every node reads the manifest from a shared filesystem
    Shared,
    /// The driver reads the manifest and broadcasts entries over the node protocol
    Broadcast,
}

impl Default for ManifestMode {
    fn default() -> Self {
        Self::Shared
    }
}

/// Parsing and stage-pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stage selection: a named preset or an explicit bitmask
    #[serde(default = "default_stages")]
    pub stages: StageMask,
    /// Format for extracted content files and shard records
    #[serde(default = "default_output_format")]
    pub output_format: OutputFormat,
    /// Run the preprocessing conduit (magic detection, validation, pre-hash)
    #[serde(default = "default_true")]
    pub conduit_enabled: bool,
    /// Root directory for optional ML model lookup
    pub model_dir: Option<PathBuf>,
}

fn default_stages() -> StageMask {
    StageMask::FAST
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Json
}

fn default_true() -> bool {
    true
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// L1 cache directory; caching is disabled when unset
    pub cache_dir: Option<PathBuf>,
    /// L1 map size in MiB
    #[serde(default = "default_cache_size_mb")]
    pub cache_size_mb: u64,
    /// Optional L2 endpoint, e.g. "redis://cache-host:6379"
    pub l2_address: Option<String>,
}

fn default_cache_size_mb() -> u64 {
    10 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            cache_size_mb: default_cache_size_mb(),
            l2_address: None,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker threads (0 = logical CPU count)
    #[serde(default)]
    pub threads: usize,
    /// Dispatcher chunk granularity
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Prefetcher read-ahead window, in manifest entries
    #[serde(default = "default_prefetch_window")]
    pub prefetch_window: usize,
}

fn default_chunk_size() -> usize {
    256
}

fn default_prefetch_window() -> usize {
    64
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            chunk_size: default_chunk_size(),
            prefetch_window: default_prefetch_window(),
        }
    }
}

impl WorkerConfig {
    /// Effective worker count, resolving 0 to the logical CPU count
    pub fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Root for extracted outputs, shards, journals, and the run report
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Heartbeat cadence in seconds
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,
    /// Shard rotation threshold in bytes
    #[serde(default = "default_shard_max_bytes")]
    pub shard_max_bytes: u64,
    /// In-memory buffer per shard in bytes
    #[serde(default = "default_shard_buffer_bytes")]
    pub shard_buffer_bytes: usize,
    /// Shard flush ticker in seconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("docex-out")
}

fn default_progress_interval() -> u64 {
    60
}

fn default_shard_max_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_shard_buffer_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_flush_interval() -> u64 {
    5
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            progress_interval_secs: default_progress_interval(),
            shard_max_bytes: default_shard_max_bytes(),
            shard_buffer_bytes: default_shard_buffer_bytes(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

/// Runtime behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Consult the checkpoint journal at startup and skip completed documents
    #[serde(default)]
    pub resume: bool,
    /// Checkpoint fsync cadence, in documents
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_docs: u64,
    /// Per-document wall-clock timeout in seconds
    #[serde(default = "default_doc_timeout")]
    pub doc_timeout_secs: u64,
    /// Retry budget for retryable failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Shutdown drain window after SIGTERM, in seconds
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// Validate configuration and manifest, then exit without processing
    #[serde(default)]
    pub dry_run: bool,
}

fn default_checkpoint_interval() -> u64 {
    10_000
}

fn default_doc_timeout() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    2
}

fn default_grace_period() -> u64 {
    30
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            resume: false,
            checkpoint_interval_docs: default_checkpoint_interval(),
            doc_timeout_secs: default_doc_timeout(),
            max_retries: default_max_retries(),
            grace_period_secs: default_grace_period(),
            dry_run: false,
        }
    }
}

/// Cluster topology configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of participating nodes
    #[serde(default = "default_num_locales")]
    pub num_locales: usize,
    /// This node's index in 0..num_locales
    #[serde(default)]
    pub locale_id: usize,
}

fn default_num_locales() -> usize {
    1
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_locales: default_num_locales(),
            locale_id: 0,
        }
    }
}
