//! CLI argument parsing using clap

use crate::abi::OutputFormat;
use crate::config::ManifestMode;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// Standalone mode (default) - single node run
    Standalone,
    /// Driver mode - orchestrate a distributed run
    Driver,
    /// Node mode - run a node service (accepts driver commands)
    Node,
}

/// docex - Distributed multi-format document extraction engine
#[derive(Parser, Debug)]
#[command(name = "docex")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Execution mode: standalone, driver, or node
    #[arg(long, value_enum, default_value = "standalone")]
    pub mode: ExecutionMode,

    /// Port for the node service to listen on (node mode only)
    #[arg(long, default_value = "9876")]
    pub listen_port: u16,

    /// Comma-separated list of node addresses for driver mode
    /// (e.g., "10.0.1.10:9876,10.0.1.11:9876")
    #[arg(long)]
    pub host_list: Option<String>,

    /// File containing node addresses (one per line, for driver mode)
    #[arg(long)]
    pub nodes_file: Option<PathBuf>,

    /// Port to connect to on nodes when an address omits one (driver mode)
    #[arg(long, default_value = "9876")]
    pub node_port: u16,

    /// Work-list manifest: plain path list or enriched JSONL
    ///
    /// Not required in node mode (the driver sends configuration)
    #[arg(long, value_name = "PATH")]
    pub manifest_path: Option<PathBuf>,

    /// TOML configuration file (CLI flags take precedence)
    #[arg(long)]
    pub config: Option<PathBuf>,

    // === Output Options ===
    /// Root directory for extracted outputs, shards, journals, run report
    #[arg(short = 'o', long, default_value = "docex-out")]
    pub output_dir: PathBuf,

    /// Format for extracted content
    #[arg(long, value_enum, default_value = "json")]
    pub output_format: OutputFormat,

    /// Heartbeat cadence in seconds
    #[arg(long, default_value = "60")]
    pub progress_interval_sec: u64,

    // === Work Distribution Options ===
    /// How nodes obtain the manifest
    #[arg(long, value_enum, default_value = "shared")]
    pub manifest_mode: ManifestMode,

    /// Dispatcher chunk granularity
    #[arg(long, default_value = "256")]
    pub chunk_size: usize,

    /// Number of worker threads (0 = logical CPU count)
    #[arg(short = 't', long, default_value = "0")]
    pub threads: usize,

    /// Prefetcher read-ahead window, in manifest entries
    #[arg(long, default_value = "64")]
    pub prefetch_window: usize,

    /// Number of participating nodes
    #[arg(long, default_value = "1")]
    pub num_locales: usize,

    /// This node's index in 0..num-locales (standalone/shared mode)
    #[arg(long, default_value = "0")]
    pub locale_id: usize,

    /// Export this locale's effective assignment to a file
    #[arg(long)]
    pub export_assignment: Option<PathBuf>,

    // === Stage Options ===
    /// Stage selection: none, fast, analysis, all, or an explicit mask (0x...)
    #[arg(long, default_value = "fast")]
    pub stages: String,

    /// Disable the preprocessing conduit
    #[arg(long)]
    pub no_conduit: bool,

    /// Root directory for optional ML model lookup
    #[arg(long)]
    pub model_dir: Option<PathBuf>,

    // === Cache Options ===
    /// L1 result cache directory (caching disabled when unset)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// L1 cache map size in MiB
    #[arg(long, default_value = "10240")]
    pub cache_size_mb: u64,

    /// Optional L2 endpoint (e.g. "redis://cache-host:6379")
    #[arg(long)]
    pub l2_address: Option<String>,

    // === Checkpoint Options ===
    /// Consult the checkpoint journal at startup
    #[arg(long)]
    pub resume: bool,

    /// Checkpoint fsync cadence, in documents
    #[arg(long, default_value = "10000")]
    pub checkpoint_interval_docs: u64,

    // === Fault Handling Options ===
    /// Per-document wall-clock timeout in seconds
    #[arg(long, default_value = "600")]
    pub doc_timeout_sec: u64,

    /// Retry budget for retryable failures
    #[arg(long, default_value = "2")]
    pub max_retries: u32,

    /// Shutdown drain window after SIGTERM, in seconds
    #[arg(long, default_value = "30")]
    pub grace_period_sec: u64,

    // === Misc ===
    /// Validate configuration and manifest, print the plan, exit
    #[arg(long)]
    pub dry_run: bool,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Early sanity checks that do not need a full Config
    pub fn validate(&self) -> crate::Result<()> {
        if self.mode != ExecutionMode::Node && self.manifest_path.is_none() && self.config.is_none()
        {
            anyhow::bail!("--manifest-path (or --config) is required outside node mode");
        }
        if self.mode == ExecutionMode::Driver
            && self.host_list.is_none()
            && self.nodes_file.is_none()
        {
            anyhow::bail!("driver mode requires --host-list or --nodes-file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["docex", "--manifest-path", "list.txt"]);
        assert_eq!(cli.chunk_size, 256);
        assert_eq!(cli.threads, 0);
        assert_eq!(cli.stages, "fast");
        assert_eq!(cli.doc_timeout_sec, 600);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn node_mode_needs_no_manifest() {
        let cli = Cli::parse_from(["docex", "--mode", "node"]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn driver_mode_requires_hosts() {
        let cli = Cli::parse_from(["docex", "--mode", "driver", "--manifest-path", "m.txt"]);
        assert!(cli.validate().is_err());
    }
}
