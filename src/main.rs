//! docex CLI entry point

use anyhow::Context;
use docex::abi::StageMask;
use docex::config::cli::{Cli, ExecutionMode};
use docex::config::{validator, Config};
use docex::manifest::Manifest;
use docex::parser::OptionalBackends;
use docex::progress::{ProgressCounters, RunReport};
use docex::worker::{self, default_adapter_factory};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_MANIFEST: u8 = 2;
const EXIT_CATASTROPHIC: u8 = 3;
const EXIT_CANCELLED: u8 = 130;

fn main() -> ExitCode {
    // Progress and diagnostics go to stderr; stdout carries the final
    // results block only.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse_args();
    if let Err(e) = cli.validate() {
        error!("configuration error: {:#}", e);
        return ExitCode::from(EXIT_CONFIG);
    }

    // Shutdown flag: workers drain their current chunk, buffers flush, the
    // checkpoint syncs. The watchdog enforces the grace period.
    let shutdown = Arc::new(AtomicBool::new(false));
    let grace_secs = cli.grace_period_sec;
    {
        let shutdown = Arc::clone(&shutdown);
        if let Err(e) = ctrlc::set_handler(move || {
            if shutdown.swap(true, Ordering::SeqCst) {
                // Second signal: leave immediately
                std::process::exit(EXIT_CANCELLED as i32);
            }
            eprintln!("signal received; draining (grace period {}s)", grace_secs);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_secs(grace_secs));
                std::process::exit(EXIT_CANCELLED as i32);
            });
        }) {
            error!("failed to install signal handler: {}", e);
        }
    }

    match cli.mode {
        ExecutionMode::Node => run_node_service(&cli, shutdown),
        ExecutionMode::Driver => run_driver(&cli, shutdown),
        ExecutionMode::Standalone => run_standalone(&cli, shutdown),
    }
}

/// Build the run configuration: TOML file first when given, CLI flags on top
fn build_config(cli: &Cli) -> docex::Result<Config> {
    let stages: StageMask = cli.stages.parse()?;

    let mut config = match cli.config {
        Some(ref path) => docex::config::toml::parse_toml_file(path)?,
        None => Config {
            manifest: docex::config::ManifestConfig {
                path: cli
                    .manifest_path
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("--manifest-path is required"))?,
                mode: cli.manifest_mode,
                export_assignment: cli.export_assignment.clone(),
            },
            pipeline: docex::config::PipelineConfig {
                stages,
                output_format: cli.output_format,
                conduit_enabled: !cli.no_conduit,
                model_dir: cli.model_dir.clone(),
            },
            cache: docex::config::CacheConfig {
                cache_dir: cli.cache_dir.clone(),
                cache_size_mb: cli.cache_size_mb,
                l2_address: cli.l2_address.clone(),
            },
            workers: docex::config::WorkerConfig {
                threads: cli.threads,
                chunk_size: cli.chunk_size,
                prefetch_window: cli.prefetch_window,
            },
            output: docex::config::OutputConfig {
                output_dir: cli.output_dir.clone(),
                progress_interval_secs: cli.progress_interval_sec,
                ..Default::default()
            },
            runtime: docex::config::RuntimeConfig {
                resume: cli.resume,
                checkpoint_interval_docs: cli.checkpoint_interval_docs,
                doc_timeout_secs: cli.doc_timeout_sec,
                max_retries: cli.max_retries,
                grace_period_secs: cli.grace_period_sec,
                dry_run: cli.dry_run,
            },
            cluster: docex::config::ClusterConfig {
                num_locales: cli.num_locales,
                locale_id: cli.locale_id,
            },
        },
    };

    // CLI wins over the file for the flags that name runtime behavior
    if cli.config.is_some() {
        if let Some(ref path) = cli.manifest_path {
            config.manifest.path = path.clone();
        }
        if cli.resume {
            config.runtime.resume = true;
        }
        if cli.dry_run {
            config.runtime.dry_run = true;
        }
        if cli.threads != 0 {
            config.workers.threads = cli.threads;
        }
        if cli.stages != "fast" {
            config.pipeline.stages = stages;
        }
    }

    validator::validate_config(&config)?;
    Ok(config)
}

fn print_configuration(config: &Config) {
    println!("Configuration:");
    println!("  Manifest: {}", config.manifest.path.display());
    println!("  Output dir: {}", config.output.output_dir.display());
    println!("  Format: {:?}", config.pipeline.output_format);
    println!("  Stages: {}", config.pipeline.stages);
    println!("  Workers: {} (0 = cpu count)", config.workers.threads);
    println!("  Chunk size: {}", config.workers.chunk_size);
    println!(
        "  Cache: {}",
        config
            .cache
            .cache_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "disabled".to_string())
    );
    if let Some(ref l2) = config.cache.l2_address {
        println!("  L2: {}", l2);
    }
    println!(
        "  Locales: {} (this node: {})",
        config.cluster.num_locales, config.cluster.locale_id
    );
    println!("  Resume: {}", config.runtime.resume);
}

/// Run in standalone mode (single node, in process)
fn run_standalone(cli: &Cli, shutdown: Arc<AtomicBool>) -> ExitCode {
    let config = match build_config(cli) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("configuration error: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    print_configuration(&config);

    let manifest = match Manifest::load(&config.manifest.path) {
        Ok(m) => m,
        Err(e) => {
            error!("manifest error: {:#}", e);
            return ExitCode::from(EXIT_MANIFEST);
        }
    };
    let assignment = manifest.partition(config.cluster.locale_id, config.cluster.num_locales);
    info!(
        total = manifest.len(),
        assigned = assignment.len(),
        "manifest loaded"
    );

    if config.runtime.dry_run {
        println!();
        println!(
            "Dry run: configuration valid, {} documents assigned to this locale",
            assignment.len()
        );
        return ExitCode::from(EXIT_OK);
    }

    let started_wall = chrono::Utc::now();
    let optional = Arc::new(OptionalBackends::probe(
        config.pipeline.model_dir.as_deref(),
    ));
    let factory = default_adapter_factory(Arc::clone(&optional));
    let counters = Arc::new(ProgressCounters::new());

    let report = match worker::run_node(
        Arc::clone(&config),
        assignment,
        factory,
        optional,
        counters,
        Arc::clone(&shutdown),
    ) {
        Ok(r) => r,
        Err(e) => {
            error!("catastrophic node failure: {:#}", e);
            return ExitCode::from(EXIT_CATASTROPHIC);
        }
    };

    let run_report = RunReport::assemble(started_wall, chrono::Utc::now(), vec![report]);
    match run_report.write(&config.output.output_dir) {
        Ok(path) => info!(path = %path.display(), "run report written"),
        Err(e) => {
            error!("failed to write run report: {:#}", e);
            return ExitCode::from(EXIT_CATASTROPHIC);
        }
    }

    println!();
    worker::print_summary(&run_report.totals, run_report.elapsed_sec);

    if shutdown.load(Ordering::SeqCst) {
        return ExitCode::from(EXIT_CANCELLED);
    }
    ExitCode::from(EXIT_OK)
}

/// Run as a node service (driver sends configuration)
fn run_node_service(cli: &Cli, shutdown: Arc<AtomicBool>) -> ExitCode {
    let runtime = match tokio::runtime::Runtime::new().context("Failed to create tokio runtime") {
        Ok(r) => r,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CATASTROPHIC);
        }
    };

    let service = docex::distributed::NodeService::new(cli.listen_port, Arc::clone(&shutdown));
    match runtime.block_on(service.run()) {
        Ok(()) => {
            if shutdown.load(Ordering::SeqCst) {
                ExitCode::from(EXIT_CANCELLED)
            } else {
                ExitCode::from(EXIT_OK)
            }
        }
        Err(e) => {
            error!("node service failed: {:#}", e);
            ExitCode::from(EXIT_CATASTROPHIC)
        }
    }
}

/// Run as the driver of a distributed session
fn run_driver(cli: &Cli, shutdown: Arc<AtomicBool>) -> ExitCode {
    let config = match build_config(cli) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("configuration error: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    print_configuration(&config);

    // The manifest must be readable on the driver in broadcast mode; check
    // it up front in shared mode too so a bad path fails fast with the
    // dedicated exit code.
    if let Err(e) = std::fs::metadata(&config.manifest.path) {
        error!(
            "manifest unreadable: {}: {}",
            config.manifest.path.display(),
            e
        );
        return ExitCode::from(EXIT_MANIFEST);
    }

    let node_addresses = match collect_node_addresses(cli) {
        Ok(a) => a,
        Err(e) => {
            error!("configuration error: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Runtime::new().context("Failed to create tokio runtime") {
        Ok(r) => r,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CATASTROPHIC);
        }
    };

    let coordinator = match docex::distributed::Coordinator::new(Arc::clone(&config), node_addresses)
    {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match runtime.block_on(coordinator.run()) {
        Ok(report) => {
            println!();
            worker::print_summary(&report.totals, report.elapsed_sec);
            if shutdown.load(Ordering::SeqCst) {
                ExitCode::from(EXIT_CANCELLED)
            } else {
                ExitCode::from(EXIT_OK)
            }
        }
        Err(e) => {
            error!("distributed run failed: {:#}", e);
            ExitCode::from(EXIT_CATASTROPHIC)
        }
    }
}

/// Node addresses from --host-list or --nodes-file, default port appended
fn collect_node_addresses(cli: &Cli) -> docex::Result<Vec<String>> {
    let with_port = |addr: &str| {
        if addr.contains(':') {
            addr.to_string()
        } else {
            format!("{}:{}", addr, cli.node_port)
        }
    };

    if let Some(ref host_list) = cli.host_list {
        return Ok(host_list
            .split(',')
            .map(|s| with_port(s.trim()))
            .filter(|s| !s.is_empty())
            .collect());
    }
    if let Some(ref nodes_file) = cli.nodes_file {
        let content = std::fs::read_to_string(nodes_file)
            .with_context(|| format!("Failed to read nodes file: {}", nodes_file.display()))?;
        return Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(with_port)
            .collect());
    }
    anyhow::bail!("driver mode requires --host-list or --nodes-file")
}
