//! Worker loop and node orchestration
//!
//! This module implements the per-worker document loop and the node-level
//! `run_node` entry that wires every subsystem together: resume filtering,
//! the chunk queue, the worker pool, the prefetcher, the conduit, the caches
//! with single-flight, the fault handler, the stage pipeline, the sharded
//! writer, the checkpoint journal, and the progress reporter.
//!
//! # Ordering
//!
//! For one document: parse precedes all stages; stages precede output; the
//! shard write is flushed before the checkpoint journal syncs. Checkpoint
//! append order per node is the completion order (a single append lock).
//!
//! # Thread model
//!
//! Workers own their executor (and through it the adapter handle) and their
//! prefetcher. Everything shared — caches, writer, counters, journals — is
//! either lock-free or behind a short critical section.

use crate::abi::{ContentKind, ParseResult, ParseStatus};
use crate::cache::singleflight::Begin;
use crate::cache::{CacheKey, CachedDocument, L1Cache, L2Cache, SingleFlight};
use crate::checkpoint::{self, Checkpoint, CheckpointEntry, ErrorJournal};
use crate::conduit::Conduit;
use crate::config::Config;
use crate::dispatch::{feed_chunks, ChunkQueue, DocState, DocTracker};
use crate::fault::{FaultClass, FaultHandler, ParseExecutor, ParseJob};
use crate::manifest::ManifestEntry;
use crate::output::{emit, ShardedWriter};
use crate::parser::{Extraction, OptionalBackends, ParserAdapter};
use crate::prefetch::Prefetcher;
use crate::progress::{heartbeat, CounterSnapshot, NodeReport, ProgressCounters};
use crate::stages::{run_pipeline, StageContext, StageRecord};
use crate::Result;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shareable adapter factory; each worker's executor builds its own handle
pub type SharedAdapterFactory = Arc<dyn Fn() -> Result<ParserAdapter> + Send + Sync>;

/// The default factory: built-in backends plus the optional-adapter probe
pub fn default_adapter_factory(optional: Arc<OptionalBackends>) -> SharedAdapterFactory {
    Arc::new(move || {
        ParserAdapter::with_backends(
            crate::parser::backends::builtin_backends(),
            Arc::clone(&optional),
        )
    })
}

/// Node-wide shared state
pub struct NodeRuntime {
    pub config: Arc<Config>,
    pub conduit: Option<Conduit>,
    pub l1: Option<L1Cache>,
    pub l2: Option<L2Cache>,
    pub singleflight: SingleFlight,
    pub writer: ShardedWriter,
    pub counters: Arc<ProgressCounters>,
    pub optional: Arc<OptionalBackends>,
    pub checkpoint: Mutex<Checkpoint>,
    pub errors: Mutex<ErrorJournal>,
    pub shutdown: Arc<AtomicBool>,
}

impl NodeRuntime {
    /// Append a checkpoint entry, enforcing shard-flush-before-journal-sync
    fn checkpoint_append(&self, entry: &CheckpointEntry) -> Result<()> {
        let mut cp = self.checkpoint.lock().unwrap();
        let sync_due = cp.append(entry)?;
        if sync_due {
            self.writer.flush_all()?;
            cp.sync()?;
        }
        Ok(())
    }
}

/// Run this node's share of the manifest to completion.
///
/// Returns the node report; infrastructure failures (cache init, journal IO,
/// shard rotation) abort the node with an error, per-document failures never
/// do.
pub fn run_node(
    config: Arc<Config>,
    entries: Vec<ManifestEntry>,
    factory: SharedAdapterFactory,
    optional: Arc<OptionalBackends>,
    counters: Arc<ProgressCounters>,
    shutdown: Arc<AtomicBool>,
) -> Result<NodeReport> {
    let started = Instant::now();
    let locale_id = config.cluster.locale_id;
    let output_dir = config.output.output_dir.clone();

    // Resume: build the skip-set and filter the assignment before dispatch
    let entries = if config.runtime.resume {
        let skip = checkpoint::load_skip_set(&output_dir, locale_id)?;
        if skip.is_empty() {
            entries
        } else {
            let before = entries.len();
            let kept: Vec<ManifestEntry> = entries
                .into_iter()
                .filter(|e| !skip.contains(&entry_key(e).encode_string()))
                .collect();
            info!(
                skipped = before - kept.len(),
                remaining = kept.len(),
                "resume: filtered completed documents"
            );
            kept
        }
    } else {
        entries
    };

    if let Some(ref export) = config.manifest.export_assignment {
        crate::manifest::Manifest::export(
            export,
            crate::manifest::ManifestFormat::Plain,
            &entries,
        )?;
    }

    // L1 cache and its designated writer thread
    let (l1, l1_writer) = match config.cache.cache_dir {
        Some(ref dir) => {
            let (cache, writer) = L1Cache::open(dir, config.cache.cache_size_mb)
                .context("L1 cache initialization failed")?;
            (Some(cache), Some(writer))
        }
        None => (None, None),
    };
    let l2 = L2Cache::connect(config.cache.l2_address.as_deref());

    let writer = ShardedWriter::new(
        output_dir.join("shards"),
        locale_id,
        config.pipeline.output_format,
        config.output.shard_buffer_bytes,
        config.output.shard_max_bytes,
        Duration::from_secs(config.output.flush_interval_secs),
    )?;

    let runtime = Arc::new(NodeRuntime {
        conduit: if config.pipeline.conduit_enabled {
            Some(Conduit::new(true))
        } else {
            None
        },
        l1,
        l2,
        singleflight: SingleFlight::new(),
        writer,
        counters: Arc::clone(&counters),
        optional,
        checkpoint: Mutex::new(Checkpoint::open(
            &output_dir,
            locale_id,
            config.runtime.checkpoint_interval_docs,
        )?),
        errors: Mutex::new(ErrorJournal::open(&output_dir, locale_id)?),
        shutdown: Arc::clone(&shutdown),
        config: Arc::clone(&config),
    });

    // Feeder -> bounded chunk queue -> workers
    let queue = ChunkQueue::new();
    let chunk_tx = queue.sender();
    let chunk_rx = queue.close();
    let chunk_size = config.workers.chunk_size;
    let feeder = std::thread::Builder::new()
        .name("manifest-feeder".to_string())
        .spawn(move || feed_chunks(entries, chunk_size, chunk_tx))?;

    let worker_count = config.workers.effective_threads();
    info!(workers = worker_count, locale = locale_id, "starting worker pool");
    let mut workers = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        let runtime = Arc::clone(&runtime);
        let rx = chunk_rx.clone();
        let factory = Arc::clone(&factory);
        workers.push(
            std::thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || worker_loop(id, runtime, rx, factory))?,
        );
    }
    drop(chunk_rx);

    // Reporter: heartbeat plus the shard flush ticker
    let reporter_runtime = Arc::clone(&runtime);
    let reporter_done = Arc::new(AtomicBool::new(false));
    let reporter_flag = Arc::clone(&reporter_done);
    let progress_interval = Duration::from_secs(config.output.progress_interval_secs);
    let reporter = std::thread::spawn(move || {
        let mut last_beat = Instant::now();
        while !reporter_flag.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(250));
            let _ = reporter_runtime.writer.flush_if_due();
            if last_beat.elapsed() >= progress_interval {
                heartbeat(&reporter_runtime.counters.snapshot(), started.elapsed());
                last_beat = Instant::now();
            }
        }
    });

    let mut worker_failure: Option<anyhow::Error> = None;
    for worker in workers {
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => worker_failure = Some(e),
            Err(_) => worker_failure = Some(anyhow::anyhow!("worker thread panicked")),
        }
    }
    let _ = feeder.join();
    reporter_done.store(true, Ordering::Relaxed);
    let _ = reporter.join();

    // Final flush: shards first, then the journal sync
    runtime.writer.flush_all()?;
    {
        let mut cp = runtime.checkpoint.lock().unwrap();
        cp.sync()?;
    }
    runtime.errors.lock().unwrap().flush()?;

    if let Some(ref l1) = runtime.l1 {
        debug!(entries = l1.count().unwrap_or(0), "L1 cache at shutdown");
    }
    drop(runtime);
    if let Some(writer) = l1_writer {
        writer.join();
    }

    if let Some(e) = worker_failure {
        return Err(e.context("node worker pool failed"));
    }

    let node_name = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let snapshot = counters.snapshot();
    Ok(NodeReport {
        node_name,
        locale_id,
        latency: snapshot.latency(),
        counters: snapshot,
        elapsed_sec: started.elapsed().as_secs_f64(),
    })
}

/// L1 key for a manifest entry. Enriched entries carry their identity; plain
/// entries are statted, and an unstattable file keys as (path, 0, 0) so its
/// failure is still checkpointed deterministically.
pub fn entry_key(entry: &ManifestEntry) -> CacheKey {
    match (entry.size, entry.mtime_ns) {
        (Some(size), Some(mtime)) => CacheKey::new(&entry.path, mtime, size),
        _ => CacheKey::from_fs(&entry.path)
            .unwrap_or_else(|_| CacheKey::new(&entry.path, 0, 0)),
    }
}

fn worker_loop(
    id: usize,
    runtime: Arc<NodeRuntime>,
    chunks: crossbeam::channel::Receiver<Vec<ManifestEntry>>,
    factory: SharedAdapterFactory,
) -> Result<()> {
    let factory_box: crate::fault::AdapterFactory = {
        let factory = Arc::clone(&factory);
        Box::new(move || factory())
    };
    let mut executor = ParseExecutor::spawn(factory_box)?;
    let prefetcher = Prefetcher::new(runtime.config.workers.prefetch_window);
    let handler = FaultHandler::new(
        Duration::from_secs(runtime.config.runtime.doc_timeout_secs),
        runtime.config.runtime.max_retries,
    );

    while let Ok(chunk) = chunks.recv() {
        prefetcher.schedule(chunk.iter().map(|e| e.path.clone()));
        for entry in chunk {
            process_document(&runtime, &mut executor, &prefetcher, &handler, &entry)
                .with_context(|| format!("worker {} infrastructure failure", id))?;
        }
        // Drain semantics: finish the chunk in flight, then stop pulling
        if runtime.shutdown.load(Ordering::Relaxed) {
            break;
        }
    }
    Ok(())
}

/// Process one document end to end. Per-document failures are recorded and
/// swallowed; only infrastructure errors surface.
fn process_document(
    runtime: &NodeRuntime,
    executor: &mut ParseExecutor,
    prefetcher: &Prefetcher,
    handler: &FaultHandler,
    entry: &ManifestEntry,
) -> Result<()> {
    runtime.counters.seen.add(1);
    let key = entry_key(entry);
    let key_bytes = key.encode();
    let mut tracker = DocTracker::new();
    tracker.advance(DocState::Reserved)?;

    // Cache probe with single-flight: only one worker parses a key; the
    // others wait and re-probe.
    if let Some(l1) = runtime.l1.as_ref() {
        loop {
            if let Some(cached) = l1.get(&key_bytes)? {
                return complete_from_cache(runtime, entry, &key, cached, &mut tracker);
            }
            let wait = Duration::from_secs(runtime.config.runtime.doc_timeout_secs);
            match runtime.singleflight.begin(&key_bytes, wait) {
                Begin::Leader => {
                    let outcome = parse_document(
                        runtime, executor, prefetcher, handler, entry, &key, &mut tracker,
                    );
                    runtime.singleflight.complete(&key_bytes);
                    return outcome;
                }
                Begin::Completed => continue,
                Begin::TimedOut => {
                    // Waiter timeout: affects this document only; the
                    // primary parse keeps running under its own timeout.
                    return fail_document(
                        runtime,
                        entry,
                        &key,
                        ParseStatus::Error,
                        FaultClass::Timeout,
                        "timeout waiting for in-flight parse of identical key",
                        &mut tracker,
                    );
                }
            }
        }
    }

    parse_document(runtime, executor, prefetcher, handler, entry, &key, &mut tracker)
}

/// Cache-hit completion: `reserved -> done` without a parse
fn complete_from_cache(
    runtime: &NodeRuntime,
    entry: &ManifestEntry,
    key: &CacheKey,
    cached: CachedDocument,
    tracker: &mut DocTracker,
) -> Result<()> {
    runtime.counters.cached.add(1);
    runtime.counters.bytes_in.add(key.size);

    // Re-materialize the stage record beside the (already present) extraction
    // file when a previous run's artifact is gone.
    if cached.parse.status() == Some(ParseStatus::Ok) && !cached.stage_record.is_empty() {
        let out = extraction_path(runtime, &entry.path, cached.parse.sha256());
        let stages_path = stages_path_for(&out);
        if !stages_path.exists() {
            if let Some(parent) = stages_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&stages_path, frame(&cached.stage_record))?;
        }
    }

    runtime.checkpoint_append(&CheckpointEntry::cached_hit(key.encode_string()))?;
    tracker.advance(DocState::Done)
}

/// The parse path: conduit, read, fault-handled parse, stages, outputs,
/// cache store, checkpoint.
fn parse_document(
    runtime: &NodeRuntime,
    executor: &mut ParseExecutor,
    prefetcher: &Prefetcher,
    handler: &FaultHandler,
    entry: &ManifestEntry,
    key: &CacheKey,
    tracker: &mut DocTracker,
) -> Result<()> {
    use crate::abi::Validation;

    // Conduit: classify, validate, pre-hash
    let (kind, conduit_hash) = match runtime.conduit {
        Some(ref conduit) => {
            let result = conduit.preprocess(&entry.path, entry.size);
            match result.validation() {
                Some(Validation::Ok) => {}
                Some(Validation::Unreadable) => {
                    let (status, class, msg) = if entry.path.exists() {
                        (ParseStatus::Error, FaultClass::TerminalIo, "unreadable file")
                    } else {
                        (
                            ParseStatus::FileNotFound,
                            FaultClass::TerminalIo,
                            "file not found",
                        )
                    };
                    return fail_document(runtime, entry, key, status, class, msg, tracker);
                }
                Some(Validation::BadMagic) => {
                    // Unknown magic: the parser is never invoked
                    return fail_document(
                        runtime,
                        entry,
                        key,
                        ParseStatus::UnsupportedFormat,
                        FaultClass::TerminalParse,
                        "no recognized magic bytes",
                        tracker,
                    );
                }
                Some(Validation::TooSmall) | None => {
                    return fail_document(
                        runtime,
                        entry,
                        key,
                        ParseStatus::ParseError,
                        FaultClass::TerminalParse,
                        "below minimum usable size for detected kind",
                        tracker,
                    );
                }
            }
            let hash = result.sha256();
            (
                result.kind().unwrap_or(ContentKind::Unknown),
                if hash.is_empty() {
                    None
                } else {
                    Some(hash.to_string())
                },
            )
        }
        // Conduit disabled: trust the manifest hint, fall back to sniffing
        // inside the adapter via the file head.
        None => (
            entry.kind_hint.unwrap_or(ContentKind::Unknown),
            None,
        ),
    };

    // L2 probe: only on L1 miss, keyed by content hash. A hit seeds L1 and
    // completes the document without a parse; cross-node duplicates converge
    // here on warm restarts.
    if let (Some(l2), Some(hash)) = (runtime.l2.as_ref(), conduit_hash.as_deref()) {
        if let Some(cached) = l2.get(hash) {
            if let Some(ref l1) = runtime.l1 {
                l1.put(key.encode(), &cached)?;
            }
            return complete_from_cache(runtime, entry, key, cached, tracker);
        }
    }

    // Read the file once (prefetcher-warmed)
    let data = match prefetcher.take(&entry.path) {
        Ok(d) => d,
        Err(e) => {
            let status = if e.kind() == std::io::ErrorKind::NotFound {
                ParseStatus::FileNotFound
            } else {
                ParseStatus::Error
            };
            return fail_document(
                runtime,
                entry,
                key,
                status,
                FaultClass::TerminalIo,
                &e.to_string(),
                tracker,
            );
        }
    };
    runtime.counters.bytes_in.add(data.len() as u64);

    // Without the conduit, classify from the head now
    let kind = if kind == ContentKind::Unknown {
        crate::conduit::classify(&data[..data.len().min(4096)]).0
    } else {
        kind
    };
    if kind == ContentKind::Unknown {
        return fail_document(
            runtime,
            entry,
            key,
            ParseStatus::UnsupportedFormat,
            FaultClass::TerminalParse,
            "no recognized magic bytes",
            tracker,
        );
    }

    let hash_for_name = conduit_hash
        .clone()
        .unwrap_or_else(|| crate::conduit::hash_bytes(&data));
    let out_path = extraction_path(runtime, &entry.path, &hash_for_name);

    // Fault-handled parse (timeout, retries, classification)
    tracker.advance(DocState::Parsing)?;
    let format = runtime.config.pipeline.output_format;
    let parse_start = Instant::now();
    let (result, class, extraction) = handler.process(executor, || ParseJob {
        input: entry.path.clone(),
        output: out_path.clone(),
        format,
        kind,
        conduit_hash: conduit_hash.clone(),
        data: data.clone(),
    })?;
    runtime
        .counters
        .record_parse_latency(parse_start.elapsed());

    if let Some(class) = class {
        let status = result.status().unwrap_or(ParseStatus::Error);
        return fail_document(runtime, entry, key, status, class, result.error_msg(), tracker);
    }

    // Stages
    tracker.advance(DocState::Staging)?;
    let extraction = extraction.unwrap_or_default();
    let record = run_stages(runtime, entry, &result, &extraction, &data, kind);

    // Stage-results artifact beside the extraction file
    tracker.advance(DocState::Writing)?;
    let stages_path = stages_path_for(&out_path);
    let record_bytes = record.to_bytes();
    std::fs::write(&stages_path, frame(&record_bytes))
        .with_context(|| format!("Failed to write stage record: {}", stages_path.display()))?;

    // Shard summary record
    let summary = emit::summary_record(format, &entry.path, &extraction, result.sha256(), result.mime_type());
    runtime.writer.append(kind, &summary)?;

    let out_bytes = std::fs::metadata(&out_path).map(|m| m.len()).unwrap_or(0);
    runtime
        .counters
        .bytes_out
        .add(out_bytes + record_bytes.len() as u64 + 4);
    runtime.counters.parsed.add(1);

    // Cache stores: L1 durable, L2 best-effort
    let cached = CachedDocument {
        parse: result.clone(),
        stage_record: record_bytes,
    };
    if let Some(ref l1) = runtime.l1 {
        l1.put(key.encode(), &cached)?;
    }
    if let Some(ref l2) = runtime.l2 {
        l2.put(result.sha256(), &cached);
    }

    runtime.checkpoint_append(&CheckpointEntry::new(
        key.encode_string(),
        ParseStatus::Ok,
        None,
    ))?;
    tracker.advance(DocState::Done)
}

fn run_stages(
    runtime: &NodeRuntime,
    entry: &ManifestEntry,
    result: &ParseResult,
    extraction: &Extraction,
    data: &[u8],
    kind: ContentKind,
) -> StageRecord {
    let requested = runtime.config.pipeline.stages;
    if requested.is_empty() {
        return StageRecord::new();
    }
    let ctx = StageContext {
        parse: result,
        extraction: Some(extraction),
        data,
        content_hash: result.sha256(),
        kind,
        optional: &runtime.optional,
        source_path: &entry.path,
        output_format: runtime.config.pipeline.output_format,
    };
    let record = run_pipeline(requested, &ctx);
    debug_assert!(record.executed_mask().is_subset_of(requested));
    record
}

/// Record a classified per-document failure in the counters, the error
/// journal, and the checkpoint. Never touches the shards.
fn fail_document(
    runtime: &NodeRuntime,
    entry: &ManifestEntry,
    key: &CacheKey,
    status: ParseStatus,
    class: FaultClass,
    msg: &str,
    tracker: &mut DocTracker,
) -> Result<()> {
    warn!(path = %entry.path.display(), %class, %status, msg, "document failed");
    runtime.counters.record_failure(class);
    runtime
        .errors
        .lock()
        .unwrap()
        .record(&entry.path, class, status, msg)?;
    runtime.checkpoint_append(&CheckpointEntry::new(
        key.encode_string(),
        status,
        Some(class),
    ))?;
    tracker.advance(DocState::Failed)
}

/// Deterministic extraction file path:
/// `<output-dir>/extracted/<stem>-<hash8>.<ext>`
fn extraction_path(runtime: &NodeRuntime, input: &Path, content_hash: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let hash8 = &content_hash[..content_hash.len().min(8)];
    runtime.config.output.output_dir.join("extracted").join(format!(
        "{}-{}.{}",
        stem,
        hash8,
        runtime.config.pipeline.output_format.extension()
    ))
}

fn stages_path_for(out_path: &Path) -> PathBuf {
    let mut os = out_path.as_os_str().to_owned();
    os.push(".stages");
    PathBuf::from(os)
}

fn frame(record_bytes: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(record_bytes.len() + 4);
    framed.extend_from_slice(&(record_bytes.len() as u32).to_le_bytes());
    framed.extend_from_slice(record_bytes);
    framed
}

/// Summary block printed at the end of a run, in addition to the run-report
/// record
pub fn print_summary(snapshot: &CounterSnapshot, elapsed_sec: f64) {
    use crate::util::{format_bytes, format_number, format_rate};

    let completed = snapshot.parsed + snapshot.cached + snapshot.failed;
    let rate = if elapsed_sec > 0.0 {
        completed as f64 / elapsed_sec
    } else {
        0.0
    };

    println!("═══════════════════════════════════════════════════════════");
    println!("                    RUN RESULTS");
    println!("═══════════════════════════════════════════════════════════");
    println!();
    println!("Elapsed Time: {:.3}s", elapsed_sec);
    println!();
    println!("Documents:");
    println!("  Seen:   {}", format_number(snapshot.seen));
    println!("  Parsed: {}", format_number(snapshot.parsed));
    println!("  Cached: {}", format_number(snapshot.cached));
    println!("  Failed: {}", format_number(snapshot.failed));
    println!("  Rate:   {}", format_rate(rate));
    println!();
    println!("Bytes:");
    println!("  In:  {}", format_bytes(snapshot.bytes_in));
    println!("  Out: {}", format_bytes(snapshot.bytes_out));
    if snapshot.failed > 0 {
        println!();
        println!("Failure classes:");
        println!("  parse:   {}", snapshot.failed_parse);
        println!("  io:      {}", snapshot.failed_io);
        println!("  timeout: {}", snapshot.failed_timeout);
        println!("  bug:     {}", snapshot.failed_bug);
        println!("  retryable (budget exhausted): {}", snapshot.failed_retryable);
    }
    let latency = snapshot.latency();
    if latency.count > 0 {
        use crate::util::format_micros;
        println!();
        println!("Parse latency:");
        println!("  Min:  {}", format_micros(latency.min_us));
        println!("  Mean: {}", format_micros(latency.mean_us as u64));
        println!("  Max:  {}", format_micros(latency.max_us));
        println!("  p50:  {}", format_micros(latency.p50_us));
        println!("  p99:  {}", format_micros(latency.p99_us));
    }
    println!("═══════════════════════════════════════════════════════════");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{Stage, StageMask};
    use crate::config::{
        CacheConfig, ClusterConfig, ManifestConfig, ManifestMode, OutputConfig, PipelineConfig,
        RuntimeConfig, WorkerConfig,
    };
    use crate::parser::mock::MockBackend;
    use std::sync::atomic::AtomicUsize;

    fn test_config(dir: &Path, cache: bool) -> Config {
        Config {
            manifest: ManifestConfig {
                path: dir.join("manifest.txt"),
                mode: ManifestMode::Shared,
                export_assignment: None,
            },
            pipeline: PipelineConfig {
                stages: StageMask::FAST,
                output_format: crate::abi::OutputFormat::Json,
                conduit_enabled: true,
                model_dir: None,
            },
            cache: CacheConfig {
                cache_dir: cache.then(|| dir.join("cache")),
                cache_size_mb: 64,
                l2_address: None,
            },
            workers: WorkerConfig {
                threads: 2,
                chunk_size: 4,
                prefetch_window: 8,
            },
            output: OutputConfig {
                output_dir: dir.join("out"),
                progress_interval_secs: 60,
                shard_max_bytes: 1024 * 1024,
                shard_buffer_bytes: 4096,
                flush_interval_secs: 5,
            },
            runtime: RuntimeConfig {
                resume: false,
                checkpoint_interval_docs: 2,
                doc_timeout_secs: 30,
                max_retries: 1,
                grace_period_secs: 5,
                dry_run: false,
            },
            cluster: ClusterConfig {
                num_locales: 1,
                locale_id: 0,
            },
        }
    }

    fn write_pdf(dir: &Path, name: &str, text: &str) -> ManifestEntry {
        let path = dir.join(name);
        let body = format!("%PDF-1.4\nBT ({}) Tj ET\n%%EOF padding padding", text);
        std::fs::write(&path, body).unwrap();
        ManifestEntry::plain(path)
    }

    fn run(
        config: Config,
        entries: Vec<ManifestEntry>,
        factory: SharedAdapterFactory,
    ) -> NodeReport {
        let optional = Arc::new(OptionalBackends::absent());
        run_node(
            Arc::new(config),
            entries,
            factory,
            optional,
            Arc::new(ProgressCounters::new()),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn empty_manifest_produces_zero_report() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), false);
        let out_dir = config.output.output_dir.clone();
        let report = run(config, Vec::new(), Arc::new(|| ParserAdapter::new()));
        assert_eq!(report.counters.seen, 0);
        assert_eq!(report.counters.parsed, 0);
        assert_eq!(report.counters.failed, 0);
        // Journal exists but is empty
        let skip = checkpoint::load_skip_set(&out_dir, 0).unwrap();
        assert!(skip.is_empty());
    }

    #[test]
    fn single_pdf_produces_both_artifacts_and_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), false);
        let out_dir = config.output.output_dir.clone();
        let entry = write_pdf(dir.path(), "doc.pdf", "Hello archival world");
        let report = run(
            config,
            vec![entry],
            Arc::new(|| ParserAdapter::new()),
        );
        assert_eq!(report.counters.seen, 1);
        assert_eq!(report.counters.parsed, 1);
        assert_eq!(report.counters.failed, 0);

        let extracted: Vec<_> = std::fs::read_dir(out_dir.join("extracted"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        // The extraction file and its framed .stages record
        assert_eq!(extracted.len(), 2);
        let stages = extracted
            .iter()
            .find(|p| p.extension().map_or(false, |e| e == "stages"))
            .unwrap();
        let bytes = std::fs::read(stages).unwrap();
        let (record, consumed) = StageRecord::read_framed(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        // A text-bearing pdf under the fast preset executes every fast bit
        assert_eq!(record.executed_mask(), StageMask::FAST);
        assert!(record.field(Stage::Merkle).is_some());

        let skip = checkpoint::load_skip_set(&out_dir, 0).unwrap();
        assert_eq!(skip.len(), 1);
    }

    #[test]
    fn missing_file_checkpointed_and_run_continues() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), false);
        let out_dir = config.output.output_dir.clone();
        let ok1 = write_pdf(dir.path(), "a.pdf", "First document body text");
        let missing = ManifestEntry::plain(dir.path().join("nope.pdf"));
        let ok2 = write_pdf(dir.path(), "b.pdf", "Second document body text");
        let report = run(
            config,
            vec![ok1, missing, ok2],
            Arc::new(|| ParserAdapter::new()),
        );
        assert_eq!(report.counters.seen, 3);
        assert_eq!(report.counters.parsed, 2);
        assert_eq!(report.counters.failed, 1);
        assert_eq!(report.counters.failed_io, 1);

        let skip = checkpoint::load_skip_set(&out_dir, 0).unwrap();
        assert_eq!(skip.len(), 3);
        // The failure is journaled with its class
        let errors = std::fs::read_to_string(out_dir.join("errors-0.jsonl")).unwrap();
        assert!(errors.contains("file-not-found") || errors.contains("terminal-io"));
    }

    #[test]
    fn unknown_magic_fails_without_invoking_parser() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), false);
        let path = dir.path().join("mystery.bin");
        std::fs::write(&path, b"no recognizable magic in this file").unwrap();

        let mock = MockBackend::new(ContentKind::Pdf);
        let invocations = mock.invocation_counter();
        let mock_holder = Arc::new(Mutex::new(Some(mock)));
        let factory: SharedAdapterFactory = Arc::new(move || {
            let mock = mock_holder
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| MockBackend::new(ContentKind::Pdf));
            ParserAdapter::with_backends(
                vec![Box::new(mock)],
                Arc::new(OptionalBackends::absent()),
            )
        });
        let report = run(config, vec![ManifestEntry::plain(path)], factory);
        assert_eq!(report.counters.failed, 1);
        assert_eq!(report.counters.failed_parse, 1);
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn warm_cache_rerun_invokes_no_parses() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_pdf(dir.path(), "doc.pdf", "Cached document content here");

        let first = run(
            test_config(dir.path(), true),
            vec![entry.clone()],
            Arc::new(|| ParserAdapter::new()),
        );
        assert_eq!(first.counters.parsed, 1);
        assert_eq!(first.counters.cached, 0);

        // Second run over the same manifest: pure cache hits
        let mock = MockBackend::new(ContentKind::Pdf);
        let invocations = mock.invocation_counter();
        let holder = Arc::new(Mutex::new(Some(mock)));
        let factory: SharedAdapterFactory = Arc::new(move || {
            let mock = holder
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| MockBackend::new(ContentKind::Pdf));
            ParserAdapter::with_backends(
                vec![Box::new(mock)],
                Arc::new(OptionalBackends::absent()),
            )
        });
        let second = run(test_config(dir.path(), true), vec![entry], factory);
        assert_eq!(second.counters.parsed, 0);
        assert_eq!(second.counters.cached, 1);
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn resume_skips_completed_documents() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_pdf(dir.path(), "doc.pdf", "Resumable document content");

        let first = run(
            test_config(dir.path(), false),
            vec![entry.clone()],
            Arc::new(|| ParserAdapter::new()),
        );
        assert_eq!(first.counters.parsed, 1);

        let mut config = test_config(dir.path(), false);
        config.runtime.resume = true;
        let second = run(config, vec![entry], Arc::new(|| ParserAdapter::new()));
        // Filtered before dispatch: not seen, not parsed, not failed
        assert_eq!(second.counters.seen, 0);
        assert_eq!(second.counters.parsed, 0);
        assert_eq!(second.counters.failed, 0);
    }

    #[test]
    fn duplicate_paths_parse_once_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_pdf(dir.path(), "dup.pdf", "Duplicate path stress content");
        let entries: Vec<ManifestEntry> = (0..8).map(|_| entry.clone()).collect();

        let config = test_config(dir.path(), true);
        let report = run(config, entries, Arc::new(|| ParserAdapter::new()));
        assert_eq!(report.counters.seen, 8);
        // Single-flight plus the cache: exactly one parse, the rest are hits
        assert_eq!(report.counters.parsed, 1);
        assert_eq!(report.counters.cached, 7);
    }

    #[test]
    fn timeout_document_contained() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), false);
        config.runtime.doc_timeout_secs = 1;
        config.workers.threads = 1;
        let out_dir = config.output.output_dir.clone();

        let slow = write_pdf(dir.path(), "slow.pdf", "slow document");
        let fast = write_pdf(dir.path(), "fast.pdf", "fast document");

        let made = Arc::new(AtomicUsize::new(0));
        let made_in = Arc::clone(&made);
        let factory: SharedAdapterFactory = Arc::new(move || {
            // First executor gets a slow mock; its replacement is fast
            let first = made_in.fetch_add(1, Ordering::SeqCst) == 0;
            let mock = if first {
                MockBackend::new(ContentKind::Pdf).with_delay(Duration::from_secs(5))
            } else {
                MockBackend::new(ContentKind::Pdf)
            };
            ParserAdapter::with_backends(
                vec![Box::new(mock)],
                Arc::new(OptionalBackends::absent()),
            )
        });
        let report = run(config, vec![slow, fast], factory);
        assert_eq!(report.counters.failed_timeout, 1);
        assert_eq!(report.counters.parsed, 1);
        let errors = std::fs::read_to_string(out_dir.join("errors-0.jsonl")).unwrap();
        assert!(errors.contains("timeout"));
    }
}
