//! Progress counters, heartbeat reporter, and the run report
//!
//! Lock-free statistics with cache-line aligned counters. Workers update the
//! process-wide counter set without contention; a reporter thread emits a
//! heartbeat summary at the configured cadence; at shutdown node-local
//! counters are gathered to the driver and one run-report record is written.

use crate::fault::FaultClass;
use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

/// Cache-line aligned atomic counter to prevent false sharing
///
/// Adjacent counters updated from different worker threads would otherwise
/// share a cache line and invalidate each other on every increment.
#[repr(align(64))]
#[derive(Debug)]
pub struct AlignedCounter {
    value: AtomicU64,
    _padding: [u8; 56],
}

impl AlignedCounter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
            _padding: [0; 56],
        }
    }

    #[inline]
    pub fn add(&self, val: u64) {
        self.value.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for AlignedCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide counter set, updated lock-free by workers
#[derive(Debug, Default)]
pub struct ProgressCounters {
    pub seen: AlignedCounter,
    pub parsed: AlignedCounter,
    pub cached: AlignedCounter,
    pub failed: AlignedCounter,
    pub bytes_in: AlignedCounter,
    pub bytes_out: AlignedCounter,

    // Per-failure-class breakdown
    pub failed_retryable: AlignedCounter,
    pub failed_parse: AlignedCounter,
    pub failed_io: AlignedCounter,
    pub failed_bug: AlignedCounter,
    pub failed_timeout: AlignedCounter,

    /// Parse latency in microseconds. Updated once per parsed document, so a
    /// mutex is fine here.
    latency_us: Mutex<Option<Histogram<u64>>>,
}

impl ProgressCounters {
    pub fn new() -> Self {
        let counters = Self::default();
        *counters.latency_us.lock().unwrap() =
            Some(Histogram::new_with_bounds(1, 3_600_000_000, 3).expect("histogram bounds"));
        counters
    }

    pub fn record_failure(&self, class: FaultClass) {
        self.failed.add(1);
        match class {
            FaultClass::Retryable => self.failed_retryable.add(1),
            FaultClass::TerminalParse => self.failed_parse.add(1),
            FaultClass::TerminalIo => self.failed_io.add(1),
            FaultClass::TerminalBug => self.failed_bug.add(1),
            FaultClass::Timeout => self.failed_timeout.add(1),
        }
    }

    pub fn record_parse_latency(&self, elapsed: Duration) {
        if let Ok(mut guard) = self.latency_us.lock() {
            if let Some(hist) = guard.as_mut() {
                let _ = hist.record((elapsed.as_micros() as u64).max(1));
            }
        }
    }

    /// Serializable snapshot for heartbeats and the run report
    pub fn snapshot(&self) -> CounterSnapshot {
        let latency_pairs: Vec<(u64, u64)> = self
            .latency_us
            .lock()
            .ok()
            .and_then(|guard| {
                guard.as_ref().map(|hist| {
                    hist.iter_recorded()
                        .map(|v| (v.value_iterated_to(), v.count_at_value()))
                        .collect()
                })
            })
            .unwrap_or_default();

        CounterSnapshot {
            seen: self.seen.get(),
            parsed: self.parsed.get(),
            cached: self.cached.get(),
            failed: self.failed.get(),
            bytes_in: self.bytes_in.get(),
            bytes_out: self.bytes_out.get(),
            failed_retryable: self.failed_retryable.get(),
            failed_parse: self.failed_parse.get(),
            failed_io: self.failed_io.get(),
            failed_bug: self.failed_bug.get(),
            failed_timeout: self.failed_timeout.get(),
            latency_hist: bincode::serialize(&latency_pairs).unwrap_or_default(),
        }
    }
}

/// Counter values at one instant, serializable over the node protocol.
/// The latency histogram travels as bincode-serialized (value, count) pairs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub seen: u64,
    pub parsed: u64,
    pub cached: u64,
    pub failed: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub failed_retryable: u64,
    pub failed_parse: u64,
    pub failed_io: u64,
    pub failed_bug: u64,
    pub failed_timeout: u64,
    #[serde(default)]
    pub latency_hist: Vec<u8>,
}

impl CounterSnapshot {
    /// Sum another snapshot into this one (histograms re-recorded)
    pub fn merge(&mut self, other: &CounterSnapshot) {
        self.seen += other.seen;
        self.parsed += other.parsed;
        self.cached += other.cached;
        self.failed += other.failed;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        self.failed_retryable += other.failed_retryable;
        self.failed_parse += other.failed_parse;
        self.failed_io += other.failed_io;
        self.failed_bug += other.failed_bug;
        self.failed_timeout += other.failed_timeout;

        let mut ours = decode_latency(&self.latency_hist);
        for (value, count) in decode_latency(&other.latency_hist)
            .iter_recorded()
            .map(|v| (v.value_iterated_to(), v.count_at_value()))
        {
            let _ = ours.record_n(value, count);
        }
        let pairs: Vec<(u64, u64)> = ours
            .iter_recorded()
            .map(|v| (v.value_iterated_to(), v.count_at_value()))
            .collect();
        self.latency_hist = bincode::serialize(&pairs).unwrap_or_default();
    }

    pub fn latency(&self) -> LatencyBlock {
        let hist = decode_latency(&self.latency_hist);
        if hist.is_empty() {
            return LatencyBlock::default();
        }
        LatencyBlock {
            count: hist.len(),
            min_us: hist.min(),
            mean_us: hist.mean(),
            max_us: hist.max(),
            p50_us: hist.value_at_quantile(0.50),
            p90_us: hist.value_at_quantile(0.90),
            p99_us: hist.value_at_quantile(0.99),
            p999_us: hist.value_at_quantile(0.999),
        }
    }
}

fn decode_latency(bytes: &[u8]) -> Histogram<u64> {
    let mut hist = Histogram::new_with_bounds(1, 3_600_000_000, 3).expect("histogram bounds");
    if let Ok(pairs) = bincode::deserialize::<Vec<(u64, u64)>>(bytes) {
        for (value, count) in pairs {
            let _ = hist.record_n(value, count);
        }
    }
    hist
}

/// Parse-latency percentiles for reports
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyBlock {
    pub count: u64,
    pub min_us: u64,
    pub mean_us: f64,
    pub max_us: u64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
}

/// One node's contribution to the run report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_name: String,
    pub locale_id: usize,
    pub counters: CounterSnapshot,
    pub latency: LatencyBlock,
    pub elapsed_sec: f64,
}

/// The final aggregated run-report record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_sec: f64,
    pub totals: CounterSnapshot,
    pub throughput_docs_per_sec: f64,
    pub latency: LatencyBlock,
    pub per_node: Vec<NodeReport>,
}

impl RunReport {
    /// Assemble the aggregate from per-node reports
    pub fn assemble(
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        per_node: Vec<NodeReport>,
    ) -> Self {
        let mut totals = CounterSnapshot::default();
        for node in &per_node {
            totals.merge(&node.counters);
        }
        let elapsed_sec = (finished_at - started_at)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        let completed = totals.parsed + totals.cached + totals.failed;
        let throughput = if elapsed_sec > 0.0 {
            completed as f64 / elapsed_sec
        } else {
            0.0
        };
        let latency = totals.latency();
        Self {
            started_at,
            finished_at,
            elapsed_sec,
            totals,
            throughput_docs_per_sec: throughput,
            latency,
            per_node,
        }
    }

    /// Write `<output-dir>/run-report.json`
    pub fn write(&self, output_dir: &Path) -> Result<std::path::PathBuf> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create output dir: {}", output_dir.display()))?;
        let path = output_dir.join("run-report.json");
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write run report: {}", path.display()))?;
        Ok(path)
    }
}

/// Emit one heartbeat line to the progress stream (stderr via tracing)
pub fn heartbeat(snapshot: &CounterSnapshot, elapsed: Duration) {
    let completed = snapshot.parsed + snapshot.cached + snapshot.failed;
    let rate = if elapsed.as_secs_f64() > 0.0 {
        completed as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    info!(
        seen = snapshot.seen,
        parsed = snapshot.parsed,
        cached = snapshot.cached,
        failed = snapshot.failed,
        bytes_in = snapshot.bytes_in,
        bytes_out = snapshot.bytes_out,
        docs_per_sec = format!("{:.1}", rate),
        "progress"
    );
}
