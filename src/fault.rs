//! Fault handler
//!
//! Wraps each document invocation with a per-document wall-clock timeout,
//! classifies trapped failures, and applies a bounded retry policy with
//! exponential backoff to the retryable classes. A single document can never
//! abort the run: every failure mode collapses to a classified
//! [`ParseResult`] that the worker checkpoints.
//!
//! # Timeout mechanics
//!
//! Parses run on a dedicated executor thread per worker; the worker waits on
//! the response channel with a timeout. A timed-out parse is abandoned, not
//! cancelled: the executor keeps running to completion (its response is
//! discarded) and a replacement executor with a fresh adapter handle takes
//! over for subsequent documents. Single-flight waiters behave the same way:
//! a waiter timeout affects only the waiter.

use crate::abi::{ContentKind, OutputFormat, ParseResult, ParseStatus};
use crate::parser::{Extraction, ParserAdapter};
use crate::Result;
use anyhow::Context;
use crossbeam::channel::{bounded, Sender};
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Classified failure, per the error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultClass {
    #[error("retryable")]
    Retryable,
    #[error("terminal-parse")]
    TerminalParse,
    #[error("terminal-io")]
    TerminalIo,
    #[error("terminal-bug")]
    TerminalBug,
    #[error("timeout")]
    Timeout,
}

/// Classify a terminal parse status
pub fn classify(status: ParseStatus) -> Option<FaultClass> {
    match status {
        ParseStatus::Ok => None,
        ParseStatus::Error | ParseStatus::OutOfMemory => Some(FaultClass::Retryable),
        ParseStatus::ParseError | ParseStatus::UnsupportedFormat => Some(FaultClass::TerminalParse),
        ParseStatus::FileNotFound => Some(FaultClass::TerminalIo),
        ParseStatus::NullPointer => Some(FaultClass::TerminalBug),
    }
}

/// One parse request handed to the executor thread
pub struct ParseJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub format: OutputFormat,
    pub kind: ContentKind,
    pub conduit_hash: Option<String>,
    pub data: Vec<u8>,
}

type ParseResponse = (ParseResult, Option<Extraction>);

struct ExecutorJob {
    job: ParseJob,
    resp: Sender<ParseResponse>,
}

/// Factory for adapter handles, used to respawn after an abandoned parse
pub type AdapterFactory = Box<dyn Fn() -> Result<ParserAdapter> + Send + Sync>;

/// Dedicated parse thread owning one adapter handle
///
/// The worker owns exactly one executor; handles are initialized on the
/// executor thread at spawn and freed when the thread exits.
pub struct ParseExecutor {
    factory: AdapterFactory,
    tx: Sender<ExecutorJob>,
}

/// Outcome of a single timed attempt
pub enum Attempt {
    Completed(ParseResponse),
    TimedOut,
}

impl ParseExecutor {
    pub fn spawn(factory: AdapterFactory) -> Result<Self> {
        let tx = spawn_executor_thread(&factory)?;
        Ok(Self { factory, tx })
    }

    /// Run one parse with a wall-clock timeout
    pub fn run(&mut self, job: ParseJob, timeout: Duration) -> Result<Attempt> {
        let (resp_tx, resp_rx) = bounded(1);
        self.tx
            .send(ExecutorJob { job, resp: resp_tx })
            .context("parse executor thread is gone")?;
        match resp_rx.recv_timeout(timeout) {
            Ok(response) => Ok(Attempt::Completed(response)),
            Err(_) => {
                // Abandon the in-flight parse and move subsequent documents
                // onto a fresh executor with its own adapter handle.
                self.tx = spawn_executor_thread(&self.factory)?;
                Ok(Attempt::TimedOut)
            }
        }
    }
}

fn spawn_executor_thread(factory: &AdapterFactory) -> Result<Sender<ExecutorJob>> {
    let (tx, rx) = bounded::<ExecutorJob>(1);
    let adapter = factory()?;
    std::thread::Builder::new()
        .name("parse-executor".to_string())
        .spawn(move || {
            let mut adapter = adapter;
            while let Ok(ExecutorJob { job, resp }) = rx.recv() {
                let result = adapter.parse_with(
                    &job.input,
                    &job.output,
                    job.format,
                    job.kind,
                    job.conduit_hash.as_deref(),
                    &job.data,
                );
                // A receiver gone means the worker timed this parse out;
                // the completed result is simply discarded.
                let _ = resp.send(result);
            }
        })
        .context("Failed to spawn parse executor thread")?;
    Ok(tx)
}

/// Retry policy configuration
pub struct FaultHandler {
    pub doc_timeout: Duration,
    pub max_retries: u32,
    /// First backoff step; each retry quadruples it (1 s, 4 s by default)
    pub backoff_base: Duration,
}

impl FaultHandler {
    pub fn new(doc_timeout: Duration, max_retries: u32) -> Self {
        Self {
            doc_timeout,
            max_retries,
            backoff_base: Duration::from_secs(1),
        }
    }

    /// Run one document through the executor with retries.
    ///
    /// Returns the final (possibly failed) result, its classification when
    /// not ok, and the extraction on success.
    pub fn process(
        &self,
        executor: &mut ParseExecutor,
        make_job: impl Fn() -> ParseJob,
    ) -> Result<(ParseResult, Option<FaultClass>, Option<Extraction>)> {
        let mut attempt = 0u32;
        loop {
            let job = make_job();
            let (kind, input) = (job.kind, job.input.clone());
            match executor.run(job, self.doc_timeout)? {
                Attempt::TimedOut => {
                    // Timeouts are terminal and never retried
                    let result = ParseResult::failure(
                        ParseStatus::Error,
                        kind,
                        &format!(
                            "timeout after {:.0}s: {}",
                            self.doc_timeout.as_secs_f64(),
                            input.display()
                        ),
                    );
                    return Ok((result, Some(FaultClass::Timeout), None));
                }
                Attempt::Completed((result, extraction)) => {
                    // An impossible combination from the adapter is a bug,
                    // flagged instead of trusted.
                    if !result.is_consistent() {
                        let mut flagged = result;
                        flagged.status = ParseStatus::Error.as_i32();
                        if flagged.error_msg().is_empty() {
                            flagged.set_error_msg("adapter returned inconsistent ok result");
                        }
                        return Ok((flagged, Some(FaultClass::TerminalBug), None));
                    }
                    let status = result
                        .status()
                        .unwrap_or(ParseStatus::Error);
                    // Hash disagreements between conduit and backend are
                    // bugs, never transient; retrying cannot fix them.
                    if status == ParseStatus::Error
                        && result.error_msg().starts_with("content hash mismatch")
                    {
                        return Ok((result, Some(FaultClass::TerminalBug), None));
                    }
                    match classify(status) {
                        None => return Ok((result, None, extraction)),
                        Some(FaultClass::Retryable) if attempt < self.max_retries => {
                            attempt += 1;
                            let delay = self.backoff_delay(attempt);
                            warn!(
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = result.error_msg(),
                                "retryable failure, backing off"
                            );
                            std::thread::sleep(delay);
                        }
                        Some(class) => return Ok((result, Some(class), extraction)),
                    }
                }
            }
        }
    }

    /// Exponential backoff with jitter: base * 4^(attempt-1), +/-20%
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_base.as_secs_f64() * 4f64.powi(attempt as i32 - 1);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_secs_f64(base * jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::mock::MockBackend;
    use crate::parser::OptionalBackends;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn executor_with(
        make_mock: impl Fn() -> MockBackend + Send + Sync + 'static,
    ) -> ParseExecutor {
        ParseExecutor::spawn(Box::new(move || {
            ParserAdapter::with_backends(
                vec![Box::new(make_mock())],
                Arc::new(OptionalBackends::absent()),
            )
        }))
        .unwrap()
    }

    fn job(dir: &std::path::Path) -> ParseJob {
        ParseJob {
            input: PathBuf::from("/data/doc.pdf"),
            output: dir.join("out.json"),
            format: OutputFormat::Json,
            kind: ContentKind::Pdf,
            conduit_hash: None,
            data: b"%PDF-1.4 body".to_vec(),
        }
    }

    #[test]
    fn classification_covers_the_taxonomy() {
        assert_eq!(classify(ParseStatus::Ok), None);
        assert_eq!(classify(ParseStatus::Error), Some(FaultClass::Retryable));
        assert_eq!(
            classify(ParseStatus::OutOfMemory),
            Some(FaultClass::Retryable)
        );
        assert_eq!(
            classify(ParseStatus::FileNotFound),
            Some(FaultClass::TerminalIo)
        );
        assert_eq!(
            classify(ParseStatus::ParseError),
            Some(FaultClass::TerminalParse)
        );
        assert_eq!(
            classify(ParseStatus::NullPointer),
            Some(FaultClass::TerminalBug)
        );
    }

    #[test]
    fn successful_parse_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor_with(|| MockBackend::new(ContentKind::Pdf));
        let handler = FaultHandler::new(Duration::from_secs(5), 2);
        let (result, class, extraction) =
            handler.process(&mut executor, || job(dir.path())).unwrap();
        assert_eq!(result.status(), Some(ParseStatus::Ok));
        assert_eq!(class, None);
        assert!(extraction.is_some());
    }

    #[test]
    fn timeout_is_terminal_with_message_and_leaves_executor_usable() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let mut executor = executor_with(move || {
            let mock = if calls_in.fetch_add(1, Ordering::SeqCst) == 0 {
                MockBackend::new(ContentKind::Pdf).with_delay(Duration::from_millis(500))
            } else {
                MockBackend::new(ContentKind::Pdf)
            };
            mock
        });
        let handler = FaultHandler::new(Duration::from_millis(50), 2);
        let (result, class, _) = handler.process(&mut executor, || job(dir.path())).unwrap();
        assert_eq!(class, Some(FaultClass::Timeout));
        assert!(result.error_msg().contains("timeout"));

        // Subsequent documents run on the replacement executor
        let handler = FaultHandler::new(Duration::from_secs(5), 0);
        let (result, class, _) = handler.process(&mut executor, || job(dir.path())).unwrap();
        assert_eq!(result.status(), Some(ParseStatus::Ok));
        assert_eq!(class, None);
    }

    #[test]
    fn terminal_parse_failure_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor =
            executor_with(|| MockBackend::new(ContentKind::Pdf).failing("broken xref"));
        let handler = FaultHandler::new(Duration::from_secs(5), 3);
        let (result, class, _) = handler.process(&mut executor, || job(dir.path())).unwrap();
        assert_eq!(result.status(), Some(ParseStatus::ParseError));
        assert_eq!(class, Some(FaultClass::TerminalParse));
    }

    #[test]
    fn hash_disagreement_flagged_as_bug_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor_with(|| {
            MockBackend::new(ContentKind::Pdf).with_backend_hash("0".repeat(64))
        });
        let handler = FaultHandler::new(Duration::from_secs(5), 2);
        let (result, class, _) = handler.process(&mut executor, || job(dir.path())).unwrap();
        assert_ne!(result.status(), Some(ParseStatus::Ok));
        assert_eq!(class, Some(FaultClass::TerminalBug));
    }
}
