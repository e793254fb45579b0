//! Native-parser adapter
//!
//! This module presents one stable entry point per content kind over the
//! variant parser backends. The adapter owns failure translation: any panic or
//! error inside a backend is trapped at this boundary and turned into a
//! [`ParseStatus`] with a populated `error_msg`; a backend must never take the
//! process down.
//!
//! # Architecture
//!
//! The [`ParserBackend`] trait provides a uniform interface over the variant
//! backends (pdf, image, audio/video, epub, geospatial). Each worker owns its
//! own adapter handle, initialized once at worker start and freed at worker
//! shutdown; the handle is `Send` but deliberately not `Sync`.
//!
//! Optional backends (GPU OCR, ML inference) are capability-discovered at
//! startup by probing for a version symbol in the corresponding dynamic
//! library; absence degrades only the affected stages.

pub mod backends;
pub mod mock;
pub mod optional;

pub use optional::OptionalBackends;

use crate::abi::{ContentKind, OutputFormat, ParseResult, ParseStatus, StageMask};
use crate::conduit;
use crate::output::emit;
use crate::Result;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Backend-level failure, translated to a [`ParseStatus`] at the adapter boundary
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unsupported format: {0}")]
    Unsupported(String),

    #[error("corrupted file: {0}")]
    Corrupted(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    fn status(&self) -> ParseStatus {
        match self {
            BackendError::Unsupported(_) => ParseStatus::UnsupportedFormat,
            BackendError::Corrupted(_) => ParseStatus::ParseError,
            BackendError::OutOfMemory(_) => ParseStatus::OutOfMemory,
            BackendError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ParseStatus::FileNotFound
            }
            BackendError::Io(_) => ParseStatus::Error,
        }
    }
}

/// A subtitle or media stream descriptor surfaced by the audio/video backend
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamDesc {
    /// Stream classification ("video", "audio", "subtitle", "text")
    pub stream_type: String,
    /// Codec or handler tag as found in the container
    pub codec: String,
}

/// Rich extraction produced by a backend before it is narrowed to the
/// fixed-layout [`ParseResult`]
///
/// Lives only inside the worker: the stage pipeline reads the text and
/// metadata from here, the output emitters serialize it, and it is discarded
/// after the document completes. Nothing in this struct crosses the ABI.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub text: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub page_count: i32,
    pub duration_sec: f64,
    pub streams: Vec<StreamDesc>,
    pub metadata: Vec<(String, String)>,
    /// Hash computed by the backend itself, when the native library reports one.
    /// The conduit's hash is authoritative; a silent disagreement is promoted
    /// to an internal-bug failure by the adapter.
    pub backend_hash: Option<String>,
}

impl Extraction {
    pub fn word_count(&self) -> i64 {
        self.text.split_whitespace().count() as i64
    }

    pub fn char_count(&self) -> i64 {
        self.text.chars().count() as i64
    }
}

/// Uniform interface over the variant parser backends
///
/// Backends are `Send` so the adapter can move between threads at setup, but
/// each worker owns its own backend instances; nothing here is shared.
pub trait ParserBackend: Send {
    /// One-time initialization. Called once per worker before any parse.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Content kind this backend claims
    fn kind(&self) -> ContentKind;

    /// Extract content and metadata from the raw file bytes
    fn extract(&mut self, input: &Path, data: &[u8]) -> std::result::Result<Extraction, BackendError>;

    /// Backend version string
    fn version(&self) -> &'static str;
}

/// Polymorphic front over the variant backends; one handle per worker
pub struct ParserAdapter {
    backends: Vec<Box<dyn ParserBackend>>,
    optional: Arc<OptionalBackends>,
}

impl ParserAdapter {
    /// Construct and initialize all built-in backends and probe the optional
    /// dynamic libraries. Asserts the ABI record layout.
    pub fn new() -> Result<Self> {
        crate::abi::assert_abi_layout();
        Self::with_backends(
            backends::builtin_backends(),
            Arc::new(OptionalBackends::probe(None)),
        )
    }

    /// Construct with an explicit backend set (used by tests and by workers
    /// that substitute the mock backend)
    pub fn with_backends(
        mut backends: Vec<Box<dyn ParserBackend>>,
        optional: Arc<OptionalBackends>,
    ) -> Result<Self> {
        for b in backends.iter_mut() {
            b.init()?;
        }
        Ok(Self { backends, optional })
    }

    pub fn optional(&self) -> &Arc<OptionalBackends> {
        &self.optional
    }

    /// Version line covering the adapter and every backend
    pub fn version_string(&self) -> String {
        let mut parts = vec![format!("docex-adapter {}", env!("CARGO_PKG_VERSION"))];
        for b in &self.backends {
            parts.push(format!("{}={}", b.kind().name(), b.version()));
        }
        parts.join(" ")
    }

    /// Classify, parse, and write the extraction file. Entry point for the C
    /// shim, which has no conduit result to hand in.
    pub fn parse_detected(
        &mut self,
        input: &Path,
        output: &Path,
        format: OutputFormat,
        _mask: StageMask,
    ) -> ParseResult {
        let data = match std::fs::read(input) {
            Ok(d) => d,
            Err(e) => {
                let status = if e.kind() == std::io::ErrorKind::NotFound {
                    ParseStatus::FileNotFound
                } else {
                    ParseStatus::Error
                };
                return ParseResult::failure(status, ContentKind::Unknown, &e.to_string());
            }
        };
        let (kind, _mime) = conduit::classify(&data[..data.len().min(4096)]);
        let (result, _extraction) = self.parse_with(input, output, format, kind, None, &data);
        result
    }

    /// Parse a document whose kind and (optionally) content hash the conduit
    /// already established. Returns the fixed-layout result plus the rich
    /// extraction for the stage pipeline.
    ///
    /// `data` is the full file content; the caller (worker/prefetcher) reads
    /// it exactly once.
    pub fn parse_with(
        &mut self,
        input: &Path,
        output: &Path,
        format: OutputFormat,
        kind: ContentKind,
        conduit_hash: Option<&str>,
        data: &[u8],
    ) -> (ParseResult, Option<Extraction>) {
        let start = Instant::now();

        let backend = match self.backends.iter_mut().find(|b| b.kind() == kind) {
            Some(b) => b,
            None => {
                let mut r = ParseResult::failure(
                    ParseStatus::UnsupportedFormat,
                    kind,
                    &format!("no backend claims kind {}", kind),
                );
                r.parse_time_ms = start.elapsed().as_secs_f64() * 1000.0;
                return (r, None);
            }
        };

        // Trap panics at the adapter boundary: a backend abort becomes a
        // parse-error result, never process termination.
        let outcome = catch_unwind(AssertUnwindSafe(|| backend.extract(input, data)));

        let extraction = match outcome {
            Ok(Ok(e)) => e,
            Ok(Err(err)) => {
                let mut r = ParseResult::failure(err.status(), kind, &err.to_string());
                r.parse_time_ms = start.elapsed().as_secs_f64() * 1000.0;
                return (r, None);
            }
            Err(panic) => {
                let msg = panic_message(&panic);
                let mut r = ParseResult::failure(
                    ParseStatus::ParseError,
                    kind,
                    &format!("backend panic: {}", msg),
                );
                r.parse_time_ms = start.elapsed().as_secs_f64() * 1000.0;
                return (r, None);
            }
        };

        // Content hash: the conduit's precomputed hash is authoritative. A
        // backend-reported hash that disagrees must not pass silently.
        let hash = match conduit_hash {
            Some(h) => h.to_string(),
            None => conduit::hash_bytes(data),
        };
        if let Some(ref backend_hash) = extraction.backend_hash {
            if backend_hash != &hash {
                let mut r = ParseResult::failure(
                    ParseStatus::Error,
                    kind,
                    &format!("content hash mismatch: conduit {} backend {}", hash, backend_hash),
                );
                r.parse_time_ms = start.elapsed().as_secs_f64() * 1000.0;
                return (r, None);
            }
        }

        let mime = mime_for(kind, data);
        if let Err(e) = emit::write_extraction(output, format, input, &extraction, &hash, mime) {
            let mut r = ParseResult::failure(ParseStatus::Error, kind, &e.to_string());
            r.parse_time_ms = start.elapsed().as_secs_f64() * 1000.0;
            return (r, None);
        }

        let mut result = ParseResult::new(ParseStatus::Ok, kind);
        result.page_count = extraction.page_count;
        result.word_count = extraction.word_count();
        result.char_count = extraction.char_count();
        result.duration_sec = extraction.duration_sec;
        result.set_sha256(&hash);
        result.set_mime_type(mime);
        if let Some(ref t) = extraction.title {
            result.set_title(t);
        }
        if let Some(ref a) = extraction.author {
            result.set_author(a);
        }
        result.parse_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        (result, Some(extraction))
    }
}

/// Mime type for a detected kind, refined by the actual head bytes
fn mime_for(kind: ContentKind, data: &[u8]) -> &'static str {
    let head = &data[..data.len().min(64)];
    match conduit::classify(head) {
        (k, mime) if k == kind => mime,
        _ => match kind {
            ContentKind::Pdf => "application/pdf",
            ContentKind::Image => "application/octet-stream",
            ContentKind::Audio => "application/octet-stream",
            ContentKind::Video => "application/octet-stream",
            ContentKind::Epub => "application/epub+zip",
            ContentKind::Geospatial => "application/octet-stream",
            ContentKind::Unknown => "application/octet-stream",
        },
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::mock::MockBackend;

    fn adapter_with_mock(mock: MockBackend) -> ParserAdapter {
        ParserAdapter::with_backends(vec![Box::new(mock)], Arc::new(OptionalBackends::absent()))
            .unwrap()
    }

    #[test]
    fn unsupported_kind_reports_unsupported_format() {
        let mut adapter = adapter_with_mock(MockBackend::new(ContentKind::Pdf));
        let dir = tempfile::tempdir().unwrap();
        let (result, extraction) = adapter.parse_with(
            Path::new("x.mkv"),
            &dir.path().join("out.json"),
            OutputFormat::Json,
            ContentKind::Video,
            None,
            b"\x1a\x45\xdf\xa3",
        );
        assert_eq!(result.status(), Some(ParseStatus::UnsupportedFormat));
        assert!(extraction.is_none());
    }

    #[test]
    fn backend_panic_becomes_parse_error() {
        let mut adapter = adapter_with_mock(MockBackend::new(ContentKind::Pdf).panic_on_parse());
        let dir = tempfile::tempdir().unwrap();
        let (result, _) = adapter.parse_with(
            Path::new("doc.pdf"),
            &dir.path().join("out.json"),
            OutputFormat::Json,
            ContentKind::Pdf,
            None,
            b"%PDF-1.4 body",
        );
        assert_eq!(result.status(), Some(ParseStatus::ParseError));
        assert!(result.error_msg().contains("panic"));
    }

    #[test]
    fn conduit_and_backend_hash_disagreement_is_an_error() {
        let mock = MockBackend::new(ContentKind::Pdf).with_backend_hash("0".repeat(64));
        let mut adapter = adapter_with_mock(mock);
        let dir = tempfile::tempdir().unwrap();
        let (result, _) = adapter.parse_with(
            Path::new("doc.pdf"),
            &dir.path().join("out.json"),
            OutputFormat::Json,
            ContentKind::Pdf,
            Some(&"f".repeat(64)),
            b"%PDF-1.4 body",
        );
        assert_eq!(result.status(), Some(ParseStatus::Error));
        assert!(result.error_msg().contains("hash mismatch"));
    }

    #[test]
    fn ok_parse_is_consistent_and_writes_output() {
        let mut adapter = adapter_with_mock(MockBackend::new(ContentKind::Pdf));
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.json");
        let (result, extraction) = adapter.parse_with(
            Path::new("doc.pdf"),
            &out,
            OutputFormat::Json,
            ContentKind::Pdf,
            None,
            b"%PDF-1.4 body",
        );
        assert_eq!(result.status(), Some(ParseStatus::Ok));
        assert!(result.is_consistent());
        assert!(extraction.is_some());
        assert!(out.exists());
    }
}
