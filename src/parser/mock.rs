//! Mock parser backend for testing
//!
//! This module provides a mock implementation of the [`ParserBackend`] trait.
//! The mock backend produces deterministic extractions without decoding any
//! real format, making engine tests fast and reproducible.
//!
//! # Features
//!
//! - Configurable success/failure/panic behavior
//! - Configurable parse delay (for timeout scenarios)
//! - Tracks every parse invocation (for single-flight and resume assertions)
//! - Optional backend-reported content hash (for hash-disagreement tests)

use super::{BackendError, Extraction, ParserBackend};
use crate::abi::ContentKind;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mock parser backend
///
/// Shared handles to the invocation counter and path log survive the backend
/// being moved into an adapter, so tests can assert on them afterwards.
pub struct MockBackend {
    kind: ContentKind,
    delay: Option<Duration>,
    fail_with: Option<String>,
    panic_on_parse: bool,
    backend_hash: Option<String>,
    text: String,
    invocations: Arc<AtomicUsize>,
    parsed_paths: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    pub fn new(kind: ContentKind) -> Self {
        Self {
            kind,
            delay: None,
            fail_with: None,
            panic_on_parse: false,
            backend_hash: None,
            text: "the quick brown fox jumps over the lazy dog".to_string(),
            invocations: Arc::new(AtomicUsize::new(0)),
            parsed_paths: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sleep this long inside every parse
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every parse with a corrupted-file error carrying this message
    pub fn failing(mut self, msg: &str) -> Self {
        self.fail_with = Some(msg.to_string());
        self
    }

    /// Panic inside every parse (exercises the adapter's trap)
    pub fn panic_on_parse(mut self) -> Self {
        self.panic_on_parse = true;
        self
    }

    /// Report this hash from the backend side
    pub fn with_backend_hash(mut self, hash: String) -> Self {
        self.backend_hash = Some(hash);
        self
    }

    /// Extracted text returned by every parse
    pub fn with_text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    /// Shared invocation counter handle
    pub fn invocation_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.invocations)
    }

    /// Shared log of parsed input paths
    pub fn parsed_paths(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.parsed_paths)
    }
}

impl ParserBackend for MockBackend {
    fn kind(&self) -> ContentKind {
        self.kind
    }

    fn extract(&mut self, input: &Path, data: &[u8]) -> Result<Extraction, BackendError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut paths) = self.parsed_paths.lock() {
            paths.push(input.display().to_string());
        }

        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.panic_on_parse {
            panic!("mock backend asked to panic");
        }
        if let Some(ref msg) = self.fail_with {
            return Err(BackendError::Corrupted(msg.clone()));
        }

        Ok(Extraction {
            text: self.text.clone(),
            title: Some("Mock Document".to_string()),
            author: None,
            page_count: 1,
            duration_sec: 0.0,
            streams: Vec::new(),
            metadata: vec![("bytes".to_string(), data.len().to_string())],
            backend_hash: self.backend_hash.clone(),
        })
    }

    fn version(&self) -> &'static str {
        "mock 0.1.0"
    }
}
