//! Stable binary ABI between the orchestration layer and the native parsers
//!
//! This module defines the fixed-layout record types and enumerations that cross
//! the adapter boundary. The layout is part of the public contract: no pointer
//! fields, no variable-length arrays, all strings fixed-capacity NUL-terminated.
//! Sizes and alignments are asserted both at compile time and at adapter
//! initialization, and are identical on any 64-bit platform where int32=4,
//! int64=8, f64=8, char=1.
//!
//! # Records
//!
//! - [`ParseResult`]: 952 bytes, 8-byte aligned, returned by value from `parse`
//! - [`ConduitResult`]: 88 bytes, produced by the preprocessing conduit
//!
//! # C surface
//!
//! The minimum stable function surface (`init`, `free`, `parse`, `version`) is
//! exported from [`shim`]. Null-pointer inputs to `free` are no-ops; `parse`
//! with a null handle returns a result with status [`ParseStatus::NullPointer`].

pub mod shim;
pub mod stage_mask;

pub use stage_mask::{Stage, StageMask};

use std::fmt;

/// Content kind detected for a document
///
/// Closed enumeration, bijectively mapped to integers 0..6 at the ABI boundary.
/// New kinds are appended, never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(i32)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Pdf = 0,
    Image = 1,
    Audio = 2,
    Video = 3,
    Epub = 4,
    Geospatial = 5,
    Unknown = 6,
}

impl ContentKind {
    /// All kinds in discriminant order
    pub const ALL: [ContentKind; 7] = [
        ContentKind::Pdf,
        ContentKind::Image,
        ContentKind::Audio,
        ContentKind::Video,
        ContentKind::Epub,
        ContentKind::Geospatial,
        ContentKind::Unknown,
    ];

    /// Integer form used at the ABI boundary
    #[inline]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Reverse mapping from the ABI integer. Returns `None` outside 0..6.
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(ContentKind::Pdf),
            1 => Some(ContentKind::Image),
            2 => Some(ContentKind::Audio),
            3 => Some(ContentKind::Video),
            4 => Some(ContentKind::Epub),
            5 => Some(ContentKind::Geospatial),
            6 => Some(ContentKind::Unknown),
            _ => None,
        }
    }

    /// Short lowercase name, used in shard file names and reports
    pub fn name(self) -> &'static str {
        match self {
            ContentKind::Pdf => "pdf",
            ContentKind::Image => "image",
            ContentKind::Audio => "audio",
            ContentKind::Video => "video",
            ContentKind::Epub => "epub",
            ContentKind::Geospatial => "geospatial",
            ContentKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Terminal status of a parse invocation
///
/// Closed enumeration, integers 0..6 at the ABI boundary. `Error` and
/// `OutOfMemory` are classified retryable; the rest are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(i32)]
#[serde(rename_all = "kebab-case")]
pub enum ParseStatus {
    Ok = 0,
    Error = 1,
    FileNotFound = 2,
    ParseError = 3,
    NullPointer = 4,
    UnsupportedFormat = 5,
    OutOfMemory = 6,
}

impl ParseStatus {
    pub const ALL: [ParseStatus; 7] = [
        ParseStatus::Ok,
        ParseStatus::Error,
        ParseStatus::FileNotFound,
        ParseStatus::ParseError,
        ParseStatus::NullPointer,
        ParseStatus::UnsupportedFormat,
        ParseStatus::OutOfMemory,
    ];

    #[inline]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(ParseStatus::Ok),
            1 => Some(ParseStatus::Error),
            2 => Some(ParseStatus::FileNotFound),
            3 => Some(ParseStatus::ParseError),
            4 => Some(ParseStatus::NullPointer),
            5 => Some(ParseStatus::UnsupportedFormat),
            6 => Some(ParseStatus::OutOfMemory),
            _ => None,
        }
    }

    /// Whether the fault handler may retry a document that ended in this status
    #[inline]
    pub fn is_retryable(self) -> bool {
        matches!(self, ParseStatus::Error | ParseStatus::OutOfMemory)
    }

    pub fn name(self) -> &'static str {
        match self {
            ParseStatus::Ok => "ok",
            ParseStatus::Error => "error",
            ParseStatus::FileNotFound => "file-not-found",
            ParseStatus::ParseError => "parse-error",
            ParseStatus::NullPointer => "null-pointer",
            ParseStatus::UnsupportedFormat => "unsupported-format",
            ParseStatus::OutOfMemory => "out-of-memory",
        }
    }
}

impl fmt::Display for ParseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Output format for extracted content
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, clap::ValueEnum)]
#[repr(i32)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// S-expression
    Scheme = 0,
    /// UTF-8 JSON
    Json = 1,
    /// Tabular with header row
    Csv = 2,
}

impl OutputFormat {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(OutputFormat::Scheme),
            1 => Some(OutputFormat::Json),
            2 => Some(OutputFormat::Csv),
            _ => None,
        }
    }

    /// File extension for extraction files and shards
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Scheme => "scm",
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
        }
    }
}

/// Fixed-layout parse result, returned by value across the adapter boundary
///
/// Exactly 952 bytes, 8-byte aligned. Field offsets are part of the contract:
///
/// ```text
/// offset   0: status        (int32)
/// offset   4: content_kind  (int32)
/// offset   8: page_count    (int32)
/// offset  12: 4 bytes padding
/// offset  16: word_count    (int64)
/// offset  24: char_count    (int64)
/// offset  32: duration_sec  (f64)
/// offset  40: parse_time_ms (f64)
/// offset  48: sha256        (65 bytes, ASCII hex + NUL)
/// offset 113: 7 bytes padding
/// offset 120: error_msg     (256 bytes)
/// offset 376: title         (256 bytes)
/// offset 632: author        (256 bytes)
/// offset 888: mime_type     (64 bytes)
/// ```
///
/// All character arrays are NUL-terminated within capacity. No pointers cross
/// the boundary.
#[repr(C)]
#[derive(Clone)]
pub struct ParseResult {
    pub status: i32,
    pub content_kind: i32,
    pub page_count: i32,
    _pad0: [u8; 4],
    pub word_count: i64,
    pub char_count: i64,
    pub duration_sec: f64,
    pub parse_time_ms: f64,
    pub sha256: [u8; 65],
    _pad1: [u8; 7],
    pub error_msg: [u8; 256],
    pub title: [u8; 256],
    pub author: [u8; 256],
    pub mime_type: [u8; 64],
}

// Layout invariants checked at compile time; re-checked at adapter init.
const _: () = assert!(std::mem::size_of::<ParseResult>() == 952);
const _: () = assert!(std::mem::align_of::<ParseResult>() == 8);
const _: () = assert!(std::mem::offset_of!(ParseResult, word_count) == 16);
const _: () = assert!(std::mem::offset_of!(ParseResult, sha256) == 48);
const _: () = assert!(std::mem::offset_of!(ParseResult, error_msg) == 120);
const _: () = assert!(std::mem::offset_of!(ParseResult, title) == 376);
const _: () = assert!(std::mem::offset_of!(ParseResult, author) == 632);
const _: () = assert!(std::mem::offset_of!(ParseResult, mime_type) == 888);
const _: () = assert!(std::mem::size_of::<ConduitResult>() == 88);
const _: () = assert!(std::mem::offset_of!(ConduitResult, sha256) == 16);

impl ParseResult {
    /// Zeroed result with the given status and content kind
    pub fn new(status: ParseStatus, kind: ContentKind) -> Self {
        let mut r: ParseResult = unsafe { std::mem::zeroed() };
        r.status = status.as_i32();
        r.content_kind = kind.as_i32();
        r
    }

    /// Failure result with a populated error message
    pub fn failure(status: ParseStatus, kind: ContentKind, msg: &str) -> Self {
        let mut r = Self::new(status, kind);
        r.set_error_msg(msg);
        r
    }

    #[inline]
    pub fn status(&self) -> Option<ParseStatus> {
        ParseStatus::from_i32(self.status)
    }

    #[inline]
    pub fn kind(&self) -> Option<ContentKind> {
        ContentKind::from_i32(self.content_kind)
    }

    /// Copy `msg` into `error_msg`, truncated to 255 bytes + NUL
    pub fn set_error_msg(&mut self, msg: &str) {
        copy_cstr(&mut self.error_msg, msg);
    }

    pub fn set_title(&mut self, title: &str) {
        copy_cstr(&mut self.title, title);
    }

    pub fn set_author(&mut self, author: &str) {
        copy_cstr(&mut self.author, author);
    }

    pub fn set_mime_type(&mut self, mime: &str) {
        copy_cstr(&mut self.mime_type, mime);
    }

    /// Copy a 64-hex content hash into the sha256 field
    pub fn set_sha256(&mut self, hex: &str) {
        copy_cstr(&mut self.sha256, hex);
    }

    pub fn error_msg(&self) -> &str {
        read_cstr(&self.error_msg)
    }

    pub fn title(&self) -> &str {
        read_cstr(&self.title)
    }

    pub fn author(&self) -> &str {
        read_cstr(&self.author)
    }

    pub fn mime_type(&self) -> &str {
        read_cstr(&self.mime_type)
    }

    pub fn sha256(&self) -> &str {
        read_cstr(&self.sha256)
    }

    /// Whole-record view as bytes, for cache storage
    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self as *const ParseResult as *const u8,
                                       std::mem::size_of::<ParseResult>())
        }
    }

    /// Rebuild from a cached blob. Returns `None` on length mismatch.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != std::mem::size_of::<ParseResult>() {
            return None;
        }
        let mut r: ParseResult = unsafe { std::mem::zeroed() };
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                &mut r as *mut ParseResult as *mut u8,
                std::mem::size_of::<ParseResult>(),
            );
        }
        Some(r)
    }

    /// Internal consistency check for the ok path
    ///
    /// status == ok requires a known content kind and a 64-hex content hash.
    /// A violation is classified as an internal bug by the fault handler.
    pub fn is_consistent(&self) -> bool {
        if self.status() != Some(ParseStatus::Ok) {
            return true;
        }
        self.kind().map_or(false, |k| k != ContentKind::Unknown)
            && self.sha256().len() == 64
            && self.sha256().bytes().all(|b| b.is_ascii_hexdigit())
            && !self.mime_type().is_empty()
    }
}

impl fmt::Debug for ParseResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParseResult")
            .field("status", &self.status())
            .field("content_kind", &self.kind())
            .field("page_count", &self.page_count)
            .field("word_count", &self.word_count)
            .field("char_count", &self.char_count)
            .field("duration_sec", &self.duration_sec)
            .field("parse_time_ms", &self.parse_time_ms)
            .field("sha256", &self.sha256())
            .field("error_msg", &self.error_msg())
            .field("title", &self.title())
            .field("author", &self.author())
            .field("mime_type", &self.mime_type())
            .finish()
    }
}

/// Conduit validation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(i32)]
#[serde(rename_all = "kebab-case")]
pub enum Validation {
    Ok = 0,
    TooSmall = 1,
    BadMagic = 2,
    Unreadable = 3,
}

impl Validation {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Validation::Ok),
            1 => Some(Validation::TooSmall),
            2 => Some(Validation::BadMagic),
            3 => Some(Validation::Unreadable),
            _ => None,
        }
    }
}

/// Fixed-layout conduit result, 88 bytes
///
/// ```text
/// offset  0: kind       (int32)
/// offset  4: validation (int32)
/// offset  8: file_size  (u64)
/// offset 16: sha256     (65 bytes, empty string when hashing not requested)
/// offset 81: 7 bytes padding
/// ```
#[repr(C)]
#[derive(Clone)]
pub struct ConduitResult {
    pub kind: i32,
    pub validation: i32,
    pub file_size: u64,
    pub sha256: [u8; 65],
    _pad: [u8; 7],
}

impl ConduitResult {
    pub fn new(kind: ContentKind, validation: Validation, file_size: u64) -> Self {
        let mut r: ConduitResult = unsafe { std::mem::zeroed() };
        r.kind = kind.as_i32();
        r.validation = validation.as_i32();
        r.file_size = file_size;
        r
    }

    #[inline]
    pub fn kind(&self) -> Option<ContentKind> {
        ContentKind::from_i32(self.kind)
    }

    #[inline]
    pub fn validation(&self) -> Option<Validation> {
        Validation::from_i32(self.validation)
    }

    pub fn set_sha256(&mut self, hex: &str) {
        copy_cstr(&mut self.sha256, hex);
    }

    pub fn sha256(&self) -> &str {
        read_cstr(&self.sha256)
    }

    /// True when the document may proceed to the parser adapter
    pub fn is_valid(&self) -> bool {
        self.validation() == Some(Validation::Ok)
    }
}

impl fmt::Debug for ConduitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConduitResult")
            .field("kind", &self.kind())
            .field("validation", &self.validation())
            .field("file_size", &self.file_size)
            .field("sha256", &self.sha256())
            .finish()
    }
}

/// Copy a string into a fixed NUL-terminated buffer, truncating to capacity - 1
fn copy_cstr(dst: &mut [u8], src: &str) {
    let cap = dst.len() - 1;
    let mut take = src.len().min(cap);
    // Do not split a UTF-8 sequence at the truncation point
    while take > 0 && !src.is_char_boundary(take) {
        take -= 1;
    }
    dst[..take].copy_from_slice(&src.as_bytes()[..take]);
    dst[take..].fill(0);
}

/// Read a NUL-terminated buffer back as &str (lossy fields never stored)
fn read_cstr(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

/// Assert the record layout at runtime. Called once at adapter initialization.
///
/// The compile-time assertions make this unreachable in practice, but the
/// layout is a public contract and the adapter refuses to start without it.
pub fn assert_abi_layout() {
    assert_eq!(std::mem::size_of::<ParseResult>(), 952);
    assert_eq!(std::mem::align_of::<ParseResult>(), 8);
    assert_eq!(std::mem::size_of::<ConduitResult>(), 88);
    assert_eq!(std::mem::align_of::<ConduitResult>(), 8);
}
