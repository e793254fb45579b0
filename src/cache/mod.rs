//! Two-level result cache
//!
//! Results are cached so a run survives restarts and recomputation. L1 is a
//! per-node embedded LMDB store keyed by (canonical path, mtime-ns, size);
//! L2 is an optional cross-node store keyed by content hash. Both are
//! advisory: a miss is always safe, and a stale entry is impossible while the
//! key inputs are stable, so no cross-node invalidation exists.
//!
//! Probe order on the hot path: L1, then L2 (only when configured), then
//! parse. Stores go to both; an L2 error downgrades to L1-only without
//! failing the document.

pub mod l1;
pub mod l2;
pub mod singleflight;

pub use l1::L1Cache;
pub use l2::L2Cache;
pub use singleflight::SingleFlight;

use crate::abi::ParseResult;
use std::path::Path;

/// L1 cache key: (canonical document path, mtime nanoseconds, size bytes)
///
/// Stable across runs that do not modify the file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CacheKey {
    pub path: String,
    pub mtime_ns: u64,
    pub size: u64,
}

impl CacheKey {
    pub fn new(path: &Path, mtime_ns: u64, size: u64) -> Self {
        Self {
            path: path.display().to_string(),
            mtime_ns,
            size,
        }
    }

    /// Build a key by statting the file
    pub fn from_fs(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Ok(Self::new(path, mtime_ns, meta.len()))
    }

    /// Byte form used as the LMDB key and the checkpoint identity
    pub fn encode(&self) -> Vec<u8> {
        format!("{}|{}|{}", self.path, self.mtime_ns, self.size).into_bytes()
    }

    pub fn encode_string(&self) -> String {
        format!("{}|{}|{}", self.path, self.mtime_ns, self.size)
    }
}

/// A cached document result: the fixed-layout parse record plus the serialized
/// stage-results frame
#[derive(Debug, Clone)]
pub struct CachedDocument {
    pub parse: ParseResult,
    pub stage_record: Vec<u8>,
}

impl CachedDocument {
    const PARSE_LEN: usize = std::mem::size_of::<ParseResult>();

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::PARSE_LEN + self.stage_record.len());
        out.extend_from_slice(self.parse.as_bytes());
        out.extend_from_slice(&self.stage_record);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::PARSE_LEN {
            return None;
        }
        let parse = ParseResult::from_bytes(&bytes[..Self::PARSE_LEN])?;
        Some(Self {
            parse,
            stage_record: bytes[Self::PARSE_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{ContentKind, ParseStatus};

    #[test]
    fn cache_key_encoding_is_stable() {
        let key = CacheKey::new(Path::new("/data/a.pdf"), 1_700_000_000_000_000_000, 4096);
        assert_eq!(key.encode_string(), "/data/a.pdf|1700000000000000000|4096");
        assert_eq!(key.encode(), key.encode_string().into_bytes());
    }

    #[test]
    fn cached_document_round_trip() {
        let mut parse = ParseResult::new(ParseStatus::Ok, ContentKind::Pdf);
        parse.word_count = 42;
        let doc = CachedDocument {
            parse,
            stage_record: vec![1, 2, 3, 4],
        };
        let back = CachedDocument::from_bytes(&doc.to_bytes()).unwrap();
        assert_eq!(back.parse.word_count, 42);
        assert_eq!(back.stage_record, vec![1, 2, 3, 4]);
        assert!(CachedDocument::from_bytes(&[0u8; 16]).is_none());
    }
}
