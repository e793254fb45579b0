//! docex - Distributed multi-format document extraction engine
//!
//! docex processes heterogeneous document corpora at archival scale. Each input
//! document is classified by magic bytes, parsed through a native-parser adapter,
//! optionally run through a battery of analytical stages, and emitted as two
//! artifacts: an extracted-content file and a framed binary stage-results record.
//!
//! # Architecture
//!
//! - **Conduit**: magic-byte detection, validation, content-hash precomputation
//! - **Two-level cache**: embedded LMDB per node, optional content-addressed remote
//! - **Stage pipeline**: bitmask-selected analytical stages with a fixed result schema
//! - **Work dispatcher**: deterministic node partition, bounded chunk queue, worker pool
//! - **Distributed mode**: coordinate multiple nodes for aggregate throughput

pub mod abi;
pub mod cache;
pub mod checkpoint;
pub mod conduit;
pub mod config;
pub mod dispatch;
pub mod distributed;
pub mod fault;
pub mod manifest;
pub mod output;
pub mod parser;
pub mod prefetch;
pub mod progress;
pub mod stages;
pub mod util;
pub mod worker;

// Re-export commonly used types
pub use abi::{ContentKind, ParseResult, ParseStatus, StageMask};
pub use config::Config;

/// Result type used throughout docex
pub type Result<T> = anyhow::Result<T>;
