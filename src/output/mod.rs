//! Output formatting and sharded persistence
//!
//! Two artifacts leave the engine per document: the extraction file (scheme,
//! json, or csv — all streaming-writable) and the framed stage-results record
//! beside it. Additionally each node appends one summary record per
//! successfully parsed document into per-content-kind shards with bounded
//! buffers and size-based rotation.

pub mod emit;
pub mod shard;

pub use shard::ShardedWriter;
