//! Distributed mode
//!
//! One driver node orchestrates N node services over a simple length-framed
//! MessagePack protocol: configuration and (in broadcast mode) manifest
//! distribution flow down, heartbeats and final node reports flow back up.
//! Nodes never talk to each other; cross-node coordination beyond the L2
//! cache is deliberately absent.

pub mod coordinator;
pub mod node_service;
pub mod protocol;

pub use coordinator::Coordinator;
pub use node_service::NodeService;
