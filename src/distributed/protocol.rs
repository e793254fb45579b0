//! Distributed mode protocol
//!
//! Messages between the driver and the node services use MessagePack
//! (rmp-serde) for efficient binary serialization with full serde support.
//!
//! # Message Flow
//!
//! ```text
//! Driver                         Node Service
//!   |-------- CONFIG ------------->|
//!   |---- MANIFEST_CHUNK* -------->|   (broadcast mode only)
//!   |------ MANIFEST_DONE -------->|
//!   |<------- READY ---------------|
//!   |-------- START -------------->|
//!   |<----- HEARTBEAT(snapshot) ---|
//!   |------ HEARTBEAT_ACK -------->|
//!   |<----- RESULTS(report) -------|
//! ```
//!
//! # Framing
//!
//! Each message is prefixed with a 4-byte little-endian length:
//!
//! ```text
//! [4 bytes: message length][N bytes: rmp-serde payload]
//! ```

use crate::config::Config;
use crate::manifest::ManifestEntry;
use crate::progress::{CounterSnapshot, NodeReport};
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Protocol version. Driver and nodes must match exactly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Manifest entries per MANIFEST_CHUNK message
pub const MANIFEST_CHUNK_LEN: usize = 10_000;

/// Refuse frames above this size (a corrupt length prefix otherwise
/// allocates unbounded memory)
const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Driver -> node: full configuration with this node's identity
    Config {
        version: u32,
        config: Box<Config>,
    },
    /// Driver -> node: a slice of the node's manifest assignment
    ManifestChunk { entries: Vec<ManifestEntry> },
    /// Driver -> node: assignment complete
    ManifestDone,
    /// Node -> driver: configured and ready to start
    Ready { node_name: String },
    /// Driver -> node: begin processing
    Start,
    /// Node -> driver: periodic progress snapshot
    Heartbeat { snapshot: CounterSnapshot },
    /// Driver -> node: heartbeat acknowledged
    HeartbeatAck,
    /// Node -> driver: final report; closes the session
    Results { report: Box<NodeReport> },
}

/// Write one length-framed message
pub async fn write_message<W: AsyncWriteExt + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let payload = rmp_serde::to_vec(msg).context("Failed to serialize protocol message")?;
    writer
        .write_all(&(payload.len() as u32).to_le_bytes())
        .await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-framed message
pub async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Message> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .context("Connection closed while reading frame length")?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame length {} exceeds maximum {}", len, MAX_FRAME_LEN);
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .context("Connection closed while reading frame payload")?;
    rmp_serde::from_slice(&payload).context("Failed to deserialize protocol message")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressCounters;

    #[tokio::test]
    async fn round_trip_over_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024 * 1024);

        let counters = ProgressCounters::new();
        counters.seen.add(5);
        let sent = Message::Heartbeat {
            snapshot: counters.snapshot(),
        };
        write_message(&mut a, &sent).await.unwrap();
        write_message(&mut a, &Message::HeartbeatAck).await.unwrap();

        match read_message(&mut b).await.unwrap() {
            Message::Heartbeat { snapshot } => assert_eq!(snapshot.seen, 5),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(matches!(
            read_message(&mut b).await.unwrap(),
            Message::HeartbeatAck
        ));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        assert!(read_message(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn manifest_chunk_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024 * 1024);
        let entries: Vec<ManifestEntry> = (0..100)
            .map(|i| ManifestEntry::plain(std::path::PathBuf::from(format!("/d/{}.pdf", i))))
            .collect();
        write_message(&mut a, &Message::ManifestChunk { entries: entries.clone() })
            .await
            .unwrap();
        write_message(&mut a, &Message::ManifestDone).await.unwrap();

        match read_message(&mut b).await.unwrap() {
            Message::ManifestChunk { entries: got } => assert_eq!(got, entries),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(matches!(
            read_message(&mut b).await.unwrap(),
            Message::ManifestDone
        ));
    }
}
