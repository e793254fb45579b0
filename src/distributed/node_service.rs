//! Node service
//!
//! Runs on every participating node: accepts one driver connection, receives
//! configuration (and, in broadcast mode, its manifest assignment), runs the
//! node engine on a blocking thread, and streams heartbeats until the final
//! report is sent back.

use crate::config::ManifestMode;
use crate::distributed::protocol::{read_message, write_message, Message, PROTOCOL_VERSION};
use crate::manifest::{Manifest, ManifestEntry};
use crate::parser::OptionalBackends;
use crate::progress::ProgressCounters;
use crate::worker::{self, default_adapter_factory};
use crate::Result;
use anyhow::Context;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

pub struct NodeService {
    listen_port: u16,
    shutdown: Arc<AtomicBool>,
}

impl NodeService {
    pub fn new(listen_port: u16, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            listen_port,
            shutdown,
        }
    }

    /// Serve exactly one driver session, then return
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.listen_port))
            .await
            .with_context(|| format!("Failed to bind node service port {}", self.listen_port))?;
        info!(port = self.listen_port, "node service listening");

        let (stream, peer) = listener
            .accept()
            .await
            .context("Failed to accept driver connection")?;
        info!(%peer, "driver connected");
        self.serve(stream).await
    }

    async fn serve(&self, mut stream: TcpStream) -> Result<()> {
        // CONFIG
        let config = match read_message(&mut stream).await? {
            Message::Config { version, config } => {
                if version != PROTOCOL_VERSION {
                    anyhow::bail!(
                        "protocol version mismatch: driver {} node {}",
                        version,
                        PROTOCOL_VERSION
                    );
                }
                Arc::new(*config)
            }
            other => anyhow::bail!("expected CONFIG, got {:?}", other),
        };

        // Assignment: broadcast entries from the driver, or read the shared
        // manifest and take this locale's partition.
        let entries: Vec<ManifestEntry> = match config.manifest.mode {
            ManifestMode::Broadcast => {
                let mut entries = Vec::new();
                loop {
                    match read_message(&mut stream).await? {
                        Message::ManifestChunk { entries: chunk } => entries.extend(chunk),
                        Message::ManifestDone => break,
                        other => anyhow::bail!("expected manifest, got {:?}", other),
                    }
                }
                entries
            }
            ManifestMode::Shared => {
                let manifest = Manifest::load(&config.manifest.path)?;
                manifest.partition(config.cluster.locale_id, config.cluster.num_locales)
            }
        };
        info!(documents = entries.len(), locale = config.cluster.locale_id, "assignment received");

        let node_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        write_message(&mut stream, &Message::Ready { node_name }).await?;

        match read_message(&mut stream).await? {
            Message::Start => {}
            other => anyhow::bail!("expected START, got {:?}", other),
        }

        // Engine on a blocking thread; heartbeats from this task
        let counters = Arc::new(ProgressCounters::new());
        let heartbeat_counters = Arc::clone(&counters);
        let shutdown = Arc::clone(&self.shutdown);
        let optional = Arc::new(OptionalBackends::probe(
            config.pipeline.model_dir.as_deref(),
        ));
        let factory = default_adapter_factory(Arc::clone(&optional));
        let engine_config = Arc::clone(&config);
        let mut engine = tokio::task::spawn_blocking(move || {
            worker::run_node(engine_config, entries, factory, optional, counters, shutdown)
        });

        let mut ticker =
            tokio::time::interval(Duration::from_secs(config.output.progress_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let report = loop {
            tokio::select! {
                result = &mut engine => {
                    break result.context("engine thread panicked")??;
                }
                _ = ticker.tick() => {
                    let snapshot = heartbeat_counters.snapshot();
                    write_message(&mut stream, &Message::Heartbeat { snapshot }).await?;
                    match read_message(&mut stream).await? {
                        Message::HeartbeatAck => {}
                        other => warn!("expected HEARTBEAT_ACK, got {:?}", other),
                    }
                }
            }
        };

        write_message(
            &mut stream,
            &Message::Results {
                report: Box::new(report),
            },
        )
        .await?;
        info!("results sent; node session complete");
        Ok(())
    }
}
