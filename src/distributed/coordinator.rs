//! Distributed coordinator (driver)
//!
//! Connects to every node service, distributes configuration and — in
//! broadcast mode — each node's manifest assignment, starts the run, relays
//! heartbeat acks, and gathers the final node reports into the run report.

use crate::config::{Config, ManifestMode};
use crate::distributed::protocol::{
    read_message, write_message, Message, MANIFEST_CHUNK_LEN, PROTOCOL_VERSION,
};
use crate::manifest::Manifest;
use crate::progress::{heartbeat, NodeReport, RunReport};
use crate::Result;
use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tracing::info;

pub struct Coordinator {
    config: Arc<Config>,
    node_addresses: Vec<String>,
}

impl Coordinator {
    pub fn new(config: Arc<Config>, node_addresses: Vec<String>) -> Result<Self> {
        if node_addresses.is_empty() {
            anyhow::bail!("driver mode requires at least one node address");
        }
        Ok(Self {
            config,
            node_addresses,
        })
    }

    /// Run the distributed session to completion and return the aggregated
    /// run report (already written to the output directory).
    pub async fn run(&self) -> Result<RunReport> {
        let started_wall = Utc::now();
        let started = Instant::now();
        let num_locales = self.node_addresses.len();

        // Broadcast mode reads the manifest once, here on the driver
        let manifest = match self.config.manifest.mode {
            ManifestMode::Broadcast => Some(Manifest::load(&self.config.manifest.path)?),
            ManifestMode::Shared => None,
        };

        // Configure every node, then start them together
        let mut streams = Vec::with_capacity(num_locales);
        for (locale_id, address) in self.node_addresses.iter().enumerate() {
            let mut stream = TcpStream::connect(address)
                .await
                .with_context(|| format!("Failed to connect to node {}", address))?;

            let mut node_config = (*self.config).clone();
            node_config.cluster.locale_id = locale_id;
            node_config.cluster.num_locales = num_locales;
            write_message(
                &mut stream,
                &Message::Config {
                    version: PROTOCOL_VERSION,
                    config: Box::new(node_config),
                },
            )
            .await?;

            if let Some(ref manifest) = manifest {
                let assignment = manifest.partition(locale_id, num_locales);
                for chunk in assignment.chunks(MANIFEST_CHUNK_LEN) {
                    write_message(
                        &mut stream,
                        &Message::ManifestChunk {
                            entries: chunk.to_vec(),
                        },
                    )
                    .await?;
                }
                write_message(&mut stream, &Message::ManifestDone).await?;
            }

            match read_message(&mut stream).await? {
                Message::Ready { node_name } => {
                    info!(locale_id, node = %node_name, %address, "node ready");
                }
                other => anyhow::bail!("node {} sent {:?} instead of READY", address, other),
            }
            streams.push(stream);
        }

        for stream in streams.iter_mut() {
            write_message(stream, &Message::Start).await?;
        }
        info!(nodes = num_locales, "run started");

        // One task per node: ack heartbeats, forward the final report
        let (report_tx, mut report_rx) = tokio::sync::mpsc::channel::<(usize, NodeReport)>(num_locales);
        for (locale_id, mut stream) in streams.into_iter().enumerate() {
            let report_tx = report_tx.clone();
            tokio::spawn(async move {
                loop {
                    match read_message(&mut stream).await {
                        Ok(Message::Heartbeat { snapshot }) => {
                            heartbeat(&snapshot, started.elapsed());
                            if write_message(&mut stream, &Message::HeartbeatAck).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Results { report }) => {
                            let _ = report_tx.send((locale_id, *report)).await;
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::error!(locale_id, error = %e, "node connection lost");
                            break;
                        }
                    }
                }
            });
        }
        drop(report_tx);

        let mut reports: Vec<NodeReport> = Vec::with_capacity(num_locales);
        while let Some((locale_id, report)) = report_rx.recv().await {
            info!(
                locale_id,
                parsed = report.counters.parsed,
                cached = report.counters.cached,
                failed = report.counters.failed,
                "node finished"
            );
            reports.push(report);
        }
        if reports.is_empty() {
            anyhow::bail!("no node reported results");
        }
        if reports.len() != num_locales {
            // A lost node degrades the report, it does not abort the run
            tracing::warn!(
                reported = reports.len(),
                expected = num_locales,
                "assembling run report from a partial node set"
            );
        }
        reports.sort_by_key(|r| r.locale_id);

        let report = RunReport::assemble(started_wall, Utc::now(), reports);
        let path = report.write(&self.config.output.output_dir)?;
        info!(path = %path.display(), elapsed_sec = started.elapsed().as_secs_f64(), "run report written");
        Ok(report)
    }
}
