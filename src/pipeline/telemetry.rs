// src/pipeline/telemetry.rs
//
// Fire-and-forget telemetry. Each sink gets its own bounded queue and
// delivery task, so a slow or dead sink never holds up the control loop
// or any other sink. When a queue is full the new snapshot is dropped.

use crate::types::TelemetrySnapshot;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    fn name(&self) -> &str;

    async fn push(&self, snapshot: &TelemetrySnapshot) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct SinkStats {
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub failed: AtomicU64,
    /// Reachable-to-unreachable transitions
    pub disconnects: AtomicU64,
    /// Times the queue started overflowing after draining
    pub overflows: AtomicU64,
    dropping: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SinkSummary {
    pub name: String,
    pub delivered: u64,
    pub dropped: u64,
    pub failed: u64,
    pub disconnects: u64,
    pub overflows: u64,
}

struct SinkChannel {
    name: String,
    tx: mpsc::Sender<Arc<TelemetrySnapshot>>,
    stats: Arc<SinkStats>,
}

pub struct TelemetryBroadcaster {
    channels: Vec<SinkChannel>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl TelemetryBroadcaster {
    /// Must be called inside a tokio runtime; spawns one task per sink.
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut channels = Vec::with_capacity(sinks.len());
        let mut tasks = Vec::with_capacity(sinks.len());

        for sink in sinks {
            let (tx, rx) = mpsc::channel(capacity);
            let stats = Arc::new(SinkStats::default());
            let name = sink.name().to_string();
            let handle = tokio::spawn(deliver(sink, rx, Arc::clone(&stats)));
            info!("📡 Telemetry sink '{}' ready (queue {})", name, capacity);
            channels.push(SinkChannel {
                name: name.clone(),
                tx,
                stats,
            });
            tasks.push((name, handle));
        }

        Self { channels, tasks }
    }

    pub fn sink_count(&self) -> usize {
        self.channels.len()
    }

    /// Never blocks and never fails. Returns how many sinks dropped it.
    pub fn publish(&self, snapshot: TelemetrySnapshot) -> usize {
        let snapshot = Arc::new(snapshot);
        let mut dropped = 0;

        for channel in &self.channels {
            match channel.tx.try_send(Arc::clone(&snapshot)) {
                Ok(()) => {
                    if channel.stats.dropping.swap(false, Ordering::Relaxed) {
                        debug!(sink = %channel.name, "Telemetry queue draining again");
                    }
                }
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                    channel.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    dropped += 1;
                    if !channel.stats.dropping.swap(true, Ordering::Relaxed) {
                        channel.stats.overflows.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            sink = %channel.name,
                            tick = snapshot.tick,
                            "⚠️  Telemetry queue full, dropping snapshots"
                        );
                    }
                }
            }
        }
        dropped
    }

    pub fn stats(&self) -> Vec<SinkSummary> {
        self.channels
            .iter()
            .map(|c| SinkSummary {
                name: c.name.clone(),
                delivered: c.stats.delivered.load(Ordering::Relaxed),
                dropped: c.stats.dropped.load(Ordering::Relaxed),
                failed: c.stats.failed.load(Ordering::Relaxed),
                disconnects: c.stats.disconnects.load(Ordering::Relaxed),
                overflows: c.stats.overflows.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Closes every queue and waits up to `grace` for pending snapshots to
    /// go out. Delivery tasks still running after that are aborted.
    pub async fn shutdown(self, grace: Duration) -> Vec<SinkSummary> {
        let stats = self.stats();
        drop(self.channels);

        let deadline = tokio::time::Instant::now() + grace;
        for (name, mut handle) in self.tasks {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Telemetry sink '{}' did not drain in time, aborting", name);
                handle.abort();
            }
        }

        stats
    }
}

async fn deliver(
    sink: Arc<dyn TelemetrySink>,
    mut rx: mpsc::Receiver<Arc<TelemetrySnapshot>>,
    stats: Arc<SinkStats>,
) {
    let mut connected = true;

    while let Some(snapshot) = rx.recv().await {
        match sink.push(&snapshot).await {
            Ok(()) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
                if !connected {
                    info!("✓ Telemetry sink '{}' reachable again", sink.name());
                    connected = true;
                }
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                if connected {
                    stats.disconnects.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        tick = snapshot.tick,
                        "⚠️  Telemetry sink '{}' unreachable: {:#}",
                        sink.name(),
                        e
                    );
                    connected = false;
                }
            }
        }
    }

    debug!("Telemetry sink '{}' closed", sink.name());
}
