// src/sinks.rs
//
// Telemetry sink adapters: dashboard POST and a local JSONL analytics file.

use crate::pipeline::telemetry::TelemetrySink;
use crate::types::{SinkConfig, TelemetrySnapshot};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

pub async fn build_sinks(configs: &[SinkConfig]) -> Result<Vec<Arc<dyn TelemetrySink>>> {
    let mut sinks: Vec<Arc<dyn TelemetrySink>> = Vec::with_capacity(configs.len());
    for config in configs {
        match config {
            SinkConfig::Http { url, timeout_ms } => {
                sinks.push(Arc::new(HttpSink::new(url, *timeout_ms)?));
            }
            SinkConfig::Jsonl { path } => {
                sinks.push(Arc::new(JsonlSink::open(path).await?));
            }
        }
    }
    Ok(sinks)
}

// ============================================================================
// DASHBOARD (HTTP)
// ============================================================================

pub struct HttpSink {
    name: String,
    url: String,
    http_client: reqwest::Client,
}

impl HttpSink {
    pub fn new(url: &str, timeout_ms: u64) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("Failed to build HTTP client")?;

        info!("🌐 Dashboard sink: {} (timeout {}ms)", url, timeout_ms);
        Ok(Self {
            name: format!("http:{}", url),
            url: url.to_string(),
            http_client,
        })
    }
}

#[async_trait]
impl TelemetrySink for HttpSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, snapshot: &TelemetrySnapshot) -> Result<()> {
        let response = self
            .http_client
            .post(&self.url)
            .json(snapshot)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?;

        if !response.status().is_success() {
            anyhow::bail!("Dashboard returned {}", response.status());
        }
        Ok(())
    }
}

// ============================================================================
// ANALYTICS FILE (JSONL)
// ============================================================================

pub struct JsonlSink {
    name: String,
    file: Mutex<File>,
}

impl JsonlSink {
    pub async fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open {}", path))?;

        info!("💾 Telemetry will be appended to: {}", path);
        Ok(Self {
            name: format!("jsonl:{}", path),
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl TelemetrySink for JsonlSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, snapshot: &TelemetrySnapshot) -> Result<()> {
        let mut line = serde_json::to_vec(snapshot)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
