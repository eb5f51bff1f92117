// src/main.rs

mod config;
mod errors;
mod inference;
mod pipeline;
mod simulation;
mod sinks;
mod state_vector;
mod stream_resilience;
mod types;
mod vehicle_detection;
mod video_processor;
mod zones;

use anyhow::{Context, Result};
use pipeline::{ControlLoop, LoopReport, StopReason, TelemetryBroadcaster};
use std::path::Path;
use std::time::Duration;
use stream_resilience::{CameraStream, StreamManager};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use types::Config;

const CONFIG_PATH_ENV: &str = "SIGNAL_TWIN_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
        .unwrap_or_else(|| "config.yaml".to_string());

    let config = Config::load(&config_path)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("signal_twin={},ort=warn", config.logging.level))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚦 Signal Twin Starting");
    info!("✓ Configuration loaded from {}", config_path);

    let streams = open_cameras(&config)?;
    info!(
        "✓ {} camera(s), {} zone(s) total",
        streams.cameras().len(),
        streams.total_zones()
    );

    let policy = inference::build_policy(&config.policy)?;
    let engine = simulation::build_engine(&config.simulation, config.total_zones())?;

    let sinks = sinks::build_sinks(&config.telemetry.sinks).await?;
    let broadcaster = TelemetryBroadcaster::new(sinks, config.telemetry.sink_queue_capacity);
    match broadcaster.sink_count() {
        0 => warn!("⚪ No telemetry sinks configured"),
        n => info!("✓ Telemetry to {} sink(s)", n),
    }

    let control_loop = match ControlLoop::new(
        streams,
        policy,
        engine,
        broadcaster,
        &config.control,
        Duration::from_millis(config.telemetry.drain_grace_ms),
    )
    .await
    {
        Ok(control_loop) => control_loop,
        Err(fatal) => {
            error!("🚨 Startup failed: {}", fatal);
            return Err(fatal.into());
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Ctrl-C received, stopping after this tick");
            let _ = shutdown_tx.send(true);
        }
    });

    let report = control_loop.run(shutdown_rx).await;

    if let Some(path) = &config.analytics.summary_path {
        match save_report(&report, path) {
            Ok(()) => info!("💾 Run summary saved to: {}", path),
            Err(e) => warn!("Failed to save run summary: {:#}", e),
        }
    }

    if report.stopped_by == StopReason::Fatal {
        anyhow::bail!(
            "control loop stopped: {}",
            report.error.as_deref().unwrap_or("fatal error")
        );
    }
    Ok(())
}

fn open_cameras(config: &Config) -> Result<StreamManager> {
    let mut cameras = Vec::with_capacity(config.cameras.len());
    for (index, camera) in config.cameras.iter().enumerate() {
        let zones = zones::zones_for_camera(camera);
        let source = video_processor::open_source(&camera.name, &camera.source)
            .with_context(|| format!("Camera '{}'", camera.name))?;
        let processor = vehicle_detection::build_processor(&config.detector, index, &zones)
            .with_context(|| format!("Detector for camera '{}'", camera.name))?;
        info!(
            "📹 Camera '{}': {} zone(s) @ {:.2} FPS",
            source.name(),
            zones.len(),
            source.frame_rate()
        );
        cameras.push(CameraStream::new(&camera.name, source, processor, zones));
    }
    Ok(StreamManager::new(
        cameras,
        config.control.stream_failure_limit,
    ))
}

fn save_report(report: &LoopReport, path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path))?;
    Ok(())
}
