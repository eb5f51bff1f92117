// src/pipeline/control_loop.rs
//
// The tick driver. One tick = one read per camera, occupancy, cadence check,
// one simulation step, one telemetry snapshot. Everything happens in program
// order on the loop task; only telemetry delivery runs elsewhere.

use crate::config::decision_interval_ticks;
use crate::errors::{Degradation, ErrorClass, FatalError};
use crate::inference::Policy;
use crate::pipeline::cadence::CadenceController;
use crate::pipeline::metrics::{LoopMetrics, MetricsSummary};
use crate::pipeline::stepper::{SimulationStepper, StepOutcome};
use crate::pipeline::telemetry::{SinkSummary, TelemetryBroadcaster};
use crate::simulation::SimulationEngine;
use crate::stream_resilience::{StreamManager, StreamState};
use crate::types::{Action, ControlConfig, Decision, Occupancy, TelemetrySnapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Relative frame-rate difference above which a camera is reported as drifting
const DRIFT_WARN_RATIO: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: u64,
    pub occupancy: Occupancy,
    pub decision: Decision,
    pub decided: bool,
    pub boundary: bool,
    pub step: StepOutcome,
    pub degradations: Vec<Degradation>,
    pub fresh_cameras: usize,
    pub telemetry_dropped: usize,
}

impl TickReport {
    /// Worst non-fatal class seen this tick; `None` for a clean tick.
    pub fn worst_class(&self, cameras: usize) -> Option<ErrorClass> {
        if !self.degradations.is_empty() {
            Some(ErrorClass::Degraded)
        } else if matches!(self.step, StepOutcome::Failed { .. }) || self.fresh_cameras < cameras {
            Some(ErrorClass::Transient)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraSummary {
    pub name: String,
    pub zones: usize,
    pub frame_rate: f64,
    pub total_failures: u64,
    pub loop_restarts: u64,
    pub cardinality_mismatches: u64,
    pub outages: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Shutdown,
    TickLimit,
    Fatal,
}

#[derive(Debug, Serialize)]
pub struct LoopReport {
    pub stopped_by: StopReason,
    pub error: Option<String>,
    pub interval_ticks: u64,
    pub reference_frame_rate: f64,
    pub final_decision: Action,
    pub metrics: MetricsSummary,
    pub degradations: BTreeMap<&'static str, u64>,
    /// Times the policy stopped answering
    pub policy_outages: u64,
    /// Times the state vector stopped matching the policy input
    pub state_mismatch_episodes: u64,
    /// Times every camera failed at once
    pub camera_blackouts: u64,
    pub cameras: Vec<CameraSummary>,
    pub sinks: Vec<SinkSummary>,
}

pub struct ControlLoop {
    streams: StreamManager,
    cadence: CadenceController,
    stepper: SimulationStepper,
    broadcaster: TelemetryBroadcaster,
    metrics: LoopMetrics,
    tick: u64,
    reference_fps: f64,
    max_ticks: Option<u64>,
    status_every: u64,
    realtime: bool,
    drain_grace: Duration,
    degradation_counts: BTreeMap<&'static str, u64>,
}

impl ControlLoop {
    /// Resets the engine and checks that occupancy + phase matches the
    /// policy's input before any tick runs.
    pub async fn new(
        streams: StreamManager,
        policy: Box<dyn Policy>,
        engine: Box<dyn SimulationEngine>,
        broadcaster: TelemetryBroadcaster,
        control: &ControlConfig,
        drain_grace: Duration,
    ) -> Result<Self, FatalError> {
        let reference_fps = reference_frame_rate(&streams, control)?;
        warn_on_drift(&streams, reference_fps);

        let interval_ticks =
            decision_interval_ticks(control.decision_interval_seconds, reference_fps);

        let occupancy_len = streams.total_zones();
        let mut stepper = SimulationStepper::start(
            engine,
            occupancy_len,
            control.simulation_retry_limit,
            Duration::from_millis(control.simulation_backoff_ms),
            Duration::from_millis(control.simulation_timeout_ms),
        )
        .await?;

        let expected = policy.input_dim();
        if occupancy_len + stepper.phase_len() != expected {
            stepper.close().await;
            return Err(FatalError::DimensionMismatchAtStartup {
                occupancy: occupancy_len,
                phase: stepper.phase_len(),
                expected,
            });
        }

        info!(
            "✓ Policy '{}' ready (state = {} zones + {} phase)",
            policy.name(),
            occupancy_len,
            stepper.phase_len()
        );
        info!(
            "⏱️  Decision every {} ticks ({:.1}s @ {:.2} FPS)",
            interval_ticks, control.decision_interval_seconds, reference_fps
        );

        let cadence = CadenceController::new(
            policy,
            interval_ticks,
            Duration::from_millis(control.policy_timeout_ms),
        );

        Ok(Self {
            streams,
            cadence,
            stepper,
            broadcaster,
            metrics: LoopMetrics::new(),
            tick: 0,
            reference_fps,
            max_ticks: control.max_ticks,
            status_every: control.status_every_ticks,
            realtime: control.realtime,
            drain_grace,
            degradation_counts: BTreeMap::new(),
        })
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn interval_ticks(&self) -> u64 {
        self.cadence.interval_ticks()
    }

    pub async fn tick_once(&mut self) -> Result<TickReport, FatalError> {
        self.tick += 1;
        let tick = self.tick;

        let acquired = self.streams.acquire(tick)?;

        let policy_started = Instant::now();
        let cadence = self
            .cadence
            .on_tick(tick, &acquired.occupancy, self.stepper.phase())
            .await;
        if cadence.boundary {
            self.metrics.set(
                &self.metrics.policy_time_us,
                policy_started.elapsed().as_micros() as u64,
            );
        }

        let step = match self.stepper.step(cadence.decision.action).await {
            Ok(step) => step,
            Err(fatal) => {
                self.metrics.inc(&self.metrics.simulation_failures);
                return Err(fatal);
            }
        };

        let snapshot = TelemetrySnapshot::capture(&acquired.occupancy, &cadence.decision, tick);
        let telemetry_dropped = self.broadcaster.publish(snapshot);

        let mut degradations = acquired.degradations;
        degradations.extend(cadence.degradations);

        let report = TickReport {
            tick,
            occupancy: acquired.occupancy,
            decision: cadence.decision,
            decided: cadence.decided,
            boundary: cadence.boundary,
            step,
            degradations,
            fresh_cameras: acquired.fresh_cameras,
            telemetry_dropped,
        };
        self.record(&report, acquired.detections);
        Ok(report)
    }

    fn record(&mut self, report: &TickReport, detections: usize) {
        let m = &self.metrics;
        m.inc(&m.ticks);
        m.add(&m.detections, detections as u64);
        m.add(&m.telemetry_dropped, report.telemetry_dropped as u64);
        m.set(&m.episodes, self.stepper.episodes());

        if report.decided {
            m.inc(&m.decisions);
            m.add(
                &m.occupancy_at_decisions,
                report.occupancy.iter().map(|&c| c as u64).sum(),
            );
            if report.decision.action == Action::Switch {
                m.inc(&m.switches);
            }
        } else if report.boundary {
            m.inc(&m.decision_failures);
        }

        let cameras = self.streams.cameras().len();
        if report.fresh_cameras < cameras {
            m.add(&m.camera_faults, (cameras - report.fresh_cameras) as u64);
        }
        if let StepOutcome::Failed { .. } = report.step {
            m.inc(&m.simulation_failures);
        }
        match report.worst_class(cameras) {
            Some(ErrorClass::Degraded) => m.inc(&m.degraded_ticks),
            Some(ErrorClass::Transient) => m.inc(&m.transient_ticks),
            Some(ErrorClass::Fatal) | None => {}
        }
        for degradation in &report.degradations {
            *self.degradation_counts.entry(degradation.kind()).or_insert(0) += 1;
        }
    }

    /// Runs until shutdown is signalled, `max_ticks` is reached or a fatal
    /// error occurs. Always closes the engine and drains sinks before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> LoopReport {
        info!("🚦 Control loop running");
        let tick_period = Duration::from_secs_f64(1.0 / self.reference_fps);
        let mut next_tick = tokio::time::Instant::now();

        let (stopped_by, fatal) = loop {
            if *shutdown.borrow_and_update() {
                info!(tick = self.tick, "🛑 Shutdown requested");
                break (StopReason::Shutdown, None);
            }
            if let Some(max) = self.max_ticks {
                if self.tick >= max {
                    info!(tick = self.tick, "🏁 Tick limit reached");
                    break (StopReason::TickLimit, None);
                }
            }

            match self.tick_once().await {
                Ok(report) => {
                    if self.status_every > 0 && report.tick % self.status_every == 0 {
                        self.log_status(&report);
                    }
                }
                Err(fatal) => {
                    error!(tick = self.tick, class = ?fatal.class(), "🚨 Fatal: {}", fatal);
                    break (StopReason::Fatal, Some(fatal));
                }
            }

            if self.realtime {
                next_tick += tick_period;
                tokio::time::sleep_until(next_tick).await;
            } else {
                // Lets delivery tasks make progress on a current-thread runtime
                tokio::task::yield_now().await;
            }
        };

        self.close(stopped_by, fatal.map(|e| e.to_string())).await
    }

    fn log_status(&self, report: &TickReport) {
        let summary = self.metrics.summary();
        info!(
            "📊 Tick {} | decision {} (since tick {}) | occupancy {:?} | decisions {} | {:.1} ticks/s | {:.0}s",
            report.tick,
            report.decision.action.as_str(),
            report.decision.computed_at,
            report.occupancy,
            summary.decisions,
            summary.ticks_per_second,
            summary.elapsed_secs
        );
    }

    pub async fn close(mut self, stopped_by: StopReason, error: Option<String>) -> LoopReport {
        self.stepper.close().await;
        let sinks = self.broadcaster.shutdown(self.drain_grace).await;

        let cameras = self
            .streams
            .cameras()
            .iter()
            .map(|c| {
                let StreamState {
                    total_failures,
                    loop_restarts,
                    cardinality_mismatches,
                    outages,
                    ..
                } = c.state().clone();
                CameraSummary {
                    name: c.name().to_string(),
                    zones: c.zone_count(),
                    frame_rate: c.frame_rate(),
                    total_failures,
                    loop_restarts,
                    cardinality_mismatches,
                    outages,
                }
            })
            .collect();

        let report = LoopReport {
            stopped_by,
            error,
            interval_ticks: self.cadence.interval_ticks(),
            reference_frame_rate: self.reference_fps,
            final_decision: self.cadence.current().action,
            metrics: self.metrics.summary(),
            degradations: self.degradation_counts,
            policy_outages: self.cadence.policy_outages(),
            state_mismatch_episodes: self.cadence.state_mismatch_episodes(),
            camera_blackouts: self.streams.blackouts(),
            cameras,
            sinks,
        };
        log_final_report(&report);
        report
    }
}

fn reference_frame_rate(streams: &StreamManager, control: &ControlConfig) -> Result<f64, FatalError> {
    let fps = match control.reference_frame_rate {
        Some(fps) => fps,
        None => streams
            .cameras()
            .get(control.reference_camera)
            .map(|c| c.frame_rate())
            .ok_or_else(|| {
                FatalError::Config(format!(
                    "reference camera {} does not exist ({} cameras)",
                    control.reference_camera,
                    streams.cameras().len()
                ))
            })?,
    };
    if !fps.is_finite() || fps <= 0.0 {
        return Err(FatalError::Config(format!(
            "reference frame rate must be positive, got {}",
            fps
        )));
    }
    Ok(fps)
}

fn warn_on_drift(streams: &StreamManager, reference_fps: f64) {
    for camera in streams.cameras() {
        let ratio = (camera.frame_rate() - reference_fps).abs() / reference_fps;
        if ratio > DRIFT_WARN_RATIO {
            warn!(
                camera = %camera.name(),
                "⚠️  Frame rate {:.2} differs from reference {:.2} ({:.1}%), cameras will drift",
                camera.frame_rate(),
                reference_fps,
                ratio * 100.0
            );
        } else {
            debug!(camera = %camera.name(), fps = camera.frame_rate(), "Camera in sync");
        }
    }
}

fn log_final_report(report: &LoopReport) {
    let m = &report.metrics;
    info!("\n📊 Final Report:");
    info!("  Stopped by: {:?}", report.stopped_by);
    if let Some(error) = &report.error {
        error!("  🚨 Error: {}", error);
    }
    info!("  Ticks: {} ({:.1} ticks/s)", m.ticks, m.ticks_per_second);
    info!(
        "  🤖 Decisions: {} ({} switches, {} failed)",
        m.decisions, m.switches, m.decision_failures
    );
    info!(
        "  🚙 Average occupancy at decisions: {:.2}",
        m.avg_occupancy_at_decisions
    );
    info!("  🔁 Episodes: {}", m.episodes);
    if m.degraded_ticks > 0 {
        warn!("  ⚠️  Degraded ticks: {}", m.degraded_ticks);
        for (kind, count) in &report.degradations {
            warn!("     {}: {}", kind, count);
        }
        warn!(
            "     policy outages {}, state mismatch episodes {}, camera blackouts {}",
            report.policy_outages, report.state_mismatch_episodes, report.camera_blackouts
        );
    }
    if m.transient_ticks > 0 {
        info!("  Transient ticks: {}", m.transient_ticks);
    }
    for camera in &report.cameras {
        info!(
            "  📹 {}: {} failed reads in {} outage(s), {} loops",
            camera.name, camera.total_failures, camera.outages, camera.loop_restarts
        );
    }
    for sink in &report.sinks {
        info!(
            "  📡 {}: {} delivered, {} dropped, {} failed, {} disconnect(s)",
            sink.name, sink.delivered, sink.dropped, sink.failed, sink.disconnects
        );
    }
    info!("  Runtime: {:.1}s", m.elapsed_secs);
}
