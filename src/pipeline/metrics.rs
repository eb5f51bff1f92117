// src/pipeline/metrics.rs
//
// Loop analytics. Counters are shared atomics so the status line and the
// final report can read them without touching loop state.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct LoopMetrics {
    pub ticks: Arc<AtomicU64>,
    pub decisions: Arc<AtomicU64>,
    pub switches: Arc<AtomicU64>,
    pub decision_failures: Arc<AtomicU64>,
    /// Ticks where a substitute value stood in for real data
    pub degraded_ticks: Arc<AtomicU64>,
    /// Ticks with only held camera reads or a retried simulation step
    pub transient_ticks: Arc<AtomicU64>,
    pub camera_faults: Arc<AtomicU64>,
    pub simulation_failures: Arc<AtomicU64>,
    pub episodes: Arc<AtomicU64>,
    pub telemetry_dropped: Arc<AtomicU64>,
    pub detections: Arc<AtomicU64>,
    /// Sum of total occupancy sampled at each decision
    pub occupancy_at_decisions: Arc<AtomicU64>,
    pub policy_time_us: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl Default for LoopMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopMetrics {
    pub fn new() -> Self {
        Self {
            ticks: Arc::new(AtomicU64::new(0)),
            decisions: Arc::new(AtomicU64::new(0)),
            switches: Arc::new(AtomicU64::new(0)),
            decision_failures: Arc::new(AtomicU64::new(0)),
            degraded_ticks: Arc::new(AtomicU64::new(0)),
            transient_ticks: Arc::new(AtomicU64::new(0)),
            camera_faults: Arc::new(AtomicU64::new(0)),
            simulation_failures: Arc::new(AtomicU64::new(0)),
            episodes: Arc::new(AtomicU64::new(0)),
            telemetry_dropped: Arc::new(AtomicU64::new(0)),
            detections: Arc::new(AtomicU64::new(0)),
            occupancy_at_decisions: Arc::new(AtomicU64::new(0)),
            policy_time_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn set(&self, counter: &AtomicU64, value: u64) {
        counter.store(value, Ordering::Relaxed);
    }

    pub fn ticks_per_second(&self) -> f64 {
        let ticks = self.ticks.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            ticks as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn average_occupancy_at_decisions(&self) -> f64 {
        let decisions = self.decisions.load(Ordering::Relaxed);
        if decisions == 0 {
            return 0.0;
        }
        self.occupancy_at_decisions.load(Ordering::Relaxed) as f64 / decisions as f64
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            ticks: self.ticks.load(Ordering::Relaxed),
            ticks_per_second: self.ticks_per_second(),
            decisions: self.decisions.load(Ordering::Relaxed),
            switches: self.switches.load(Ordering::Relaxed),
            decision_failures: self.decision_failures.load(Ordering::Relaxed),
            degraded_ticks: self.degraded_ticks.load(Ordering::Relaxed),
            transient_ticks: self.transient_ticks.load(Ordering::Relaxed),
            camera_faults: self.camera_faults.load(Ordering::Relaxed),
            simulation_failures: self.simulation_failures.load(Ordering::Relaxed),
            episodes: self.episodes.load(Ordering::Relaxed),
            telemetry_dropped: self.telemetry_dropped.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            avg_occupancy_at_decisions: self.average_occupancy_at_decisions(),
            last_policy_us: self.policy_time_us.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub ticks: u64,
    pub ticks_per_second: f64,
    pub decisions: u64,
    pub switches: u64,
    pub decision_failures: u64,
    pub degraded_ticks: u64,
    pub transient_ticks: u64,
    pub camera_faults: u64,
    pub simulation_failures: u64,
    pub episodes: u64,
    pub telemetry_dropped: u64,
    pub detections: u64,
    pub avg_occupancy_at_decisions: f64,
    pub last_policy_us: u64,
    pub elapsed_secs: f64,
}
