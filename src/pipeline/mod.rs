// src/pipeline/mod.rs

pub mod cadence;
pub mod control_loop;
pub mod metrics;
pub mod stepper;
pub mod telemetry;

pub use control_loop::{ControlLoop, LoopReport, StopReason};
pub use telemetry::TelemetryBroadcaster;
