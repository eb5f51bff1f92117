// src/errors.rs
//
// Transient / degraded / fatal taxonomy for the control loop. Adapters
// return anyhow errors; the loop turns them into one of these.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Handled locally, only counters move
    Transient,
    /// A fallback value was substituted
    Degraded,
    /// The loop stops
    Fatal,
}

/// Recoverable substitution made during a tick.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Degradation {
    #[error("state vector length {got} != policy input {expected}, using zero vector")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("policy did not answer within {timeout_ms}ms, holding previous decision")]
    PolicyTimeout { timeout_ms: u64 },

    #[error("policy failed: {0}")]
    PolicyFailed(String),

    #[error("previous policy call still running, holding previous decision")]
    PolicyBusy,

    #[error("camera '{camera}' produced {got} zone counts, expected {expected}")]
    CardinalityMismatch {
        camera: String,
        expected: usize,
        got: usize,
    },

    #[error("all cameras failed, holding last occupancy")]
    AllCamerasFailed,
}

impl Degradation {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Degraded
    }

    /// Short stable label used for counters and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Degradation::DimensionMismatch { .. } => "dimension_mismatch",
            Degradation::PolicyTimeout { .. } => "policy_timeout",
            Degradation::PolicyFailed(_) => "policy_failed",
            Degradation::PolicyBusy => "policy_busy",
            Degradation::CardinalityMismatch { .. } => "cardinality_mismatch",
            Degradation::AllCamerasFailed => "all_cameras_failed",
        }
    }
}

/// Conditions that terminate the loop and are surfaced to the supervisor.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(
        "occupancy ({occupancy}) + phase ({phase}) does not match policy input dimension {expected}"
    )]
    DimensionMismatchAtStartup {
        occupancy: usize,
        phase: usize,
        expected: usize,
    },

    #[error("simulation engine failed {consecutive} consecutive ticks: {last_error}")]
    SimulationFailed { consecutive: u32, last_error: String },

    #[error("simulation reset failed: {0}")]
    ResetFailed(String),

    #[error("camera '{camera}' failed {consecutive} consecutive reads")]
    StreamLost { camera: String, consecutive: u32 },
}

impl FatalError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Fatal
    }
}
