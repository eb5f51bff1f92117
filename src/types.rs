// src/types.rs

use serde::{Deserialize, Serialize};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub control: ControlConfig,
    pub cameras: Vec<CameraConfig>,
    pub detector: DetectorConfig,
    pub policy: PolicyConfig,
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub decision_interval_seconds: f64,
    /// Camera whose frame rate defines the decision cadence
    pub reference_camera: usize,
    /// Overrides the reference camera's reported frame rate
    pub reference_frame_rate: Option<f64>,
    pub policy_timeout_ms: u64,
    pub simulation_retry_limit: u32,
    pub simulation_backoff_ms: u64,
    /// Longest a single engine reset/step may take before the tick counts it failed
    pub simulation_timeout_ms: u64,
    /// Consecutive failed reads on one camera before the loop gives up.
    /// `None` keeps holding the last value forever.
    pub stream_failure_limit: Option<u32>,
    pub max_ticks: Option<u64>,
    pub status_every_ticks: u64,
    /// Sleep between ticks to match the reference frame rate
    pub realtime: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            decision_interval_seconds: 5.0,
            reference_camera: 0,
            reference_frame_rate: None,
            policy_timeout_ms: 250,
            simulation_retry_limit: 5,
            simulation_backoff_ms: 100,
            simulation_timeout_ms: 2000,
            stream_failure_limit: None,
            max_ticks: None,
            status_every_ticks: 50,
            realtime: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub name: String,
    pub source: SourceConfig,
    /// Ordered polygons; earlier zones win when zones overlap
    pub zones: Vec<Vec<[i32; 2]>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Video {
        path: String,
    },
    Synthetic {
        #[serde(default = "default_frame_rate")]
        frame_rate: f64,
        #[serde(default = "default_width")]
        width: usize,
        #[serde(default = "default_height")]
        height: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorConfig {
    Yolo {
        model_path: String,
        #[serde(default = "default_confidence")]
        confidence_threshold: f32,
    },
    Synthetic {
        #[serde(default)]
        seed: u64,
        #[serde(default = "default_max_per_zone")]
        max_per_zone: u32,
        #[serde(default = "default_stray")]
        stray_per_frame: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyConfig {
    Onnx {
        model_path: String,
        input_dim: usize,
    },
    FixedCycle {
        input_dim: usize,
        /// Number of decisions between SWITCH actions
        switch_every: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimulationConfig {
    Bridge {
        command: Vec<String>,
    },
    Surrogate {
        #[serde(default = "default_num_phases")]
        num_phases: usize,
        #[serde(default = "default_min_green")]
        min_green_ticks: u32,
        #[serde(default = "default_episode_ticks")]
        episode_ticks: u64,
        #[serde(default = "default_arrival_rate")]
        arrival_rate: f64,
        #[serde(default)]
        seed: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub sink_queue_capacity: usize,
    pub drain_grace_ms: u64,
    pub sinks: Vec<SinkConfig>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sink_queue_capacity: 64,
            drain_grace_ms: 2000,
            sinks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    Http {
        url: String,
        #[serde(default = "default_http_timeout")]
        timeout_ms: u64,
    },
    Jsonl {
        path: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub summary_path: Option<String>,
}

fn default_frame_rate() -> f64 {
    30.0
}
fn default_width() -> usize {
    832
}
fn default_height() -> usize {
    480
}
fn default_confidence() -> f32 {
    0.3
}
fn default_max_per_zone() -> u32 {
    3
}
fn default_stray() -> u32 {
    1
}
fn default_num_phases() -> usize {
    2
}
fn default_min_green() -> u32 {
    10
}
fn default_episode_ticks() -> u64 {
    3600
}
fn default_arrival_rate() -> f64 {
    0.3
}
fn default_http_timeout() -> u64 {
    500
}

// ============================================================================
// PERCEPTION
// ============================================================================

#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    /// Position within the source, counted from the last rewind
    pub index: u64,
    pub timestamp_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4], // [x1, y1, x2, y2] in frame coordinates
    /// Bottom-center of the box, used for zone membership
    pub anchor: (f32, f32),
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
}

impl Detection {
    pub fn from_bbox(bbox: [f32; 4], class_id: usize, class_name: &str, confidence: f32) -> Self {
        let anchor = ((bbox[0] + bbox[2]) / 2.0, bbox[3]);
        Self {
            bbox,
            anchor,
            class_id,
            class_name: class_name.to_string(),
            confidence,
        }
    }
}

/// Per-zone vehicle counts across all cameras, camera order then zone order.
pub type Occupancy = Vec<u32>;

// ============================================================================
// CONTROL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Keep,
    Switch,
}

impl Action {
    /// Policy output `1` means switch; anything else keeps the phase.
    pub fn from_code(code: i64) -> Self {
        if code == 1 {
            Action::Switch
        } else {
            Action::Keep
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Action::Keep => 0,
            Action::Switch => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Keep => "KEEP",
            Action::Switch => "SWITCH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    /// Tick the policy produced `action`; unchanged when a boundary fails
    pub computed_at: u64,
    /// Next decision boundary, advanced at every boundary whether or not
    /// the policy answered
    pub stale_at: u64,
}

impl Decision {
    pub fn initial(interval_ticks: u64) -> Self {
        Self {
            action: Action::Keep,
            computed_at: 0,
            stale_at: interval_ticks,
        }
    }
}

/// Immutable per-tick copy handed to the telemetry broadcaster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub occupancy: Vec<u32>,
    pub decision: Action,
    pub tick: u64,
    pub timestamp: String,
}

impl TelemetrySnapshot {
    pub fn capture(occupancy: &[u32], decision: &Decision, tick: u64) -> Self {
        Self {
            occupancy: occupancy.to_vec(),
            decision: decision.action,
            tick,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_is_bottom_center() {
        let det = Detection::from_bbox([10.0, 20.0, 30.0, 60.0], 2, "car", 0.9);
        assert_eq!(det.anchor, (20.0, 60.0));
    }

    #[test]
    fn test_action_mapping() {
        assert_eq!(Action::from_code(1), Action::Switch);
        assert_eq!(Action::from_code(0), Action::Keep);
        assert_eq!(Action::from_code(7), Action::Keep);
        assert_eq!(Action::from_code(-1), Action::Keep);
    }

    #[test]
    fn test_snapshot_wire_format() {
        let decision = Decision {
            action: Action::Switch,
            computed_at: 5,
            stale_at: 10,
        };
        let snap = TelemetrySnapshot::capture(&[1, 0, 2], &decision, 7);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["decision"], "SWITCH");
        assert_eq!(json["tick"], 7);
        assert_eq!(json["occupancy"], serde_json::json!([1, 0, 2]));
        assert!(json["timestamp"].is_string());
    }
}
