// src/config.rs

use crate::types::{Config, SinkConfig, SourceConfig};
use anyhow::{bail, Context, Result};
use std::fs;
use tracing::info;

const DASHBOARD_URL_ENV: &str = "SIGNAL_TWIN_DASHBOARD_URL";

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path))?;
        let mut config = Self::from_yaml(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents).context("Invalid config YAML")?;
        Ok(config)
    }

    /// Dashboard URL from the environment replaces the first HTTP sink, or adds one.
    pub fn apply_env_overrides(&mut self) {
        let Ok(url) = std::env::var(DASHBOARD_URL_ENV) else {
            return;
        };
        info!("📡 Dashboard URL from {}: {}", DASHBOARD_URL_ENV, url);

        let existing = self.telemetry.sinks.iter_mut().find_map(|s| match s {
            SinkConfig::Http { url, .. } => Some(url),
            _ => None,
        });
        match existing {
            Some(slot) => *slot = url,
            None => self.telemetry.sinks.push(SinkConfig::Http {
                url,
                timeout_ms: 500,
            }),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            bail!("At least one camera must be configured");
        }
        for camera in &self.cameras {
            if camera.zones.is_empty() {
                bail!("Camera '{}' has no zones", camera.name);
            }
            for (i, zone) in camera.zones.iter().enumerate() {
                if zone.len() < 3 {
                    bail!(
                        "Camera '{}' zone {} has {} vertices (need at least 3)",
                        camera.name,
                        i,
                        zone.len()
                    );
                }
            }
            if let SourceConfig::Synthetic { frame_rate, .. } = camera.source {
                if !(frame_rate > 0.0) {
                    bail!("Camera '{}' has non-positive frame rate", camera.name);
                }
            }
        }
        if self.control.reference_camera >= self.cameras.len() {
            bail!(
                "reference_camera {} out of range ({} cameras)",
                self.control.reference_camera,
                self.cameras.len()
            );
        }
        if !(self.control.decision_interval_seconds > 0.0) {
            bail!("decision_interval_seconds must be positive");
        }
        if let Some(fps) = self.control.reference_frame_rate {
            if !(fps > 0.0) {
                bail!("reference_frame_rate must be positive");
            }
        }
        if self.control.simulation_timeout_ms == 0 {
            bail!("simulation_timeout_ms must be at least 1");
        }
        if self.telemetry.sink_queue_capacity == 0 {
            bail!("sink_queue_capacity must be at least 1");
        }
        Ok(())
    }

    /// Total zone count across all cameras, i.e. the occupancy vector length.
    pub fn total_zones(&self) -> usize {
        self.cameras.iter().map(|c| c.zones.len()).sum()
    }
}

/// Ticks between decisions: `round(seconds * fps)`, never less than one.
pub fn decision_interval_ticks(interval_seconds: f64, reference_fps: f64) -> u64 {
    let ticks = (interval_seconds * reference_fps).round();
    if ticks.is_finite() && ticks >= 1.0 {
        ticks as u64
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
control:
  decision_interval_seconds: 5.0
cameras:
  - name: north_west
    source: { kind: synthetic, frame_rate: 30.0 }
    zones:
      - [[50, 200], [250, 200], [250, 450], [50, 450]]
      - [[400, 200], [600, 200], [600, 450], [400, 450]]
  - name: south_east
    source: { kind: video, path: videos/intersection2.mp4 }
    zones:
      - [[100, 50], [400, 50], [400, 250], [100, 250]]
detector: { kind: synthetic, seed: 7 }
policy: { kind: fixed_cycle, input_dim: 6, switch_every: 3 }
simulation: { kind: surrogate }
telemetry:
  sink_queue_capacity: 8
  sinks:
    - { kind: jsonl, path: out/telemetry.jsonl }
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.cameras.len(), 2);
        assert_eq!(config.total_zones(), 3);
        assert_eq!(config.control.policy_timeout_ms, 250);
        assert_eq!(config.control.simulation_timeout_ms, 2000);
        assert_eq!(config.telemetry.sink_queue_capacity, 8);
        assert_eq!(config.telemetry.drain_grace_ms, 2000);
        assert!(matches!(
            config.simulation,
            crate::types::SimulationConfig::Surrogate { num_phases: 2, .. }
        ));
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config = Config::from_yaml(include_str!("../config.yaml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.total_zones(), 4);
        assert_eq!(config.telemetry.sinks.len(), 2);
    }

    #[test]
    fn test_rejects_degenerate_zone() {
        let mut config = Config::from_yaml(SAMPLE).unwrap();
        config.cameras[0].zones[1] = vec![[0, 0], [1, 1]];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_reference_camera() {
        let mut config = Config::from_yaml(SAMPLE).unwrap();
        config.control.reference_camera = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_decision_interval_ticks() {
        assert_eq!(decision_interval_ticks(5.0, 30.0), 150);
        assert_eq!(decision_interval_ticks(5.0, 29.97), 150);
        assert_eq!(decision_interval_ticks(0.01, 30.0), 1);
        assert_eq!(decision_interval_ticks(5.0, 0.0), 1);
    }
}
