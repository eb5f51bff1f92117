// src/stream_resilience.rs
//
// Wraps each camera's frame acquisition so the loop always gets a
// fixed-length occupancy vector: exhausted streams loop, bad reads hold the
// camera's last counts, malformed counts become zeros.

use crate::errors::{Degradation, FatalError};
use crate::types::Occupancy;
use crate::vehicle_detection::FrameProcessor;
use crate::video_processor::FrameSource;
use crate::zones::Zone;
use anyhow::Result;
use tracing::{debug, info, warn};

/// Per-camera bookkeeping. Only this module mutates it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamState {
    pub last_frame_index: Option<u64>,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub loop_restarts: u64,
    pub cardinality_mismatches: u64,
    /// Runs of consecutive failed reads
    pub outages: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadStatus {
    Fresh,
    /// Read or detection failed; previous counts reused
    Held,
    /// Counts had the wrong length; zeros substituted
    Substituted,
}

#[derive(Debug, Clone)]
pub struct CameraReading {
    pub counts: Occupancy,
    pub status: ReadStatus,
    pub detections: usize,
}

pub struct CameraStream {
    name: String,
    source: Box<dyn FrameSource>,
    processor: Box<dyn FrameProcessor>,
    zones: Vec<Zone>,
    state: StreamState,
    last_counts: Occupancy,
    mismatch_active: bool,
}

impl CameraStream {
    pub fn new(
        name: &str,
        source: Box<dyn FrameSource>,
        processor: Box<dyn FrameProcessor>,
        zones: Vec<Zone>,
    ) -> Self {
        let last_counts = vec![0; zones.len()];
        Self {
            name: name.to_string(),
            source,
            processor,
            zones,
            state: StreamState::default(),
            last_counts,
            mismatch_active: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    pub fn frame_rate(&self) -> f64 {
        self.source.frame_rate()
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    /// One read attempt. Never fails; the reading says how fresh it is.
    pub fn acquire(&mut self, tick: u64) -> (CameraReading, Option<Degradation>) {
        let frame = match self.next_frame() {
            Ok(frame) => frame,
            Err(e) => return (self.hold(tick, &e.to_string()), None),
        };

        let processed = match self.processor.process(&frame, &self.zones) {
            Ok(p) => p,
            Err(e) => return (self.hold(tick, &format!("detector: {}", e)), None),
        };

        self.state.last_frame_index = Some(frame.index);
        if self.state.consecutive_failures > 0 {
            info!(
                camera = %self.name,
                tick,
                failed_reads = self.state.consecutive_failures,
                "✓ Camera recovered"
            );
            self.state.consecutive_failures = 0;
        }

        let expected = self.zones.len();
        if processed.counts.len() != expected {
            self.state.cardinality_mismatches += 1;
            let degradation = Degradation::CardinalityMismatch {
                camera: self.name.clone(),
                expected,
                got: processed.counts.len(),
            };
            if !self.mismatch_active {
                warn!(camera = %self.name, tick, "⚠️  {}", degradation);
                self.mismatch_active = true;
            }
            let reading = CameraReading {
                counts: vec![0; expected],
                status: ReadStatus::Substituted,
                detections: processed.detections.len(),
            };
            return (reading, Some(degradation));
        }
        if self.mismatch_active {
            info!(camera = %self.name, tick, "✓ Zone counts back to {} entries", expected);
            self.mismatch_active = false;
        }

        self.last_counts = processed.counts.clone();
        let reading = CameraReading {
            counts: processed.counts,
            status: ReadStatus::Fresh,
            detections: processed.detections.len(),
        };
        (reading, None)
    }

    /// Reads a frame, looping back to the start when the stream ends.
    fn next_frame(&mut self) -> Result<crate::types::Frame> {
        if let Some(frame) = self.source.read_frame()? {
            return Ok(frame);
        }

        self.state.loop_restarts += 1;
        debug!(
            camera = %self.name,
            restarts = self.state.loop_restarts,
            "🔁 End of stream, rewinding"
        );
        self.source.rewind()?;
        self.source
            .read_frame()?
            .ok_or_else(|| anyhow::anyhow!("no frames after rewind"))
    }

    fn hold(&mut self, tick: u64, reason: &str) -> CameraReading {
        self.state.consecutive_failures += 1;
        self.state.total_failures += 1;
        if self.state.consecutive_failures == 1 {
            self.state.outages += 1;
            warn!(
                camera = %self.name,
                tick,
                reason,
                "⚠️  Camera read failed, holding last counts"
            );
        }
        CameraReading {
            counts: self.last_counts.clone(),
            status: ReadStatus::Held,
            detections: 0,
        }
    }
}

/// Occupancy for one tick plus whatever had to be substituted to get it.
#[derive(Debug, Clone)]
pub struct TickOccupancy {
    pub occupancy: Occupancy,
    pub degradations: Vec<Degradation>,
    pub fresh_cameras: usize,
    pub detections: usize,
}

pub struct StreamManager {
    cameras: Vec<CameraStream>,
    failure_limit: Option<u32>,
    all_failed: bool,
    blackouts: u64,
}

impl StreamManager {
    pub fn new(cameras: Vec<CameraStream>, failure_limit: Option<u32>) -> Self {
        Self {
            cameras,
            failure_limit,
            all_failed: false,
            blackouts: 0,
        }
    }

    /// Times every camera went dark at once.
    pub fn blackouts(&self) -> u64 {
        self.blackouts
    }

    pub fn cameras(&self) -> &[CameraStream] {
        &self.cameras
    }

    pub fn total_zones(&self) -> usize {
        self.cameras.iter().map(|c| c.zone_count()).sum()
    }

    /// One read per camera, concatenated in camera order.
    pub fn acquire(&mut self, tick: u64) -> Result<TickOccupancy, FatalError> {
        let mut occupancy = Vec::with_capacity(self.total_zones());
        let mut degradations = Vec::new();
        let mut fresh_cameras = 0;
        let mut detections = 0;

        for camera in &mut self.cameras {
            let (reading, degradation) = camera.acquire(tick);
            if let Some(limit) = self.failure_limit {
                if camera.state.consecutive_failures >= limit {
                    return Err(FatalError::StreamLost {
                        camera: camera.name.clone(),
                        consecutive: camera.state.consecutive_failures,
                    });
                }
            }
            if reading.status != ReadStatus::Held {
                fresh_cameras += 1;
            }
            detections += reading.detections;
            occupancy.extend_from_slice(&reading.counts);
            degradations.extend(degradation);
        }

        if fresh_cameras == 0 {
            if !self.all_failed {
                warn!(tick, "🚨 All cameras failed, holding last occupancy");
                self.all_failed = true;
                self.blackouts += 1;
            }
            degradations.push(Degradation::AllCamerasFailed);
        } else if self.all_failed {
            info!(tick, "✓ At least one camera is delivering again");
            self.all_failed = false;
        }

        Ok(TickOccupancy {
            occupancy,
            degradations,
            fresh_cameras,
            detections,
        })
    }
}
