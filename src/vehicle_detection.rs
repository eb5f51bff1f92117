// src/vehicle_detection.rs
//
// Per-frame perception: a detector produces vehicle boxes, a processor
// turns them into per-zone counts for one camera.

use crate::types::{DetectorConfig, Detection, Frame, Occupancy};
use crate::zones::{self, Zone};
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

// COCO class IDs for vehicles
#[cfg(any(feature = "onnx", test))]
const VEHICLE_CLASSES: [usize; 4] = [2, 3, 5, 7]; // car, motorcycle, bus, truck
#[cfg(any(feature = "onnx", test))]
const NMS_IOU_THRESHOLD: f32 = 0.45;

pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// Counts plus the raw detections (kept for visualization consumers).
#[derive(Debug, Clone, Default)]
pub struct ProcessedFrame {
    pub counts: Occupancy,
    pub detections: Vec<Detection>,
}

pub trait FrameProcessor: Send {
    fn process(&mut self, frame: &Frame, zones: &[Zone]) -> Result<ProcessedFrame>;
}

/// Detector followed by first-match zone counting.
pub struct ZoneProcessor<D: Detector> {
    detector: D,
}

impl<D: Detector> ZoneProcessor<D> {
    pub fn new(detector: D) -> Self {
        Self { detector }
    }
}

impl<D: Detector> FrameProcessor for ZoneProcessor<D> {
    fn process(&mut self, frame: &Frame, zones: &[Zone]) -> Result<ProcessedFrame> {
        let detections = self.detector.detect(frame)?;
        let counts = zones::count(&detections, zones);
        debug!(
            "Frame {}: {} detections, counts {:?}",
            frame.index,
            detections.len(),
            counts
        );
        Ok(ProcessedFrame { counts, detections })
    }
}

impl<T: Detector + ?Sized> Detector for Box<T> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        (**self).detect(frame)
    }
}

/// One processor per camera; synthetic detectors are seeded per camera.
pub fn build_processor(
    config: &DetectorConfig,
    camera_index: usize,
    zones: &[Zone],
) -> Result<Box<dyn FrameProcessor>> {
    let detector: Box<dyn Detector> = match config {
        DetectorConfig::Synthetic {
            seed,
            max_per_zone,
            stray_per_frame,
        } => Box::new(SyntheticDetector::new(
            seed.wrapping_add(camera_index as u64),
            zones.to_vec(),
            *max_per_zone,
            *stray_per_frame,
        )),
        #[cfg(feature = "onnx")]
        DetectorConfig::Yolo {
            model_path,
            confidence_threshold,
        } => Box::new(yolo::YoloDetector::new(model_path, *confidence_threshold)?),
        #[cfg(not(feature = "onnx"))]
        DetectorConfig::Yolo { model_path, .. } => {
            anyhow::bail!("YOLO model {} needs the `onnx` feature", model_path)
        }
    };
    Ok(Box::new(ZoneProcessor::new(detector)))
}

// ============================================================================
// SYNTHETIC DETECTOR
// ============================================================================

/// Generates plausible vehicles inside the configured zones so the whole
/// loop can run without footage or a model. Demand per zone drifts every
/// 100 frames with a little jitter on top.
pub struct SyntheticDetector {
    rng: StdRng,
    zones: Vec<Zone>,
    max_per_zone: u32,
    stray_per_frame: u32,
}

impl SyntheticDetector {
    pub fn new(seed: u64, zones: Vec<Zone>, max_per_zone: u32, stray_per_frame: u32) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            zones,
            max_per_zone,
            stray_per_frame,
        }
    }

    fn point_in_zone(&mut self, zone: &Zone) -> Option<(f32, f32)> {
        let (min_x, max_x) = min_max(zone.vertices.iter().map(|v| v.0))?;
        let (min_y, max_y) = min_max(zone.vertices.iter().map(|v| v.1))?;
        for _ in 0..20 {
            let p = (
                self.rng.gen_range(min_x..=max_x) as f32,
                self.rng.gen_range(min_y..=max_y) as f32,
            );
            if zone.contains(p) {
                return Some(p);
            }
        }
        None
    }
}

fn min_max(values: impl Iterator<Item = i32>) -> Option<(i32, i32)> {
    values.fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}

fn box_at_anchor(anchor: (f32, f32)) -> Detection {
    let (x, y) = anchor;
    Detection::from_bbox([x - 20.0, y - 30.0, x + 20.0, y], 2, "car", 0.9)
}

impl Detector for SyntheticDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let mut detections = Vec::new();
        let period = (frame.index / 100) as u32;

        let zones = self.zones.clone();
        for zone in &zones {
            let span = self.max_per_zone + 1;
            let base = (period + zone.index as u32) % span;
            let jitter: i32 = self.rng.gen_range(-1..=1);
            let target = (base as i32 + jitter).clamp(0, self.max_per_zone as i32) as u32;
            for _ in 0..target {
                if let Some(anchor) = self.point_in_zone(zone) {
                    detections.push(box_at_anchor(anchor));
                }
            }
        }

        for _ in 0..self.stray_per_frame {
            let anchor = (
                self.rng.gen_range(0.0..frame.width.max(1) as f32),
                self.rng.gen_range(0.0..frame.height.max(1) as f32),
            );
            detections.push(box_at_anchor(anchor));
        }

        Ok(detections)
    }
}

// ============================================================================
// YOLO POST-PROCESSING (only the ONNX detector consumes these)
// ============================================================================

#[cfg(any(feature = "onnx", test))]
fn class_id_to_name(class_id: usize) -> &'static str {
    match class_id {
        2 => "car",
        3 => "motorcycle",
        5 => "bus",
        7 => "truck",
        _ => "unknown",
    }
}

#[cfg(any(feature = "onnx", test))]
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep
            .iter()
            .all(|k| calculate_iou(&k.bbox, &det.bbox) < iou_threshold)
        {
            keep.push(det);
        }
    }
    keep
}

#[cfg(any(feature = "onnx", test))]
fn calculate_iou(box1: &[f32; 4], box2: &[f32; 4]) -> f32 {
    let x1 = box1[0].max(box2[0]);
    let y1 = box1[1].max(box2[1]);
    let x2 = box1[2].min(box2[2]);
    let y2 = box1[3].min(box2[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area1 = (box1[2] - box1[0]) * (box1[3] - box1[1]);
    let area2 = (box2[2] - box2[0]) * (box2[3] - box2[1]);
    let union = area1 + area2 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Decode a `[1, 4 + classes, N]` YOLOv8 output into vehicle detections in
/// source-image coordinates, undoing the letterbox.
#[cfg(any(feature = "onnx", test))]
fn decode_yolo_output(
    output: &[f32],
    num_classes: usize,
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    conf_thresh: f32,
) -> Vec<Detection> {
    let stride = 4 + num_classes;
    if output.len() < stride {
        return Vec::new();
    }
    let n = output.len() / stride;
    let mut detections = Vec::new();

    for i in 0..n {
        let cx = output[i];
        let cy = output[n + i];
        let w = output[n * 2 + i];
        let h = output[n * 3 + i];

        let mut max_conf = 0.0f32;
        let mut best_class = 0;
        for c in 0..num_classes {
            let conf = output[n * (4 + c) + i];
            if conf > max_conf {
                max_conf = conf;
                best_class = c;
            }
        }

        if max_conf < conf_thresh || !VEHICLE_CLASSES.contains(&best_class) {
            continue;
        }

        let x1 = (cx - w / 2.0 - pad_x) / scale;
        let y1 = (cy - h / 2.0 - pad_y) / scale;
        let x2 = (cx + w / 2.0 - pad_x) / scale;
        let y2 = (cy + h / 2.0 - pad_y) / scale;

        detections.push(Detection::from_bbox(
            [x1, y1, x2, y2],
            best_class,
            class_id_to_name(best_class),
            max_conf,
        ));
    }

    nms(detections, NMS_IOU_THRESHOLD)
}

// ============================================================================
// YOLO DETECTOR
// ============================================================================

#[cfg(feature = "onnx")]
mod yolo {
    use super::{decode_yolo_output, Detector};
    use crate::types::{Detection, Frame};
    use anyhow::Result;
    use ort::{
        execution_providers::CUDAExecutionProvider,
        session::{builder::GraphOptimizationLevel, Session},
    };
    use tracing::{debug, info};

    const YOLO_INPUT_SIZE: usize = 640;
    const YOLO_CLASSES: usize = 80;

    pub struct YoloDetector {
        session: Session,
        confidence_threshold: f32,
    }

    impl YoloDetector {
        pub fn new(model_path: &str, confidence_threshold: f32) -> Result<Self> {
            info!("Loading YOLO model: {}", model_path);

            let session = Session::builder()?
                .with_execution_providers([CUDAExecutionProvider::default()
                    .with_device_id(0)
                    .build()])?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(4)?
                .commit_from_file(model_path)?;

            info!("✓ YOLO detector initialized");
            Ok(Self {
                session,
                confidence_threshold,
            })
        }

        fn preprocess(&self, src: &[u8], src_w: usize, src_h: usize) -> (Vec<f32>, f32, f32, f32) {
            let target = YOLO_INPUT_SIZE;
            let scale = (target as f32 / src_w as f32).min(target as f32 / src_h as f32);
            let scaled_w = ((src_w as f32 * scale) as usize).clamp(1, target);
            let scaled_h = ((src_h as f32 * scale) as usize).clamp(1, target);
            let pad_x = (target - scaled_w) as f32 / 2.0;
            let pad_y = (target - scaled_h) as f32 / 2.0;

            let resized = resize_bilinear(src, src_w, src_h, scaled_w, scaled_h);

            // Gray letterbox canvas
            let mut canvas = vec![114u8; target * target * 3];
            for y in 0..scaled_h {
                for x in 0..scaled_w {
                    let src_idx = (y * scaled_w + x) * 3;
                    let dst_idx = ((y + pad_y as usize) * target + x + pad_x as usize) * 3;
                    canvas[dst_idx..dst_idx + 3].copy_from_slice(&resized[src_idx..src_idx + 3]);
                }
            }

            // HWC u8 -> CHW f32 in [0, 1]
            let mut input = vec![0.0f32; 3 * target * target];
            for c in 0..3 {
                for h in 0..target {
                    for w in 0..target {
                        input[c * target * target + h * target + w] =
                            canvas[(h * target + w) * 3 + c] as f32 / 255.0;
                    }
                }
            }

            (input, scale, pad_x, pad_y)
        }

        fn infer(&mut self, input: Vec<f32>) -> Result<Vec<f32>> {
            let shape = [1usize, 3, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE];
            let input_value = ort::value::Tensor::from_array((shape, input.into_boxed_slice()))?;
            let outputs = self.session.run(ort::inputs!["images" => input_value])?;
            let (_, data) = outputs[0].try_extract_tensor::<f32>()?;
            Ok(data.to_vec())
        }
    }

    impl Detector for YoloDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
            if frame.data.len() < frame.width * frame.height * 3 {
                anyhow::bail!(
                    "Frame {} has {} bytes, expected {}x{}x3",
                    frame.index,
                    frame.data.len(),
                    frame.width,
                    frame.height
                );
            }
            let (input, scale, pad_x, pad_y) =
                self.preprocess(&frame.data, frame.width, frame.height);
            let output = self.infer(input)?;
            let detections = decode_yolo_output(
                &output,
                YOLO_CLASSES,
                scale,
                pad_x,
                pad_y,
                self.confidence_threshold,
            );
            debug!("Detected {} vehicles", detections.len());
            Ok(detections)
        }
    }

    fn resize_bilinear(
        src: &[u8],
        src_w: usize,
        src_h: usize,
        dst_w: usize,
        dst_h: usize,
    ) -> Vec<u8> {
        let mut dst = vec![0u8; dst_h * dst_w * 3];
        let x_ratio = src_w as f32 / dst_w as f32;
        let y_ratio = src_h as f32 / dst_h as f32;

        for dy in 0..dst_h {
            for dx in 0..dst_w {
                let sx = dx as f32 * x_ratio;
                let sy = dy as f32 * y_ratio;
                let sx0 = (sx.floor() as usize).min(src_w - 1);
                let sy0 = (sy.floor() as usize).min(src_h - 1);
                let sx1 = (sx0 + 1).min(src_w - 1);
                let sy1 = (sy0 + 1).min(src_h - 1);
                let fx = sx - sx0 as f32;
                let fy = sy - sy0 as f32;

                for c in 0..3 {
                    let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f32;
                    let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f32;
                    let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f32;
                    let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f32;

                    let val = p00 * (1.0 - fx) * (1.0 - fy)
                        + p10 * fx * (1.0 - fy)
                        + p01 * (1.0 - fx) * fy
                        + p11 * fx * fy;

                    dst[(dy * dst_w + dx) * 3 + c] = val.round() as u8;
                }
            }
        }
        dst
    }
}
