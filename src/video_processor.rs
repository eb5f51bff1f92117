// src/video_processor.rs
//
// Frame acquisition. Recorded footage is treated as a continuous feed, so
// every source must be able to rewind to frame zero.

use crate::types::{Frame, SourceConfig};
use anyhow::Result;

pub trait FrameSource: Send {
    fn name(&self) -> &str;

    /// `Ok(None)` means the stream is exhausted; `Err` is a read failure.
    fn read_frame(&mut self) -> Result<Option<Frame>>;

    fn rewind(&mut self) -> Result<()>;

    fn frame_rate(&self) -> f64;
}

pub fn open_source(name: &str, config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    match config {
        SourceConfig::Synthetic {
            frame_rate,
            width,
            height,
        } => Ok(Box::new(SyntheticSource::new(
            name,
            *frame_rate,
            *width,
            *height,
        ))),
        #[cfg(feature = "opencv")]
        SourceConfig::Video { path } => Ok(Box::new(capture::VideoSource::open(name, path)?)),
        #[cfg(not(feature = "opencv"))]
        SourceConfig::Video { path } => {
            anyhow::bail!("Video source {} needs the `opencv` feature", path)
        }
    }
}

// ============================================================================
// SYNTHETIC SOURCE
// ============================================================================

/// Endless blank frames at a fixed rate. Pixel data is left empty; only the
/// synthetic detector consumes these.
pub struct SyntheticSource {
    name: String,
    frame_rate: f64,
    width: usize,
    height: usize,
    current_frame: u64,
}

impl SyntheticSource {
    pub fn new(name: &str, frame_rate: f64, width: usize, height: usize) -> Self {
        Self {
            name: name.to_string(),
            frame_rate,
            width,
            height,
            current_frame: 0,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        self.current_frame += 1;
        Ok(Some(Frame {
            data: Vec::new(),
            width: self.width,
            height: self.height,
            index: self.current_frame,
            timestamp_ms: self.current_frame as f64 / self.frame_rate * 1000.0,
        }))
    }

    fn rewind(&mut self) -> Result<()> {
        self.current_frame = 0;
        Ok(())
    }

    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }
}

// ============================================================================
// VIDEO FILE SOURCE
// ============================================================================

#[cfg(feature = "opencv")]
mod capture {
    use super::FrameSource;
    use crate::types::Frame;
    use anyhow::{Context, Result};
    use opencv::{
        core::Mat,
        imgproc,
        prelude::*,
        videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
    };
    use tracing::info;

    pub struct VideoSource {
        name: String,
        cap: VideoCapture,
        fps: f64,
        width: usize,
        height: usize,
        current_frame: u64,
    }

    impl VideoSource {
        pub fn open(name: &str, path: &str) -> Result<Self> {
            info!("📹 Opening video for '{}': {}", name, path);

            let cap = VideoCapture::from_file(path, videoio::CAP_ANY)
                .with_context(|| format!("Failed to open {}", path))?;
            if !cap.is_opened()? {
                anyhow::bail!("Failed to open video file {}", path);
            }

            let fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS)?;
            let total_frames = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_COUNT)?;
            let width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)? as usize;
            let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)? as usize;

            info!(
                "Video properties: {}x{} @ {:.1} FPS, {} frames",
                width, height, fps, total_frames as i64
            );

            Ok(Self {
                name: name.to_string(),
                cap,
                fps,
                width,
                height,
                current_frame: 0,
            })
        }
    }

    impl FrameSource for VideoSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn read_frame(&mut self) -> Result<Option<Frame>> {
            let mut mat = Mat::default();
            if !VideoCaptureTrait::read(&mut self.cap, &mut mat)? || mat.empty() {
                return Ok(None);
            }
            self.current_frame += 1;

            let mut rgb_mat = Mat::default();
            imgproc::cvt_color(&mat, &mut rgb_mat, imgproc::COLOR_BGR2RGB, 0)?;
            let data = rgb_mat.data_bytes()?.to_vec();

            Ok(Some(Frame {
                data,
                width: self.width,
                height: self.height,
                index: self.current_frame,
                timestamp_ms: self.current_frame as f64 / self.fps * 1000.0,
            }))
        }

        fn rewind(&mut self) -> Result<()> {
            VideoCaptureTrait::set(&mut self.cap, videoio::CAP_PROP_POS_FRAMES, 0.0)?;
            self.current_frame = 0;
            Ok(())
        }

        fn frame_rate(&self) -> f64 {
            self.fps
        }
    }
}
