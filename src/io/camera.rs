//! Camera interface and a synthetic test-pattern source
//!
//! Real drivers live outside this crate; anything that can produce BGR frames
//! implements `Camera`. `SyntheticCamera` renders a colored line that sweeps
//! left/right and tilts over time, paced to the configured frame rate.

use crate::domain::types::Frame;
use anyhow::bail;
use std::f64::consts::TAU;
use std::time::{Duration, Instant};
use tracing::info;

/// Frame source driven by the control loop
pub trait Camera: Send {
    fn open(&mut self) -> anyhow::Result<()>;

    fn is_open(&self) -> bool;

    /// Blocks until the next frame is available
    fn read(&mut self) -> anyhow::Result<Frame>;

    fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct SyntheticCameraConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub line_bgr: [u8; 3],
    pub background_bgr: [u8; 3],
    pub line_thickness: f64,
    /// Frames per full left-right sweep
    pub sweep_frames: u32,
}

impl Default for SyntheticCameraConfig {
    fn default() -> Self {
        Self {
            width: 400,
            height: 300,
            fps: 30,
            line_bgr: [0, 0, 255],
            background_bgr: [90, 90, 90],
            line_thickness: 12.0,
            sweep_frames: 240,
        }
    }
}

pub struct SyntheticCamera {
    config: SyntheticCameraConfig,
    open: bool,
    frame_index: u64,
    last_read: Option<Instant>,
}

impl SyntheticCamera {
    pub fn new(config: SyntheticCameraConfig) -> Self {
        Self { config, open: false, frame_index: 0, last_read: None }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.fps.max(1) as f64)
    }

    /// Line center x and tilt from vertical (radians) for a frame index
    fn line_pose(&self, index: u64) -> (f64, f64) {
        let phase = index as f64 / self.config.sweep_frames.max(1) as f64;
        let width = self.config.width as f64;
        let center_x = width / 2.0 + width / 5.0 * (TAU * phase).sin();
        let tilt = 25f64.to_radians() * (TAU * phase / 1.7).sin();
        (center_x, tilt)
    }

    /// Render the test pattern for a frame index
    pub fn render(&self, index: u64) -> Frame {
        let (center_x, tilt) = self.line_pose(index);
        let center_y = self.config.height as f64 / 2.0;
        // Unit direction along the line
        let (dx, dy) = (tilt.sin(), -tilt.cos());
        let half = self.config.line_thickness / 2.0;
        let line = self.config.line_bgr;
        let background = self.config.background_bgr;

        Frame::from_fn(self.config.width, self.config.height, |x, y| {
            let px = x as f64 - center_x;
            let py = y as f64 - center_y;
            let distance = (px * dy - py * dx).abs();
            if distance <= half {
                line
            } else {
                background
            }
        })
    }
}

impl Camera for SyntheticCamera {
    fn open(&mut self) -> anyhow::Result<()> {
        if self.config.width == 0 || self.config.height == 0 {
            bail!("synthetic camera needs a non-empty frame size");
        }
        self.open = true;
        info!(
            width = %self.config.width,
            height = %self.config.height,
            fps = %self.config.fps,
            "synthetic_camera_opened"
        );
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self) -> anyhow::Result<Frame> {
        if !self.open {
            bail!("camera is not open");
        }

        if let Some(last) = self.last_read {
            let remaining = self.frame_interval().saturating_sub(last.elapsed());
            if !remaining.is_zero() {
                std::thread::sleep(remaining);
            }
        }
        self.last_read = Some(Instant::now());

        let frame = self.render(self.frame_index);
        self.frame_index += 1;
        Ok(frame)
    }

    fn close(&mut self) {
        if self.open {
            info!(frames = %self.frame_index, "synthetic_camera_closed");
        }
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> SyntheticCamera {
        SyntheticCamera::new(SyntheticCameraConfig { fps: 1000, ..Default::default() })
    }

    #[test]
    fn test_read_requires_open() {
        let mut cam = camera();
        assert!(!cam.is_open());
        assert!(cam.read().is_err());

        cam.open().unwrap();
        let frame = cam.read().unwrap();
        assert_eq!((frame.width(), frame.height()), (400, 300));

        cam.close();
        assert!(!cam.is_open());
    }

    #[test]
    fn test_first_frame_has_vertical_line_through_center() {
        let cam = camera();
        let frame = cam.render(0);
        assert_eq!(frame.pixel(200, 0), [0, 0, 255]);
        assert_eq!(frame.pixel(200, 299), [0, 0, 255]);
        assert_eq!(frame.pixel(100, 150), [90, 90, 90]);
    }

    #[test]
    fn test_pattern_moves() {
        let cam = camera();
        let first = cam.render(0);
        let later = cam.render(60);
        assert_ne!(first.pixel(200, 150), later.pixel(200, 150));
    }
}
