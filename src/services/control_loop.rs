//! Control loop
//!
//! Single producer thread: read a frame, find contours on the full frame and
//! on the focus band, analyze, debounce, publish. Adjustments from the console
//! or the status endpoint arrive on a channel and are applied between frames.
//! A failing iteration is logged and retried after a short sleep.

use crate::domain::types::Frame;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::camera::Camera;
use crate::io::contour::ContourProvider;
use crate::io::indicator::Indicator;
use crate::io::position_server::PositionServer;
use crate::services::analyzer::{FrameGeometry, GeometryAnalyzer};
use crate::services::position_state::PositionStateMachine;
use anyhow::{bail, Context};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};

pub const WIDTH_RANGE: RangeInclusive<u32> = 200..=2000;
pub const FOCUS_LINE_PCT_RANGE: RangeInclusive<u32> = 1..=99;
pub const MIDDLE_PERCENT_RANGE: RangeInclusive<u32> = 2..=98;

/// Pixels per width key press
pub const WIDTH_STEP: u32 = 10;

/// Interactive reconfiguration command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    WidthDown,
    WidthUp,
    MiddleDown,
    MiddleUp,
    FocusDown,
    FocusUp,
    /// Restore the initial width and middle percentage
    Reset,
    Stop,
}

impl Adjustment {
    pub fn from_key(key: char) -> Option<Self> {
        match key {
            'w' => Some(Adjustment::WidthDown),
            'W' => Some(Adjustment::WidthUp),
            '-' | '_' => Some(Adjustment::MiddleDown),
            '+' | '=' => Some(Adjustment::MiddleUp),
            'j' => Some(Adjustment::FocusDown),
            'k' => Some(Adjustment::FocusUp),
            'r' => Some(Adjustment::Reset),
            'q' => Some(Adjustment::Stop),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "width_down" => Some(Adjustment::WidthDown),
            "width_up" => Some(Adjustment::WidthUp),
            "middle_down" => Some(Adjustment::MiddleDown),
            "middle_up" => Some(Adjustment::MiddleUp),
            "focus_down" => Some(Adjustment::FocusDown),
            "focus_up" => Some(Adjustment::FocusUp),
            "reset" => Some(Adjustment::Reset),
            "stop" => Some(Adjustment::Stop),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Adjustment::WidthDown => "width_down",
            Adjustment::WidthUp => "width_up",
            Adjustment::MiddleDown => "middle_down",
            Adjustment::MiddleUp => "middle_up",
            Adjustment::FocusDown => "focus_down",
            Adjustment::FocusUp => "focus_up",
            Adjustment::Reset => "reset",
            Adjustment::Stop => "stop",
        }
    }
}

/// Result of applying an `Adjustment` to `Settings`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustOutcome {
    /// Out of range; nothing changed
    Ignored,
    /// Focus line moved
    Applied,
    /// Width or middle window changed; debounce memory must be cleared
    Reshaped,
    Stop,
}

/// Runtime-adjustable analysis settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    width: u32,
    focus_line_pct: u32,
    middle_percent: u32,
    initial_width: u32,
    initial_middle_percent: u32,
}

impl Settings {
    /// Initial values are clamped into their ranges
    pub fn new(width: u32, focus_line_pct: u32, middle_percent: u32) -> Self {
        let width = width.clamp(*WIDTH_RANGE.start(), *WIDTH_RANGE.end());
        let middle_percent =
            middle_percent.clamp(*MIDDLE_PERCENT_RANGE.start(), *MIDDLE_PERCENT_RANGE.end());
        Self {
            width,
            focus_line_pct: focus_line_pct
                .clamp(*FOCUS_LINE_PCT_RANGE.start(), *FOCUS_LINE_PCT_RANGE.end()),
            middle_percent,
            initial_width: width,
            initial_middle_percent: middle_percent,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.width(), config.focus_line_pct(), config.middle_percent())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn focus_line_pct(&self) -> u32 {
        self.focus_line_pct
    }

    pub fn middle_percent(&self) -> u32 {
        self.middle_percent
    }

    pub fn set_width(&mut self, width: u32) -> bool {
        if !WIDTH_RANGE.contains(&width) {
            return false;
        }
        self.width = width;
        true
    }

    pub fn set_focus_line_pct(&mut self, pct: u32) -> bool {
        if !FOCUS_LINE_PCT_RANGE.contains(&pct) {
            return false;
        }
        self.focus_line_pct = pct;
        true
    }

    pub fn set_middle_percent(&mut self, pct: u32) -> bool {
        if !MIDDLE_PERCENT_RANGE.contains(&pct) {
            return false;
        }
        self.middle_percent = pct;
        true
    }

    pub fn apply(&mut self, adjustment: Adjustment) -> AdjustOutcome {
        let reshaped = |ok: bool| if ok { AdjustOutcome::Reshaped } else { AdjustOutcome::Ignored };
        let moved = |ok: bool| if ok { AdjustOutcome::Applied } else { AdjustOutcome::Ignored };

        match adjustment {
            Adjustment::WidthDown => reshaped(self.set_width(self.width.saturating_sub(WIDTH_STEP))),
            Adjustment::WidthUp => reshaped(self.set_width(self.width + WIDTH_STEP)),
            Adjustment::MiddleDown => {
                reshaped(self.set_middle_percent(self.middle_percent.saturating_sub(1)))
            }
            Adjustment::MiddleUp => reshaped(self.set_middle_percent(self.middle_percent + 1)),
            Adjustment::FocusDown => {
                moved(self.set_focus_line_pct(self.focus_line_pct.saturating_sub(1)))
            }
            Adjustment::FocusUp => moved(self.set_focus_line_pct(self.focus_line_pct + 1)),
            Adjustment::Reset => {
                self.width = self.initial_width;
                self.middle_percent = self.initial_middle_percent;
                AdjustOutcome::Reshaped
            }
            Adjustment::Stop => AdjustOutcome::Stop,
        }
    }
}

/// Fixed per-run options of the loop
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub flip_x: bool,
    pub flip_y: bool,
    pub minimum_pixels: u32,
    pub contour_count: usize,
    pub error_backoff: Duration,
}

impl LoopOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            flip_x: config.flip_x(),
            flip_y: config.flip_y(),
            minimum_pixels: config.minimum_pixels(),
            contour_count: config.contour_count(),
            error_backoff: Duration::from_millis(config.error_backoff_ms()),
        }
    }
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            flip_x: false,
            flip_y: false,
            minimum_pixels: 100,
            contour_count: 1,
            error_backoff: Duration::from_millis(1000),
        }
    }
}

pub struct ControlLoop<C: Camera, P: ContourProvider, I: Indicator> {
    camera: C,
    contours: P,
    indicator: I,
    analyzer: GeometryAnalyzer,
    state: PositionStateMachine,
    settings: Settings,
    options: LoopOptions,
    server: Arc<PositionServer>,
    metrics: Arc<Metrics>,
    adjustments: mpsc::Receiver<Adjustment>,
    stop: Arc<AtomicBool>,
}

impl<C: Camera, P: ContourProvider, I: Indicator> ControlLoop<C, P, I> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera: C,
        contours: P,
        indicator: I,
        analyzer: GeometryAnalyzer,
        state: PositionStateMachine,
        settings: Settings,
        options: LoopOptions,
        server: Arc<PositionServer>,
        metrics: Arc<Metrics>,
        adjustments: mpsc::Receiver<Adjustment>,
    ) -> Self {
        Self {
            camera,
            contours,
            indicator,
            analyzer,
            state,
            settings,
            options,
            server,
            metrics,
            adjustments,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag ends `run` after the current iteration
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn indicator(&self) -> &I {
        &self.indicator
    }

    /// Resize to the configured width, then apply flips
    fn prepare(&self, frame: Frame) -> Frame {
        let mut frame =
            if frame.width() == self.settings.width() { frame } else { frame.resize_to_width(self.settings.width()) };
        if self.options.flip_x {
            frame = frame.flip_vertical();
        }
        if self.options.flip_y {
            frame = frame.flip_horizontal();
        }
        frame
    }

    /// Process one frame; returns the published id, if any
    pub fn step(&mut self) -> anyhow::Result<Option<i64>> {
        let started = Instant::now();

        let frame = self.camera.read().context("camera read failed")?;
        if frame.is_empty() {
            bail!("camera returned an empty frame");
        }
        let frame = self.prepare(frame);

        let geometry = FrameGeometry::new(
            frame.width(),
            frame.height(),
            self.settings.focus_line_pct(),
            self.settings.middle_percent(),
        );
        let (band_top, band_bottom) = geometry.focus_band();

        let line_contours = self.contours.find_largest_contours(
            &frame,
            self.options.minimum_pixels,
            self.options.contour_count,
        );
        let focus_contours = self.contours.find_largest_contours(
            &frame.mask_rows(band_top, band_bottom),
            self.options.minimum_pixels,
            self.options.contour_count,
        );

        let observation = self.analyzer.analyze(&geometry, &line_contours, &focus_contours);
        if observation.line.is_some() {
            self.metrics.record_line_detected();
        }
        self.indicator.show(geometry.alignment(observation.focus_img_x));

        let published = self
            .state
            .observe(&observation, &geometry)
            .and_then(|update| self.server.write_position(update));

        self.metrics.record_frame_processed(started.elapsed().as_micros() as u64);
        Ok(published)
    }

    /// Apply one adjustment; returns false when the loop should stop
    pub fn apply(&mut self, adjustment: Adjustment) -> bool {
        match self.settings.apply(adjustment) {
            AdjustOutcome::Ignored => {
                debug!(adjustment = %adjustment.as_str(), "adjustment_ignored");
            }
            AdjustOutcome::Applied => {
                info!(
                    adjustment = %adjustment.as_str(),
                    focus_line_pct = %self.settings.focus_line_pct(),
                    "settings_changed"
                );
            }
            AdjustOutcome::Reshaped => {
                self.state.reset();
                info!(
                    adjustment = %adjustment.as_str(),
                    width = %self.settings.width(),
                    middle_percent = %self.settings.middle_percent(),
                    "settings_changed"
                );
            }
            AdjustOutcome::Stop => {
                info!("stop_requested");
                return false;
            }
        }
        true
    }

    /// Drain pending adjustments; returns false when a stop was requested
    fn poll_adjustments(&mut self) -> bool {
        loop {
            match self.adjustments.try_recv() {
                Ok(adjustment) => {
                    if !self.apply(adjustment) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    /// Run until stopped
    pub fn run(mut self) -> anyhow::Result<()> {
        self.camera.open().context("failed to open camera")?;
        info!(
            estimator = %self.analyzer.estimator_name(),
            width = %self.settings.width(),
            focus_line_pct = %self.settings.focus_line_pct(),
            middle_percent = %self.settings.middle_percent(),
            report_midline = %self.state.report_midline(),
            "control_loop_started"
        );

        while !self.stop.load(Ordering::Acquire) {
            if !self.camera.is_open() {
                warn!("camera_closed");
                break;
            }
            if !self.poll_adjustments() {
                break;
            }
            if let Err(e) = self.step() {
                error!(error = %format!("{e:#}"), "frame_processing_failed");
                self.metrics.record_frame_error();
                std::thread::sleep(self.options.error_backoff);
            }
        }

        self.indicator.clear();
        self.camera.close();
        self.server.stop();
        info!(frames = %self.metrics.frames_total(), "control_loop_stopped");
        Ok(())
    }
}
