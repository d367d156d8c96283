//! Configuration loading from TOML files
//!
//! Config file is selected via `--config <path>` (default: config/dev.toml).
//! Every section and key is optional; missing values take the defaults below.
//! A few CLI flags override the file after loading.

use crate::domain::geometry::EstimatorKind;
use crate::services::control_loop::{
    FOCUS_LINE_PCT_RANGE, MIDDLE_PERCENT_RANGE, WIDTH_RANGE,
};
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Width frames are resized to before analysis
    pub width: u32,
    /// Native height of the synthetic source
    pub height: u32,
    pub fps: u32,
    /// Flip around the x axis
    pub flip_x: bool,
    /// Flip around the y axis
    pub flip_y: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self { width: 400, height: 300, fps: 30, flip_x: false, flip_y: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Color of the tracked line (blue, green, red)
    pub bgr_color: [u8; 3],
    /// Hue tolerance around the target color
    pub hsv_range: u8,
    /// Regions smaller than this many pixels are ignored
    pub minimum_pixels: u32,
    /// Contours requested per region; only a single result is trusted
    pub contour_count: usize,
    /// Focus line position, percent of frame height from the bottom
    pub focus_line_pct: u32,
    /// Width of the centered window, percent of half the frame width
    pub middle_percent: u32,
    /// Publish when only the midline crossing changed
    pub report_midline: bool,
    pub estimator: EstimatorKind,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            bgr_color: [0, 0, 255],
            hsv_range: 20,
            minimum_pixels: 100,
            contour_count: 1,
            focus_line_pct: 10,
            middle_percent: 15,
            report_midline: false,
            estimator: EstimatorKind::BoundingBox,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Sequence id of the startup snapshot
    pub start_id: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), port: 50051, start_id: 0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// HTTP status port (0 to disable)
    pub port: u16,
    pub metrics_interval_secs: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { port: 8080, metrics_interval_secs: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Sleep after a failed iteration
    pub error_backoff_ms: u64,
    /// Read interactive adjustments from stdin
    pub console: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { error_backoff_ms: 1000, console: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub camera: CameraConfig,
    pub tracking: TrackingConfig,
    pub server: ServerConfig,
    pub status: StatusConfig,
    pub control: ControlConfig,
}

/// Command line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub width: Option<u32>,
    pub report_midline: bool,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    width: u32,
    camera_height: u32,
    fps: u32,
    flip_x: bool,
    flip_y: bool,
    bgr_color: [u8; 3],
    hsv_range: u8,
    minimum_pixels: u32,
    contour_count: usize,
    focus_line_pct: u32,
    middle_percent: u32,
    report_midline: bool,
    estimator: EstimatorKind,
    bind_address: String,
    port: u16,
    start_id: i64,
    status_port: u16,
    metrics_interval_secs: u64,
    error_backoff_ms: u64,
    console: bool,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let TomlConfig { camera, tracking, server, status, control } = toml_config;
        Self {
            width: camera.width.clamp(*WIDTH_RANGE.start(), *WIDTH_RANGE.end()),
            camera_height: camera.height.max(1),
            fps: camera.fps.max(1),
            flip_x: camera.flip_x,
            flip_y: camera.flip_y,
            bgr_color: tracking.bgr_color,
            hsv_range: tracking.hsv_range,
            minimum_pixels: tracking.minimum_pixels,
            contour_count: tracking.contour_count.max(1),
            focus_line_pct: tracking
                .focus_line_pct
                .clamp(*FOCUS_LINE_PCT_RANGE.start(), *FOCUS_LINE_PCT_RANGE.end()),
            middle_percent: tracking
                .middle_percent
                .clamp(*MIDDLE_PERCENT_RANGE.start(), *MIDDLE_PERCENT_RANGE.end()),
            report_midline: tracking.report_midline,
            estimator: tracking.estimator,
            bind_address: server.bind_address,
            port: server.port,
            start_id: server.start_id,
            status_port: status.port,
            metrics_interval_secs: status.metrics_interval_secs.max(1),
            error_backoff_ms: control.error_backoff_ms,
            console: control.console,
            config_file,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Apply command line overrides
    pub fn with_overrides(mut self, overrides: &Overrides) -> Self {
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(width) = overrides.width {
            self.width = width.clamp(*WIDTH_RANGE.start(), *WIDTH_RANGE.end());
        }
        if overrides.report_midline {
            self.report_midline = true;
        }
        self
    }

    /// Listen address of the position server
    pub fn server_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.bind_address, self.port);
        addr.parse().with_context(|| format!("Invalid server bind address {addr}"))
    }

    // Getters for all config fields
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn camera_height(&self) -> u32 {
        self.camera_height
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn flip_x(&self) -> bool {
        self.flip_x
    }

    pub fn flip_y(&self) -> bool {
        self.flip_y
    }

    pub fn bgr_color(&self) -> [u8; 3] {
        self.bgr_color
    }

    pub fn hsv_range(&self) -> u8 {
        self.hsv_range
    }

    pub fn minimum_pixels(&self) -> u32 {
        self.minimum_pixels
    }

    pub fn contour_count(&self) -> usize {
        self.contour_count
    }

    pub fn focus_line_pct(&self) -> u32 {
        self.focus_line_pct
    }

    pub fn middle_percent(&self) -> u32 {
        self.middle_percent
    }

    pub fn report_midline(&self) -> bool {
        self.report_midline
    }

    pub fn estimator(&self) -> EstimatorKind {
        self.estimator
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn start_id(&self) -> i64 {
        self.start_id
    }

    pub fn status_port(&self) -> u16 {
        self.status_port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn error_backoff_ms(&self) -> u64 {
        self.error_backoff_ms
    }

    pub fn console(&self) -> bool {
        self.console
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.width(), 400);
        assert_eq!(config.focus_line_pct(), 10);
        assert_eq!(config.middle_percent(), 15);
        assert_eq!(config.hsv_range(), 20);
        assert_eq!(config.port(), 50051);
        assert_eq!(config.start_id(), 0);
        assert_eq!(config.contour_count(), 1);
        assert_eq!(config.estimator(), EstimatorKind::BoundingBox);
        assert!(!config.report_midline());
        assert_eq!(config.config_file(), "default");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[tracking]
report_midline = true
estimator = "contour_slope"
"#,
        )
        .unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert!(config.report_midline());
        assert_eq!(config.estimator(), EstimatorKind::ContourSlope);
        assert_eq!(config.width(), 400);
        assert_eq!(config.port(), 50051);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[camera]
width = 5000

[tracking]
focus_line_pct = 0
middle_percent = 99
"#,
        )
        .unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.width(), 2000);
        assert_eq!(config.focus_line_pct(), 1);
        assert_eq!(config.middle_percent(), 98);
    }

    #[test]
    fn test_overrides() {
        let overrides = Overrides { port: Some(6000), width: Some(100), report_midline: true };
        let config = Config::default().with_overrides(&overrides);
        assert_eq!(config.port(), 6000);
        assert_eq!(config.width(), 200);
        assert!(config.report_midline());
    }

    #[test]
    fn test_server_addr() {
        let config = Config::default();
        assert_eq!(config.server_addr().unwrap().port(), 50051);
    }
}
