//! IO modules - external system interfaces
//!
//! - `camera` - Frame source trait and synthetic test pattern
//! - `contour` - Color-matched contour extraction
//! - `indicator` - Tri-state alignment feedback
//! - `position_server` - Position broadcast over TCP (newline-delimited JSON)
//! - `status_http` - Metrics, health, and adjustment HTTP endpoint
//! - `console` - Interactive key reader

pub mod camera;
pub mod console;
pub mod contour;
pub mod indicator;
pub mod position_server;
pub mod status_http;

// Re-export commonly used types
pub use camera::{Camera, SyntheticCamera, SyntheticCameraConfig};
pub use contour::{ColorContourFinder, ContourProvider};
pub use indicator::{Indicator, LogIndicator};
pub use position_server::{PositionServer, Request, Subscription};
pub use status_http::{start_status_server, StatusState};
