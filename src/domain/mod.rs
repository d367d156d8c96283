//! Domain models - frames, contours, line geometry and published positions
//!
//! - `types` - Pixel grid, contour, position snapshot and wire types
//! - `geometry` - Hull, minimum-area rectangle and orientation estimators

pub mod geometry;
pub mod types;
