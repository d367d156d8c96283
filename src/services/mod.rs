//! Services - per-frame analysis and publication policy
//!
//! - `analyzer` - Focus-band and line geometry for one frame
//! - `position_state` - Debounce deciding when to publish
//! - `control_loop` - Frame-by-frame orchestration and runtime adjustments

pub mod analyzer;
pub mod control_loop;
pub mod position_state;

// Re-export commonly used types
pub use analyzer::{FocusObservation, FrameGeometry, GeometryAnalyzer};
pub use control_loop::{Adjustment, ControlLoop, LoopOptions, Settings};
pub use position_state::PositionStateMachine;
