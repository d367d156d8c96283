//! Per-frame geometry analysis
//!
//! Converts the full-frame and focus-band contours into a `FocusObservation`:
//! where the focus-band centroid sits, where the tracked line crosses the
//! focus line, and how far above the focus line it crosses the vertical midline.

use crate::domain::geometry::{LineGeometry, OrientationEstimator, Slope};
use crate::domain::types::{Alignment, Contour, PositionUpdate};

/// Half height of the horizontal strip searched for the focus-band contour
pub const FOCUS_BAND_HALF_HEIGHT: i32 = 5;

/// Reference lines of one frame size and configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: i32,
    pub height: i32,
    /// y of the horizontal focus line, measured from the top
    pub focus_line_y: i32,
    pub mid_x: i32,
    pub mid_y: i32,
    /// Half width of the "centered" window around `mid_x`
    pub middle_increment: i32,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32, focus_line_pct: u32, middle_percent: u32) -> Self {
        let h = height as f64;
        let focus_line_y = (h - h * (focus_line_pct as f64 / 100.0)).round() as i32;
        let mid_x = (width / 2) as i32;
        let mid_y = (height / 2) as i32;
        let middle_increment = (mid_x as f64 * (middle_percent as f64 / 100.0) / 2.0).round() as i32;
        Self {
            width: width as i32,
            height: height as i32,
            focus_line_y,
            mid_x,
            mid_y,
            middle_increment,
        }
    }

    /// Inclusive row range of the focus band
    pub fn focus_band(&self) -> (i32, i32) {
        (self.focus_line_y - FOCUS_BAND_HALF_HEIGHT, self.focus_line_y + FOCUS_BAND_HALF_HEIGHT)
    }

    /// Centered when the focus centroid is within `middle_increment` of `mid_x`
    pub fn alignment(&self, focus_img_x: Option<i32>) -> Alignment {
        match focus_img_x {
            None => Alignment::Absent,
            Some(x) if (x - self.mid_x).abs() <= self.middle_increment => Alignment::Centered,
            Some(_) => Alignment::OffCenter,
        }
    }
}

/// Everything derived from one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusObservation {
    /// Centroid x of the contour inside the focus band
    pub focus_img_x: Option<i32>,
    pub line: Option<LineGeometry>,
    /// x where the tracked line crosses the focus line
    pub focus_line_inter: Option<i32>,
    /// y where the tracked line crosses the vertical midline
    pub mid_line_inter: Option<i32>,
    /// Distance from the focus line up to `mid_line_inter`; -1 when not strictly positive or undefined
    pub mid_line_cross: i32,
}

impl FocusObservation {
    pub const ABSENT: FocusObservation = FocusObservation {
        focus_img_x: None,
        line: None,
        focus_line_inter: None,
        mid_line_inter: None,
        mid_line_cross: -1,
    };

    pub fn degrees(&self) -> Option<i32> {
        self.line.map(|line| line.degrees)
    }

    /// Publishable fields for this observation
    pub fn position_update(&self, geometry: &FrameGeometry) -> PositionUpdate {
        PositionUpdate {
            in_focus: self.focus_img_x.is_some(),
            mid_offset: self.focus_img_x.map_or(0, |x| x - geometry.mid_x),
            degrees: self.degrees(),
            mid_line_cross: self.mid_line_cross,
            frame_width: geometry.width,
            middle_increment: geometry.middle_increment,
        }
    }
}

/// Only a single qualifying contour is trusted
fn single(contours: &[Contour]) -> Option<&Contour> {
    match contours {
        [only] => Some(only),
        _ => None,
    }
}

/// Geometry analyzer with a pluggable orientation estimator
pub struct GeometryAnalyzer {
    estimator: Box<dyn OrientationEstimator>,
}

impl GeometryAnalyzer {
    pub fn new(estimator: Box<dyn OrientationEstimator>) -> Self {
        Self { estimator }
    }

    pub fn estimator_name(&self) -> &'static str {
        self.estimator.name()
    }

    pub fn analyze(
        &self,
        geometry: &FrameGeometry,
        line_contours: &[Contour],
        focus_contours: &[Contour],
    ) -> FocusObservation {
        let mut observation = FocusObservation::ABSENT;
        observation.focus_img_x = single(focus_contours).map(|c| c.centroid().x);

        let Some(contour) = single(line_contours) else {
            return observation;
        };
        let Some(segment) = self.estimator.forward_segment(contour) else {
            return observation;
        };

        let centroid = contour.centroid();
        let line = LineGeometry::from_segment(segment, centroid);
        observation.line = Some(line);

        let focus_y = geometry.focus_line_y as f64;
        let mid_x = geometry.mid_x as f64;

        observation.focus_line_inter = match (line.slope, line.y_intercept) {
            (Slope::Vertical, _) => Some(centroid.x),
            (Slope::Finite(s), _) if s == 0.0 => None,
            (Slope::Finite(s), Some(y0)) => Some(((focus_y - y0) / s).round() as i32),
            (Slope::Finite(_), None) => None,
        };

        observation.mid_line_inter = match (line.slope, line.y_intercept) {
            (Slope::Vertical, _) => {
                (observation.focus_line_inter == Some(geometry.mid_x)).then_some(geometry.mid_y)
            }
            (Slope::Finite(s), Some(y0)) => Some((s * mid_x + y0).round() as i32),
            (Slope::Finite(_), None) => None,
        };

        observation.mid_line_cross = observation
            .mid_line_inter
            .map(|y| geometry.focus_line_y - y)
            .filter(|cross| *cross > 0)
            .unwrap_or(-1);

        observation
    }
}
