//! Line orientation from contours
//!
//! Two interchangeable estimators turn a contour into a forward-direction
//! segment with integer endpoints:
//! - `BoundingBoxEstimator` (default) - longer edge of the minimum-area
//!   bounding rectangle
//! - `ContourSlopeEstimator` - principal axis of the outline's second moments
//!
//! `LineGeometry::from_segment` derives slope, angle and y-intercept from that
//! segment. A segment with `delta_x == 0` is vertical: no slope, 90 degrees.

use crate::domain::types::{Centroid, Contour, Point};
use imageproc::geometry;
use imageproc::point::Point as ImagePoint;
use serde::Deserialize;

/// Convex hull of a point set, no repeated points
///
/// Inputs with fewer than three distinct points are returned deduplicated.
pub fn convex_hull(points: &[Point]) -> Vec<Point> {
    let mut pts = points.to_vec();
    pts.sort_unstable();
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }
    let pts: Vec<ImagePoint<i32>> = pts.into_iter().map(Into::into).collect();
    geometry::convex_hull(pts).into_iter().map(Into::into).collect()
}

/// Corners of the minimum-area rectangle enclosing `points`
///
/// Corner i and i+1 share an edge. `None` for an empty point set.
pub fn min_area_rect(points: &[Point]) -> Option<[Point; 4]> {
    if points.is_empty() {
        return None;
    }
    let pts: Vec<ImagePoint<i32>> = points.iter().copied().map(Into::into).collect();
    Some(geometry::min_area_rect(&pts).map(Into::into))
}

/// Directed segment between two pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSegment {
    pub start: Point,
    pub end: Point,
}

impl LineSegment {
    pub fn new(start: Point, end: Point) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn delta_x(&self) -> i32 {
        self.end.x - self.start.x
    }

    #[inline]
    pub fn delta_y(&self) -> i32 {
        self.end.y - self.start.y
    }

    fn length_sq(&self) -> i64 {
        let dx = self.delta_x() as i64;
        let dy = self.delta_y() as i64;
        dx * dx + dy * dy
    }
}

/// Slope of a line in image coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slope {
    Vertical,
    Finite(f64),
}

/// Orientation of the tracked line for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineGeometry {
    pub slope: Slope,
    /// Rotation in whole degrees; lines leaning right (x grows as y shrinks) are positive
    pub degrees: i32,
    /// Undefined for vertical lines
    pub y_intercept: Option<f64>,
}

impl LineGeometry {
    /// Orientation of `segment`, anchored at the contour centroid
    pub fn from_segment(segment: LineSegment, centroid: Centroid) -> Self {
        let dx = segment.delta_x();
        if dx == 0 {
            return Self { slope: Slope::Vertical, degrees: 90, y_intercept: None };
        }

        let slope = segment.delta_y() as f64 / dx as f64;
        let degrees = -(slope.atan().to_degrees().round() as i32);
        let y_intercept = centroid.y as f64 - slope * centroid.x as f64;
        Self { slope: Slope::Finite(slope), degrees, y_intercept: Some(y_intercept) }
    }
}

/// Capability of turning a contour into a forward-direction segment
pub trait OrientationEstimator: Send + Sync {
    /// Segment along the contour's long axis, `None` for degenerate contours
    fn forward_segment(&self, contour: &Contour) -> Option<LineSegment>;

    fn name(&self) -> &'static str;
}

/// Longer edge of the minimum-area bounding rectangle
///
/// When both adjacent edges have equal length the edge closer to vertical wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundingBoxEstimator;

impl OrientationEstimator for BoundingBoxEstimator {
    fn forward_segment(&self, contour: &Contour) -> Option<LineSegment> {
        let hull = convex_hull(contour.points());
        if hull.len() < 2 {
            return None;
        }
        let corners = min_area_rect(&hull)?;

        let first = LineSegment::new(corners[0], corners[1]);
        let second = LineSegment::new(corners[1], corners[2]);
        let chosen = match first.length_sq().cmp(&second.length_sq()) {
            std::cmp::Ordering::Greater => first,
            std::cmp::Ordering::Less => second,
            std::cmp::Ordering::Equal => {
                if second.delta_x().abs() < first.delta_x().abs() {
                    second
                } else {
                    first
                }
            }
        };

        (chosen.length_sq() > 0).then_some(chosen)
    }

    fn name(&self) -> &'static str {
        "bounding_box"
    }
}

/// Principal axis of the outline's second-order central moments
///
/// The segment spans the outline's extent along that axis, through the mean
/// of the outline points.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContourSlopeEstimator;

impl OrientationEstimator for ContourSlopeEstimator {
    fn forward_segment(&self, contour: &Contour) -> Option<LineSegment> {
        let points = contour.points();
        if points.len() < 2 {
            return None;
        }

        let n = points.len() as f64;
        let mx = points.iter().map(|p| p.x as f64).sum::<f64>() / n;
        let my = points.iter().map(|p| p.y as f64).sum::<f64>() / n;

        let (mut mu20, mut mu02, mut mu11) = (0.0f64, 0.0f64, 0.0f64);
        for p in points {
            let dx = p.x as f64 - mx;
            let dy = p.y as f64 - my;
            mu20 += dx * dx;
            mu02 += dy * dy;
            mu11 += dx * dy;
        }

        let theta = 0.5 * (2.0 * mu11).atan2(mu20 - mu02);
        let (ux, uy) = (theta.cos(), theta.sin());

        let half = points
            .iter()
            .map(|p| ((p.x as f64 - mx) * ux + (p.y as f64 - my) * uy).abs())
            .fold(0.0f64, f64::max);
        if half == 0.0 {
            return None;
        }

        let start = Point::new((mx - ux * half).round() as i32, (my - uy * half).round() as i32);
        let end = Point::new((mx + ux * half).round() as i32, (my + uy * half).round() as i32);
        (start != end).then_some(LineSegment::new(start, end))
    }

    fn name(&self) -> &'static str {
        "contour_slope"
    }
}

/// Configurable choice of orientation estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    #[default]
    BoundingBox,
    ContourSlope,
}

impl EstimatorKind {
    pub fn build(self) -> Box<dyn OrientationEstimator> {
        match self {
            EstimatorKind::BoundingBox => Box::new(BoundingBoxEstimator),
            EstimatorKind::ContourSlope => Box::new(ContourSlopeEstimator),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EstimatorKind::BoundingBox => "bounding_box",
            EstimatorKind::ContourSlope => "contour_slope",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x0: i32, y0: i32, x1: i32, y1: i32) -> Contour {
        Contour::from_polygon(vec![
            Point::new(x0, y0),
            Point::new(x1, y0),
            Point::new(x1, y1),
            Point::new(x0, y1),
        ])
    }

    /// Thin band from (100, 300) up to (300, 100)
    fn diagonal_band() -> Contour {
        Contour::from_polygon(vec![
            Point::new(100, 300),
            Point::new(105, 305),
            Point::new(305, 105),
            Point::new(300, 100),
        ])
    }

    #[test]
    fn test_convex_hull_drops_interior_points() {
        let hull = convex_hull(&[
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(5, 5),
            Point::new(10, 10),
            Point::new(0, 10),
            Point::new(0, 0),
        ]);
        assert_eq!(hull.len(), 4);
        assert!(!hull.contains(&Point::new(5, 5)));
    }

    #[test]
    fn test_convex_hull_small_inputs_deduplicated() {
        let hull = convex_hull(&[Point::new(3, 4), Point::new(3, 4), Point::new(1, 1)]);
        assert_eq!(hull, vec![Point::new(1, 1), Point::new(3, 4)]);
    }

    #[test]
    fn test_min_area_rect_axis_aligned() {
        let corners = min_area_rect(rect(190, 100, 210, 300).points()).unwrap();
        for corner in [
            Point::new(190, 100),
            Point::new(210, 100),
            Point::new(210, 300),
            Point::new(190, 300),
        ] {
            assert!(corners.contains(&corner), "missing {corner}");
        }
    }

    #[test]
    fn test_min_area_rect_empty() {
        assert!(min_area_rect(&[]).is_none());
    }

    #[test]
    fn test_vertical_segment() {
        let centroid = Centroid { x: 200, y: 200, area: 1.0 };
        let line = LineGeometry::from_segment(
            LineSegment::new(Point::new(200, 100), Point::new(200, 300)),
            centroid,
        );
        assert_eq!(line.slope, Slope::Vertical);
        assert_eq!(line.degrees, 90);
        assert!(line.y_intercept.is_none());
    }

    #[test]
    fn test_sign_convention() {
        let centroid = Centroid { x: 0, y: 0, area: 1.0 };
        let leaning_right = LineGeometry::from_segment(
            LineSegment::new(Point::new(0, 10), Point::new(10, 0)),
            centroid,
        );
        assert_eq!(leaning_right.degrees, 45);

        let leaning_left = LineGeometry::from_segment(
            LineSegment::new(Point::new(0, 0), Point::new(10, 10)),
            centroid,
        );
        assert_eq!(leaning_left.degrees, -45);
    }

    #[test]
    fn test_y_intercept_through_centroid() {
        let centroid = Centroid { x: 10, y: 30, area: 1.0 };
        let line = LineGeometry::from_segment(
            LineSegment::new(Point::new(0, 0), Point::new(1, 2)),
            centroid,
        );
        assert_eq!(line.slope, Slope::Finite(2.0));
        assert_eq!(line.y_intercept, Some(10.0));
    }

    #[test]
    fn test_bounding_box_vertical_bar() {
        let segment = BoundingBoxEstimator.forward_segment(&rect(190, 100, 210, 300)).unwrap();
        assert_eq!(segment.delta_x(), 0);
        assert_eq!(segment.delta_y().abs(), 200);
    }

    #[test]
    fn test_bounding_box_square_prefers_vertical_edge() {
        let segment = BoundingBoxEstimator.forward_segment(&rect(0, 0, 10, 10)).unwrap();
        assert_eq!(segment.delta_x(), 0);
    }

    #[test]
    fn test_bounding_box_horizontal_bar() {
        let segment = BoundingBoxEstimator.forward_segment(&rect(0, 0, 100, 10)).unwrap();
        assert_eq!(segment.delta_y(), 0);
    }

    #[test]
    fn test_bounding_box_diagonal() {
        let contour = diagonal_band();
        let segment = BoundingBoxEstimator.forward_segment(&contour).unwrap();
        let line = LineGeometry::from_segment(segment, contour.centroid());
        assert_eq!(line.degrees, 45);
    }

    #[test]
    fn test_contour_slope_matches_bounding_box() {
        for contour in [rect(190, 100, 210, 300), diagonal_band()] {
            let a = BoundingBoxEstimator.forward_segment(&contour).unwrap();
            let b = ContourSlopeEstimator.forward_segment(&contour).unwrap();
            let la = LineGeometry::from_segment(a, contour.centroid());
            let lb = LineGeometry::from_segment(b, contour.centroid());
            assert_eq!(la.degrees, lb.degrees);
        }
    }

    #[test]
    fn test_degenerate_contours() {
        let single = Contour::from_polygon(vec![Point::new(5, 5)]);
        assert!(BoundingBoxEstimator.forward_segment(&single).is_none());
        assert!(ContourSlopeEstimator.forward_segment(&single).is_none());

        let empty = Contour::from_polygon(Vec::new());
        assert!(BoundingBoxEstimator.forward_segment(&empty).is_none());
        assert!(ContourSlopeEstimator.forward_segment(&empty).is_none());
    }

    #[test]
    fn test_estimator_kind_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            estimator: EstimatorKind,
        }
        let w: Wrapper = toml::from_str(r#"estimator = "contour_slope""#).unwrap();
        assert_eq!(w.estimator, EstimatorKind::ContourSlope);
        assert_eq!(w.estimator.build().name(), "contour_slope");
        assert_eq!(EstimatorKind::default().build().name(), "bounding_box");
    }
}
