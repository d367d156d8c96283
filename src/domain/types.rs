//! Shared types for the line follower

use chrono::{DateTime, Utc};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Integer pixel coordinate (x grows right, y grows down)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    #[inline]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<Point> for imageproc::point::Point<i32> {
    fn from(p: Point) -> Self {
        imageproc::point::Point::new(p.x, p.y)
    }
}

impl From<imageproc::point::Point<i32>> for Point {
    fn from(p: imageproc::point::Point<i32>) -> Self {
        Point::new(p.x, p.y)
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Centroid and area of a detected region
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Centroid {
    pub x: i32,
    pub y: i32,
    pub area: f64,
}

/// Closed polygon outline of a color-matched region, plus its centroid
#[derive(Debug, Clone)]
pub struct Contour {
    points: Vec<Point>,
    centroid: Centroid,
}

impl Contour {
    /// Contour whose centroid was measured by the provider (e.g. pixel moments)
    pub fn new(points: Vec<Point>, centroid: Centroid) -> Self {
        Self { points, centroid }
    }

    /// Contour whose centroid is derived from the polygon itself
    ///
    /// Uses the shoelace moments; degenerate (zero-area) polygons fall back
    /// to the mean of their vertices.
    pub fn from_polygon(points: Vec<Point>) -> Self {
        let centroid = polygon_centroid(&points);
        Self { points, centroid }
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn centroid(&self) -> Centroid {
        self.centroid
    }

    pub fn area(&self) -> f64 {
        self.centroid.area
    }
}

fn polygon_centroid(points: &[Point]) -> Centroid {
    if points.is_empty() {
        return Centroid { x: 0, y: 0, area: 0.0 };
    }

    let n = points.len();
    let mut twice_area = 0.0f64;
    let mut cx = 0.0f64;
    let mut cy = 0.0f64;
    for i in 0..n {
        let p = points[i];
        let q = points[(i + 1) % n];
        let cross = p.x as f64 * q.y as f64 - q.x as f64 * p.y as f64;
        twice_area += cross;
        cx += (p.x + q.x) as f64 * cross;
        cy += (p.y + q.y) as f64 * cross;
    }

    if twice_area.abs() < f64::EPSILON {
        let sx: f64 = points.iter().map(|p| p.x as f64).sum();
        let sy: f64 = points.iter().map(|p| p.y as f64).sum();
        return Centroid {
            x: (sx / n as f64).round() as i32,
            y: (sy / n as f64).round() as i32,
            area: 0.0,
        };
    }

    Centroid {
        x: (cx / (3.0 * twice_area)).round() as i32,
        y: (cy / (3.0 * twice_area)).round() as i32,
        area: twice_area.abs() / 2.0,
    }
}

/// Camera frame with BGR pixel accessors over an RGB buffer
#[derive(Clone)]
pub struct Frame {
    image: RgbImage,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame").field("width", &self.width()).field("height", &self.height()).finish()
    }
}

#[inline]
fn bgr_to_rgb([b, g, r]: [u8; 3]) -> Rgb<u8> {
    Rgb([r, g, b])
}

impl Frame {
    /// Frame filled with a single BGR color
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        Self { image: RgbImage::from_pixel(width, height, bgr_to_rgb(bgr)) }
    }

    /// Frame whose BGR pixels are produced by `f(x, y)`
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> [u8; 3]) -> Self {
        Self { image: RgbImage::from_fn(width, height, |x, y| bgr_to_rgb(f(x, y))) }
    }

    pub fn from_image(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn as_image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let Rgb([r, g, b]) = *self.image.get_pixel(x, y);
        [b, g, r]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: u32, y: u32, bgr: [u8; 3]) {
        self.image.put_pixel(x, y, bgr_to_rgb(bgr));
    }

    /// Nearest-neighbour resize to `width`, preserving the aspect ratio
    pub fn resize_to_width(&self, width: u32) -> Frame {
        if width == self.width() || width == 0 || self.is_empty() {
            return self.clone();
        }
        let height = ((self.height() as u64 * width as u64) / self.width() as u64).max(1) as u32;
        Self { image: imageops::resize(&self.image, width, height, FilterType::Nearest) }
    }

    /// Mirror top-to-bottom (flip around the x axis)
    pub fn flip_vertical(&self) -> Frame {
        Self { image: imageops::flip_vertical(&self.image) }
    }

    /// Mirror left-to-right (flip around the y axis)
    pub fn flip_horizontal(&self) -> Frame {
        Self { image: imageops::flip_horizontal(&self.image) }
    }

    /// Copy of the frame with every row outside `[top, bottom]` blacked out
    pub fn mask_rows(&self, top: i32, bottom: i32) -> Frame {
        let mut image = self.image.clone();
        for (_, y, pixel) in image.enumerate_pixels_mut() {
            let y = y as i32;
            if y < top || y > bottom {
                *pixel = Rgb([0, 0, 0]);
            }
        }
        Self { image }
    }
}

/// Tri-state feedback derived from the focus-band centroid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    Centered,
    OffCenter,
    Absent,
}

impl Alignment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Alignment::Centered => "centered",
            Alignment::OffCenter => "off_center",
            Alignment::Absent => "absent",
        }
    }
}

/// Position fields computed from a frame, before a sequence id is stamped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionUpdate {
    pub in_focus: bool,
    pub mid_offset: i32,
    pub degrees: Option<i32>,
    pub mid_line_cross: i32,
    pub frame_width: i32,
    pub middle_increment: i32,
}

impl PositionUpdate {
    /// "No signal" values published before any frame has been processed
    pub const NO_SIGNAL: PositionUpdate = PositionUpdate {
        in_focus: false,
        mid_offset: -1,
        degrees: Some(-1),
        mid_line_cross: -1,
        frame_width: -1,
        middle_increment: -1,
    };
}

/// One immutable published position record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub id: i64,
    pub in_focus: bool,
    pub mid_offset: i32,
    pub degrees: Option<i32>,
    pub mid_line_cross: i32,
    #[serde(rename = "width")]
    pub frame_width: i32,
    #[serde(rename = "middle_inc")]
    pub middle_increment: i32,
}

impl PositionSnapshot {
    pub fn stamp(id: i64, update: PositionUpdate) -> Self {
        Self {
            id,
            in_focus: update.in_focus,
            mid_offset: update.mid_offset,
            degrees: update.degrees,
            mid_line_cross: update.mid_line_cross,
            frame_width: update.frame_width,
            middle_increment: update.middle_increment,
        }
    }
}

/// Client description sent with every request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub info: String,
}

/// Reply to `registerClient`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub info: String,
}

/// One connected position subscriber
#[derive(Debug, Clone, Serialize)]
pub struct ClientSession {
    pub id: Uuid,
    pub peer: String,
    pub info: String,
    pub connected_since: DateTime<Utc>,
}

impl ClientSession {
    pub fn new(peer: &str, client: &ClientInfo) -> Self {
        Self {
            id: Uuid::now_v7(),
            peer: peer.to_string(),
            info: client.info.clone(),
            connected_since: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polygon_centroid_rectangle() {
        let contour = Contour::from_polygon(vec![
            Point::new(190, 100),
            Point::new(210, 100),
            Point::new(210, 300),
            Point::new(190, 300),
        ]);
        let c = contour.centroid();
        assert_eq!((c.x, c.y), (200, 200));
        assert_eq!(contour.area(), 4000.0);
    }

    #[test]
    fn test_polygon_centroid_degenerate_falls_back_to_mean() {
        let contour = Contour::from_polygon(vec![Point::new(0, 0), Point::new(10, 10)]);
        let c = contour.centroid();
        assert_eq!((c.x, c.y), (5, 5));
        assert_eq!(c.area, 0.0);
    }

    #[test]
    fn test_resize_preserves_aspect_ratio() {
        let frame = Frame::filled(800, 600, [1, 2, 3]);
        let resized = frame.resize_to_width(400);
        assert_eq!((resized.width(), resized.height()), (400, 300));
        assert_eq!(resized.pixel(399, 299), [1, 2, 3]);
    }

    #[test]
    fn test_flips() {
        let frame = Frame::from_fn(3, 2, |x, y| [x as u8, y as u8, 0]);
        assert_eq!(frame.flip_vertical().pixel(0, 0), [0, 1, 0]);
        assert_eq!(frame.flip_horizontal().pixel(0, 0), [2, 0, 0]);
    }

    #[test]
    fn test_pixel_accessors_are_bgr() {
        let mut frame = Frame::filled(2, 2, [0, 0, 255]);
        assert_eq!(frame.as_image().get_pixel(0, 0), &Rgb([255, 0, 0]));
        frame.set_pixel(1, 1, [10, 20, 30]);
        assert_eq!(frame.pixel(1, 1), [10, 20, 30]);
        assert!(Frame::filled(0, 0, [0, 0, 0]).is_empty());
    }

    #[test]
    fn test_mask_rows_blacks_out_outside_band() {
        let frame = Frame::filled(4, 10, [9, 9, 9]);
        let masked = frame.mask_rows(3, 5);
        assert_eq!(masked.pixel(0, 2), [0, 0, 0]);
        assert_eq!(masked.pixel(0, 3), [9, 9, 9]);
        assert_eq!(masked.pixel(0, 5), [9, 9, 9]);
        assert_eq!(masked.pixel(0, 6), [0, 0, 0]);
    }

    #[test]
    fn test_snapshot_wire_field_names() {
        let snapshot = PositionSnapshot::stamp(0, PositionUpdate::NO_SIGNAL);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(
            json,
            r#"{"id":0,"in_focus":false,"mid_offset":-1,"degrees":-1,"mid_line_cross":-1,"width":-1,"middle_inc":-1}"#
        );
    }

    #[test]
    fn test_snapshot_without_line_serializes_null_degrees() {
        let update = PositionUpdate { degrees: None, ..PositionUpdate::NO_SIGNAL };
        let json = serde_json::to_string(&PositionSnapshot::stamp(3, update)).unwrap();
        assert!(json.contains(r#""degrees":null"#));
    }
}
