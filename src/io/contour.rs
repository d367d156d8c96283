//! Contour extraction
//!
//! `ContourProvider` is the seam the control loop consumes. `ColorContourFinder`
//! thresholds the frame into a binary mask of pixels whose HSV value falls
//! inside a hue window around the target color, labels its 4-connected
//! regions, and reports each region as its convex outline with pixel-moment
//! centroid.

use crate::domain::geometry::convex_hull;
use crate::domain::types::{Centroid, Contour, Frame, Point};
use image::{GrayImage, Luma, Rgb};
use imageproc::map::map_colors;
use imageproc::region_labelling::{connected_components, Connectivity};
use rustc_hash::FxHashMap;

const MASK_ON: Luma<u8> = Luma([255]);
const MASK_OFF: Luma<u8> = Luma([0]);

/// Minimum saturation and value for a pixel to count as colored
const MIN_SATURATION: u8 = 100;
const MIN_VALUE: u8 = 100;

/// Source of the largest color-matched regions of an image
pub trait ContourProvider: Send {
    /// Up to `count` regions of at least `min_pixel_area` pixels, largest first
    fn find_largest_contours(&self, image: &Frame, min_pixel_area: u32, count: usize)
        -> Vec<Contour>;

    fn centroid_of(&self, contour: &Contour) -> Centroid {
        contour.centroid()
    }
}

/// 8-bit HSV with hue in 0..180
pub fn bgr_to_hsv([b, g, r]: [u8; 3]) -> [u8; 3] {
    let (bf, gf, rf) = (b as f64, g as f64, r as f64);
    let max = bf.max(gf).max(rf);
    let min = bf.min(gf).min(rf);
    let diff = max - min;

    let s = if max == 0.0 { 0.0 } else { 255.0 * diff / max };
    let h = if diff == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (gf - bf) / diff
    } else if max == gf {
        120.0 + 60.0 * (bf - rf) / diff
    } else {
        240.0 + 60.0 * (rf - gf) / diff
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    [((h / 2.0).round() as u32 % 180) as u8, s.round() as u8, max as u8]
}

#[derive(Debug, Default)]
struct Region {
    area: u64,
    sum_x: u64,
    sum_y: u64,
    /// Leftmost and rightmost x per row
    rows: FxHashMap<u32, (u32, u32)>,
}

impl Region {
    fn add(&mut self, x: u32, y: u32) {
        self.area += 1;
        self.sum_x += x as u64;
        self.sum_y += y as u64;
        self.rows
            .entry(y)
            .and_modify(|(lo, hi)| {
                *lo = (*lo).min(x);
                *hi = (*hi).max(x);
            })
            .or_insert((x, x));
    }

    fn into_contour(self) -> Contour {
        let mut edge = Vec::with_capacity(self.rows.len() * 2);
        for (&y, &(lo, hi)) in &self.rows {
            edge.push(Point::new(lo as i32, y as i32));
            edge.push(Point::new(hi as i32, y as i32));
        }
        let area = self.area as f64;
        let centroid = Centroid {
            x: (self.sum_x as f64 / area).round() as i32,
            y: (self.sum_y as f64 / area).round() as i32,
            area,
        };
        Contour::new(convex_hull(&edge), centroid)
    }
}

/// HSV window color matcher
#[derive(Debug, Clone)]
pub struct ColorContourFinder {
    target_hue: u8,
    hsv_range: u8,
}

impl ColorContourFinder {
    pub fn new(bgr_color: [u8; 3], hsv_range: u8) -> Self {
        let [target_hue, _, _] = bgr_to_hsv(bgr_color);
        Self { target_hue, hsv_range }
    }

    #[inline]
    fn matches(&self, bgr: [u8; 3]) -> bool {
        let [h, s, v] = bgr_to_hsv(bgr);
        if s < MIN_SATURATION || v < MIN_VALUE {
            return false;
        }
        let d = (h as i32 - self.target_hue as i32).abs();
        d.min(180 - d) <= self.hsv_range as i32
    }
}

impl ColorContourFinder {
    /// Binary mask of color-matched pixels
    pub fn mask(&self, image: &Frame) -> GrayImage {
        map_colors(image.as_image(), |Rgb([r, g, b])| {
            if self.matches([b, g, r]) {
                MASK_ON
            } else {
                MASK_OFF
            }
        })
    }
}

impl ContourProvider for ColorContourFinder {
    fn find_largest_contours(
        &self,
        image: &Frame,
        min_pixel_area: u32,
        count: usize,
    ) -> Vec<Contour> {
        if image.is_empty() || count == 0 {
            return Vec::new();
        }

        let labels = connected_components(&self.mask(image), Connectivity::Four, MASK_OFF);
        let mut regions: FxHashMap<u32, Region> = FxHashMap::default();
        for (x, y, Luma([label])) in labels.enumerate_pixels() {
            if *label != 0 {
                regions.entry(*label).or_default().add(x, y);
            }
        }

        let mut regions: Vec<Region> =
            regions.into_values().filter(|r| r.area >= min_pixel_area as u64).collect();
        regions.sort_by(|a, b| b.area.cmp(&a.area));
        regions.truncate(count);
        regions.into_iter().map(Region::into_contour).collect()
    }
}
