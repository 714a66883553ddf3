//! Image dimensions and pixel-frame geometry

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width and height of an image or query window in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    /// Image width in pixels
    pub width: usize,
    /// Image height in pixels
    pub height: usize,
}

impl ImageSize {
    pub fn from_width_height(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Geometric center in zero-based pixel coordinates.
    pub fn center(&self) -> Vector2<f64> {
        Vector2::new(self.width as f64 / 2.0, self.height as f64 / 2.0)
    }

    /// The four frame corners pushed outward by `border` pixels, walking
    /// (0,0) → (0,h) → (w,h) → (w,0).
    pub fn corners_with_border(&self, border: f64) -> [Vector2<f64>; 4] {
        let w = self.width as f64;
        let h = self.height as f64;
        [
            Vector2::new(-border, -border),
            Vector2::new(-border, h + border),
            Vector2::new(w + border, h + border),
            Vector2::new(w + border, -border),
        ]
    }

    /// True if the point lies inside `[0, w) × [0, h)`.
    pub fn contains(&self, point: &Vector2<f64>) -> bool {
        point.x >= 0.0
            && point.y >= 0.0
            && point.x < self.width as f64
            && point.y < self.height as f64
    }

    pub fn to_tuple(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}

impl From<(usize, usize)> for ImageSize {
    fn from(dimensions: (usize, usize)) -> Self {
        Self::from_width_height(dimensions.0, dimensions.1)
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
