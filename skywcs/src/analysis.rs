//! Field geometry and distortion diagnostics.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::image_size::ImageSize;
use crate::model::WcsModel;
use crate::sphere::SkyCoord;
use crate::tan::TanWcs;

/// Displacement between a model and its linear approximation at one pixel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistortionSample {
    pub x: f64,
    pub y: f64,
    /// Where the linear model places the sky position the full model assigns
    /// to `(x, y)`, minus `(x, y)`
    pub dx: f64,
    pub dy: f64,
}

impl DistortionSample {
    pub fn magnitude(&self) -> f64 {
        self.dx.hypot(self.dy)
    }
}

fn linspace(end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => (0..count)
            .map(|i| end * i as f64 / (count - 1) as f64)
            .collect(),
    }
}

/// Sample the distortion of `model` relative to `linear` on a
/// `nx × ny` grid spanning the frame, row by row.
pub fn distortion_grid(
    model: &dyn WcsModel,
    linear: &TanWcs,
    size: ImageSize,
    nx: usize,
    ny: usize,
) -> Vec<DistortionSample> {
    let xs = linspace(size.width.saturating_sub(1) as f64, nx);
    let ys = linspace(size.height.saturating_sub(1) as f64, ny);

    let mut samples = Vec::with_capacity(nx * ny);
    for &y in &ys {
        for &x in &xs {
            let pixel = Vector2::new(x, y);
            let sky = model.unproject(&pixel);
            let (dx, dy) = match linear.project(&sky) {
                Some(p) => (p.x - x, p.y - y),
                None => (f64::NAN, f64::NAN),
            };
            samples.push(DistortionSample { x, y, dx, dy });
        }
    }
    samples
}

/// Angular distance in degrees between pixel (0, 0) and `(width, height)`.
pub fn field_of_view_deg(model: &dyn WcsModel, size: ImageSize) -> f64 {
    let origin = model.unproject(&Vector2::zeros());
    let far = model.unproject(&Vector2::new(size.width as f64, size.height as f64));
    origin.separation_deg(&far)
}

/// Sky position of the frame center.
pub fn center_sky(model: &dyn WcsModel, size: ImageSize) -> SkyCoord {
    model.unproject(&size.center())
}
