//! Common interface of pixel ↔ sky transforms.

use nalgebra::Vector2;

use crate::sphere::SkyCoord;

/// A pixel ↔ sky mapping.
///
/// Models are immutable: every fit produces a new instance.
pub trait WcsModel {
    /// Sky position to zero-based pixel coordinates.
    ///
    /// Returns `None` when the position cannot be projected (e.g. it lies on
    /// the far side of the tangent plane).
    fn project(&self, sky: &SkyCoord) -> Option<Vector2<f64>>;

    /// Zero-based pixel coordinates to sky position.
    fn unproject(&self, pixel: &Vector2<f64>) -> SkyCoord;

    /// Polynomial order of the pixel → sky mapping (1 for a linear model).
    fn degree(&self) -> usize;

    /// Project many positions; unprojectable ones become `(NaN, NaN)` so the
    /// output stays index-aligned with the input.
    fn project_all(&self, sky: &[SkyCoord]) -> Vec<Vector2<f64>> {
        sky.iter()
            .map(|s| {
                self.project(s)
                    .unwrap_or_else(|| Vector2::new(f64::NAN, f64::NAN))
            })
            .collect()
    }

    fn unproject_all(&self, pixels: &[Vector2<f64>]) -> Vec<SkyCoord> {
        pixels.iter().map(|p| self.unproject(p)).collect()
    }
}
