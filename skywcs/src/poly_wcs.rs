//! Gnomonic projection with polynomial distortion.
//!
//! The forward direction maps a pixel to standard coordinates through a
//! pair of bivariate polynomials in normalised pixel offsets:
//!
//! ```text
//! u = (x - crpix.x) / pixel_norm        ξ = sky_norm · Fξ(u, v)
//! v = (y - crpix.y) / pixel_norm        η = sky_norm · Fη(u, v)
//! ```
//!
//! and then deprojects `(ξ, η)` about `crval`. The reverse direction starts
//! from a fitted inverse polynomial pair and polishes the estimate with a
//! few Newton steps on the forward polynomials, so `project` and
//! `unproject` agree to well below a millipixel inside the fitted region.

use astro_math::Polynomial2;
use log::trace;
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

use crate::model::WcsModel;
use crate::sphere::SkyCoord;
use crate::tan::{gnomonic_deproject, gnomonic_project, TanWcs};

const NEWTON_MAX_STEPS: usize = 12;
const NEWTON_TOLERANCE: f64 = 1e-13;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolyWcs {
    crval: SkyCoord,
    crpix: Vector2<f64>,
    pixel_norm: f64,
    sky_norm: f64,
    forward: (Polynomial2, Polynomial2),
    inverse: (Polynomial2, Polynomial2),
}

impl PolyWcs {
    pub(crate) fn from_parts(
        crval: SkyCoord,
        crpix: Vector2<f64>,
        pixel_norm: f64,
        sky_norm: f64,
        forward: (Polynomial2, Polynomial2),
        inverse: (Polynomial2, Polynomial2),
    ) -> Self {
        Self {
            crval,
            crpix,
            pixel_norm,
            sky_norm,
            forward,
            inverse,
        }
    }

    /// Tangent point of the projection.
    pub fn crval(&self) -> SkyCoord {
        self.crval
    }

    /// Pixel origin of the distortion polynomials (not in general the pixel
    /// that maps to `crval`; see [`PolyWcs::linear_approximation`]).
    pub fn crpix(&self) -> Vector2<f64> {
        self.crpix
    }

    pub fn pixel_norm(&self) -> f64 {
        self.pixel_norm
    }

    pub fn sky_norm(&self) -> f64 {
        self.sky_norm
    }

    /// Forward polynomials `(Fξ, Fη)` in normalised units.
    pub fn forward(&self) -> (&Polynomial2, &Polynomial2) {
        (&self.forward.0, &self.forward.1)
    }

    fn normalised(&self, pixel: &Vector2<f64>) -> (f64, f64) {
        let offset = (pixel - self.crpix) / self.pixel_norm;
        (offset.x, offset.y)
    }

    /// Standard coordinates (degrees) of a pixel.
    pub fn pixel_to_standard(&self, pixel: &Vector2<f64>) -> (f64, f64) {
        let (u, v) = self.normalised(pixel);
        (
            self.sky_norm * self.forward.0.eval(u, v),
            self.sky_norm * self.forward.1.eval(u, v),
        )
    }

    /// Pixel whose standard coordinates are `(xi, eta)` degrees.
    pub fn standard_to_pixel(&self, xi: f64, eta: f64) -> Option<Vector2<f64>> {
        let a = xi / self.sky_norm;
        let b = eta / self.sky_norm;
        let mut u = self.inverse.0.eval(a, b);
        let mut v = self.inverse.1.eval(a, b);

        for step in 0..NEWTON_MAX_STEPS {
            let residual = Vector2::new(
                self.forward.0.eval(u, v) - a,
                self.forward.1.eval(u, v) - b,
            );
            let (dxu, dxv) = self.forward.0.gradient(u, v);
            let (dyu, dyv) = self.forward.1.gradient(u, v);
            let Some(jacobian_inv) = Matrix2::new(dxu, dxv, dyu, dyv).try_inverse() else {
                break;
            };
            let delta = jacobian_inv * residual;
            u -= delta.x;
            v -= delta.y;
            if delta.norm() < NEWTON_TOLERANCE {
                trace!("newton converged after {} steps", step + 1);
                break;
            }
        }

        let pixel = self.crpix + Vector2::new(u, v) * self.pixel_norm;
        (pixel.x.is_finite() && pixel.y.is_finite()).then_some(pixel)
    }

    /// The linear part of the model as a TAN WCS: `crpix` is the pixel that
    /// maps to `crval` and `cd` is the local Jacobian there.
    pub fn linear_approximation(&self) -> Option<TanWcs> {
        let crpix = self.standard_to_pixel(0.0, 0.0)?;
        let (u, v) = self.normalised(&crpix);
        let (dxu, dxv) = self.forward.0.gradient(u, v);
        let (dyu, dyv) = self.forward.1.gradient(u, v);
        let scale = self.sky_norm / self.pixel_norm;
        let cd = Matrix2::new(dxu, dxv, dyu, dyv) * scale;
        Some(TanWcs::new(self.crval, crpix, cd))
    }
}

impl WcsModel for PolyWcs {
    fn project(&self, sky: &SkyCoord) -> Option<Vector2<f64>> {
        let (xi, eta) = gnomonic_project(sky, &self.crval)?;
        self.standard_to_pixel(xi, eta)
    }

    fn unproject(&self, pixel: &Vector2<f64>) -> SkyCoord {
        let (xi, eta) = self.pixel_to_standard(pixel);
        gnomonic_deproject(xi, eta, &self.crval)
    }

    fn degree(&self) -> usize {
        self.forward.0.degree()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn linear_poly(c0: f64, cu: f64, cv: f64) -> Polynomial2 {
        Polynomial2::new(1, vec![c0, cu, cv]).unwrap()
    }

    /// A PolyWcs that is exactly the TAN model `tan`.
    fn poly_from_tan(tan: &TanWcs) -> PolyWcs {
        let norm = 1000.0;
        let sky_norm = 1.0;
        let cd = tan.cd * norm / sky_norm;
        let inv = cd.try_inverse().unwrap();
        PolyWcs::from_parts(
            tan.crval,
            tan.crpix,
            norm,
            sky_norm,
            (
                linear_poly(0.0, cd[(0, 0)], cd[(0, 1)]),
                linear_poly(0.0, cd[(1, 0)], cd[(1, 1)]),
            ),
            (
                linear_poly(0.0, inv[(0, 0)], inv[(0, 1)]),
                linear_poly(0.0, inv[(1, 0)], inv[(1, 1)]),
            ),
        )
    }

    #[test]
    fn test_linear_poly_matches_tan() {
        let tan = TanWcs::from_pointing(
            SkyCoord::new(80.0, -20.0),
            Vector2::new(1000.0, 1000.0),
            1.5,
            12.0,
            false,
        );
        let poly = poly_from_tan(&tan);
        for &(x, y) in &[(0.0, 0.0), (2000.0, 1500.0), (1234.5, 87.25)] {
            let pixel = Vector2::new(x, y);
            let a = tan.unproject(&pixel);
            let b = poly.unproject(&pixel);
            assert!(a.separation_arcsec(&b) < 1e-9);
            let back = poly.project(&b).unwrap();
            assert_relative_eq!(back.x, x, epsilon = 1e-8);
            assert_relative_eq!(back.y, y, epsilon = 1e-8);
        }
        assert_eq!(poly.degree(), 1);
    }

    #[test]
    fn test_linear_approximation_recovers_tan() {
        let tan = TanWcs::from_pointing(
            SkyCoord::new(200.0, 45.0),
            Vector2::new(512.0, 300.0),
            0.8,
            -40.0,
            true,
        );
        let linear = poly_from_tan(&tan).linear_approximation().unwrap();
        assert_relative_eq!(linear.crpix.x, 512.0, epsilon = 1e-8);
        assert_relative_eq!(linear.crpix.y, 300.0, epsilon = 1e-8);
        assert_relative_eq!(linear.cd, tan.cd, epsilon = 1e-15);
    }

    #[test]
    fn test_newton_corrects_crude_inverse() {
        // Forward has a quadratic term the inverse ignores
        let forward_x = Polynomial2::new(2, vec![0.0, 1.0, 0.0, 0.02, 0.0, 0.01]).unwrap();
        let forward_y = Polynomial2::new(2, vec![0.0, 0.0, 1.0, 0.0, 0.03, 0.0]).unwrap();
        let poly = PolyWcs::from_parts(
            SkyCoord::new(10.0, 10.0),
            Vector2::new(100.0, 100.0),
            100.0,
            0.01,
            (forward_x, forward_y),
            (linear_poly(0.0, 1.0, 0.0), linear_poly(0.0, 0.0, 1.0)),
        );
        for &(x, y) in &[(0.0, 0.0), (200.0, 200.0), (150.0, 20.0)] {
            let pixel = Vector2::new(x, y);
            let back = poly.project(&poly.unproject(&pixel)).unwrap();
            assert_relative_eq!(back.x, x, epsilon = 1e-8);
            assert_relative_eq!(back.y, y, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_serde_round_trip() {
        let tan = TanWcs::from_pointing(
            SkyCoord::new(1.0, 2.0),
            Vector2::new(10.0, 20.0),
            1.0,
            0.0,
            false,
        );
        let poly = poly_from_tan(&tan);
        let json = serde_json::to_string(&poly).unwrap();
        let back: PolyWcs = serde_json::from_str(&json).unwrap();
        assert_eq!(poly, back);
    }
}
