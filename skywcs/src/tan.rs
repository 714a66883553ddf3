//! Gnomonic (TAN) projection and the linear TAN WCS.

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

use crate::model::WcsModel;
use crate::sphere::SkyCoord;

/// Project onto the plane tangent at `center`.
///
/// Returns standard coordinates `(ξ, η)` in degrees, ξ toward increasing RA
/// and η toward the north pole, or `None` for points 90° or more from the
/// tangent point.
pub fn gnomonic_project(sky: &SkyCoord, center: &SkyCoord) -> Option<(f64, f64)> {
    let (ra, dec) = (sky.ra.to_radians(), sky.dec.to_radians());
    let (ra0, dec0) = (center.ra.to_radians(), center.dec.to_radians());
    let d_ra = ra - ra0;

    let cos_c = dec0.sin() * dec.sin() + dec0.cos() * dec.cos() * d_ra.cos();
    if cos_c <= 1e-12 {
        return None;
    }

    let xi = dec.cos() * d_ra.sin() / cos_c;
    let eta = (dec0.cos() * dec.sin() - dec0.sin() * dec.cos() * d_ra.cos()) / cos_c;
    Some((xi.to_degrees(), eta.to_degrees()))
}

/// Inverse of [`gnomonic_project`].
pub fn gnomonic_deproject(xi_deg: f64, eta_deg: f64, center: &SkyCoord) -> SkyCoord {
    let (xi, eta) = (xi_deg.to_radians(), eta_deg.to_radians());
    let (ra0, dec0) = (center.ra.to_radians(), center.dec.to_radians());

    let denom = dec0.cos() - eta * dec0.sin();
    let ra = ra0 + xi.atan2(denom);
    let dec = (dec0.sin() + eta * dec0.cos()).atan2((xi * xi + denom * denom).sqrt());
    SkyCoord::new(ra.to_degrees(), dec.to_degrees())
}

/// Linear TAN WCS.
///
/// `cd` maps pixel offsets from `crpix` to standard coordinates in degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TanWcs {
    /// Tangent point on the sky
    pub crval: SkyCoord,
    /// Zero-based pixel that maps to `crval`
    pub crpix: Vector2<f64>,
    /// Degrees per pixel, `[[CD1_1, CD1_2], [CD2_1, CD2_2]]`
    pub cd: Matrix2<f64>,
}

impl TanWcs {
    pub fn new(crval: SkyCoord, crpix: Vector2<f64>, cd: Matrix2<f64>) -> Self {
        Self { crval, crpix, cd }
    }

    /// Build from a nominal pointing.
    ///
    /// `rotation_deg` is the position angle of the +y pixel axis, east of
    /// north. With `rotation_deg = 0` and `mirrored = false` north is +y and
    /// east is -x, the usual sky-view orientation.
    pub fn from_pointing(
        center: SkyCoord,
        crpix: Vector2<f64>,
        scale_arcsec: f64,
        rotation_deg: f64,
        mirrored: bool,
    ) -> Self {
        let s = scale_arcsec / 3600.0;
        let (sin, cos) = rotation_deg.to_radians().sin_cos();
        let parity = if mirrored { 1.0 } else { -1.0 };
        // columns are the sky directions of the +x and +y pixel axes
        let cd = Matrix2::new(parity * s * cos, s * sin, -parity * s * sin, s * cos);
        Self::new(center, crpix, cd)
    }

    pub fn determinant(&self) -> f64 {
        self.cd.determinant()
    }

    /// Mean pixel scale in arcseconds per pixel.
    pub fn pixel_scale_arcsec(&self) -> f64 {
        self.determinant().abs().sqrt() * 3600.0
    }

    /// Position angle of the +y pixel axis, degrees east of north.
    pub fn rotation_deg(&self) -> f64 {
        self.cd[(0, 1)].atan2(self.cd[(1, 1)]).to_degrees()
    }

    pub fn cd_inverse(&self) -> Option<Matrix2<f64>> {
        if self.determinant().abs() < 1e-300 {
            return None;
        }
        self.cd.try_inverse()
    }

    /// Standard coordinates (degrees) of a pixel.
    pub fn pixel_to_standard(&self, pixel: &Vector2<f64>) -> (f64, f64) {
        let iwc = self.cd * (pixel - self.crpix);
        (iwc.x, iwc.y)
    }
}

impl WcsModel for TanWcs {
    fn project(&self, sky: &SkyCoord) -> Option<Vector2<f64>> {
        let (xi, eta) = gnomonic_project(sky, &self.crval)?;
        let inverse = self.cd_inverse()?;
        Some(self.crpix + inverse * Vector2::new(xi, eta))
    }

    fn unproject(&self, pixel: &Vector2<f64>) -> SkyCoord {
        let (xi, eta) = self.pixel_to_standard(pixel);
        gnomonic_deproject(xi, eta, &self.crval)
    }

    fn degree(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn test_wcs() -> TanWcs {
        TanWcs::from_pointing(
            SkyCoord::new(150.0, 30.0),
            Vector2::new(1024.0, 1024.0),
            1.0,
            0.0,
            false,
        )
    }

    #[test]
    fn test_crpix_maps_to_crval() {
        let wcs = test_wcs();
        let sky = wcs.unproject(&wcs.crpix);
        assert_relative_eq!(sky.ra, 150.0, epsilon = 1e-12);
        assert_relative_eq!(sky.dec, 30.0, epsilon = 1e-12);
    }

    #[test]
    fn test_orientation() {
        let wcs = test_wcs();
        // +y is north
        let north = wcs.unproject(&Vector2::new(1024.0, 1124.0));
        assert!(north.dec > 30.0);
        // -x is east (increasing RA)
        let east = wcs.unproject(&Vector2::new(924.0, 1024.0));
        assert!(east.ra > 150.0);
        assert_relative_eq!(wcs.pixel_scale_arcsec(), 1.0, epsilon = 1e-12);
    }

    #[rstest]
    #[case(0.0, 0.0)]
    #[case(10.0, 0.0)]
    #[case(150.0, 30.0)]
    #[case(359.8, -60.0)]
    #[case(45.0, 89.5)]
    fn test_round_trip(#[case] ra: f64, #[case] dec: f64) {
        let wcs = TanWcs::from_pointing(
            SkyCoord::new(ra, dec),
            Vector2::new(500.0, 400.0),
            2.5,
            33.0,
            false,
        );
        for &(x, y) in &[(0.0, 0.0), (1000.0, 800.0), (250.5, 731.25), (-40.0, 900.0)] {
            let pixel = Vector2::new(x, y);
            let back = wcs.project(&wcs.unproject(&pixel)).unwrap();
            assert_relative_eq!(back.x, x, epsilon = 1e-7);
            assert_relative_eq!(back.y, y, epsilon = 1e-7);
        }
    }

    #[test]
    fn test_gnomonic_far_side_is_none() {
        let center = SkyCoord::new(0.0, 0.0);
        assert!(gnomonic_project(&SkyCoord::new(180.0, 0.0), &center).is_none());
        assert!(gnomonic_project(&SkyCoord::new(90.0, 0.0), &center).is_none());
        assert!(gnomonic_project(&SkyCoord::new(89.0, 0.0), &center).is_some());
    }

    #[test]
    fn test_rotation_recovered() {
        let wcs = TanWcs::from_pointing(
            SkyCoord::new(10.0, 10.0),
            Vector2::zeros(),
            1.0,
            25.0,
            false,
        );
        assert_relative_eq!(wcs.rotation_deg(), 25.0, epsilon = 1e-9);
    }

    #[test]
    fn test_singular_cd_cannot_project() {
        let wcs = TanWcs::new(SkyCoord::new(0.0, 0.0), Vector2::zeros(), Matrix2::zeros());
        assert!(wcs.project(&SkyCoord::new(0.0, 0.0)).is_none());
    }
}
