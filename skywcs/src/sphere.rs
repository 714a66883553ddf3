//! Celestial positions and spherical geometry.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Equatorial position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyCoord {
    /// Right ascension in degrees, `[0, 360)`
    pub ra: f64,
    /// Declination in degrees, `[-90, 90]`
    pub dec: f64,
}

impl SkyCoord {
    /// Build a position, wrapping RA into `[0, 360)`.
    pub fn new(ra: f64, dec: f64) -> Self {
        Self {
            ra: wrap_ra(ra),
            dec,
        }
    }

    pub fn to_unit_vector(&self) -> Vector3<f64> {
        let (ra, dec) = (self.ra.to_radians(), self.dec.to_radians());
        Vector3::new(dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin())
    }

    /// Inverse of [`SkyCoord::to_unit_vector`]; the vector need not be normalised.
    pub fn from_unit_vector(v: &Vector3<f64>) -> Self {
        let dec = v.z.atan2((v.x * v.x + v.y * v.y).sqrt());
        let ra = v.y.atan2(v.x);
        Self::new(ra.to_degrees(), dec.to_degrees())
    }

    /// Great-circle separation in degrees.
    pub fn separation_deg(&self, other: &SkyCoord) -> f64 {
        let a = self.to_unit_vector();
        let b = other.to_unit_vector();
        a.cross(&b).norm().atan2(a.dot(&b)).to_degrees()
    }

    pub fn separation_arcsec(&self, other: &SkyCoord) -> f64 {
        self.separation_deg(other) * 3600.0
    }

    pub fn is_finite(&self) -> bool {
        self.ra.is_finite() && self.dec.is_finite()
    }
}

impl fmt::Display for SkyCoord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({:.6}°, {:+.6}°)", self.ra, self.dec)
    }
}

/// Wrap an angle in degrees into `[0, 360)`.
pub fn wrap_ra(ra: f64) -> f64 {
    let wrapped = ra.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Normalised vector mean of a set of positions, `None` if empty or if the
/// directions cancel.
pub fn mean_direction(points: &[SkyCoord]) -> Option<SkyCoord> {
    let sum = points
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + p.to_unit_vector());
    if points.is_empty() || sum.norm() < 1e-12 {
        return None;
    }
    Some(SkyCoord::from_unit_vector(&sum))
}
