//! Detected star table handed over by the external star finder.

use astro_math::Locatable2d;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::nullable::nan_f64;

/// A detected star with position, brightness and shape diagnostics.
///
/// Shape fields the finder did not report are NaN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectedStar {
    /// Rank by peak brightness within one solve, 0 = brightest
    pub id: usize,
    /// X position (sub-pixel, zero-based)
    pub x: f64,
    /// Y position (sub-pixel, zero-based)
    pub y: f64,
    #[serde(with = "nan_f64")]
    pub fwhm: f64,
    #[serde(with = "nan_f64")]
    pub sharpness: f64,
    #[serde(with = "nan_f64")]
    pub roundness: f64,
    /// Position angle of the major axis in degrees
    #[serde(with = "nan_f64")]
    pub pa: f64,
    /// Local sky background
    #[serde(with = "nan_f64")]
    pub sky: f64,
    /// Peak value above background
    pub peak: f64,
    /// Total flux
    pub flux: f64,
    /// Instrumental magnitude, `-2.5 log10(flux)`
    #[serde(with = "nan_f64")]
    pub mag: f64,
}

impl DetectedStar {
    /// A detection with position and brightness only.
    pub fn new(x: f64, y: f64, peak: f64, flux: f64) -> Self {
        Self {
            id: 0,
            x,
            y,
            fwhm: f64::NAN,
            sharpness: f64::NAN,
            roundness: f64::NAN,
            pa: f64::NAN,
            sky: f64::NAN,
            peak,
            flux,
            mag: if flux > 0.0 {
                -2.5 * flux.log10()
            } else {
                f64::NAN
            },
        }
    }

    pub fn with_shape(mut self, fwhm: f64, sharpness: f64, roundness: f64) -> Self {
        self.fwhm = fwhm;
        self.sharpness = sharpness;
        self.roundness = roundness;
        self
    }

    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }
}

impl Locatable2d for DetectedStar {
    fn x(&self) -> f64 {
        self.x
    }

    fn y(&self) -> f64 {
        self.y
    }
}

/// Detections of one image ordered by descending peak.
///
/// The order is fixed at construction and carried through to the
/// provenance table; rows are only ever selected by index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StarTable {
    stars: Vec<DetectedStar>,
}

impl StarTable {
    /// Sort by descending peak (stable, NaN peaks last) and assign ids by rank.
    pub fn from_detections(mut stars: Vec<DetectedStar>) -> Self {
        stars.sort_by(|a, b| {
            let a = if a.peak.is_nan() { f64::NEG_INFINITY } else { a.peak };
            let b = if b.peak.is_nan() { f64::NEG_INFINITY } else { b.peak };
            b.total_cmp(&a)
        });
        for (rank, star) in stars.iter_mut().enumerate() {
            star.id = rank;
        }
        Self { stars }
    }

    pub fn len(&self) -> usize {
        self.stars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stars.is_empty()
    }

    pub fn stars(&self) -> &[DetectedStar] {
        &self.stars
    }

    pub fn get(&self, index: usize) -> Option<&DetectedStar> {
        self.stars.get(index)
    }

    pub fn positions(&self) -> Vec<Vector2<f64>> {
        self.stars.iter().map(DetectedStar::position).collect()
    }

    /// Parallel x and y coordinate arrays.
    pub fn xy(&self) -> (Vec<f64>, Vec<f64>) {
        self.stars.iter().map(|s| (s.x, s.y)).unzip()
    }
}
