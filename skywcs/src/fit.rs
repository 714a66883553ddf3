//! Fit a distortion-aware WCS to matched pixel/sky pairs.

use astro_math::{fit_polynomial_pair, term_count, FitError};
use log::debug;
use nalgebra::Vector2;
use thiserror::Error;

use crate::model::WcsModel;
use crate::poly_wcs::PolyWcs;
use crate::sphere::{mean_direction, SkyCoord};
use crate::tan::gnomonic_project;

/// Highest polynomial degree [`fit_wcs`] accepts.
pub const MAX_FIT_DEGREE: usize = 7;

/// Errors that can occur while fitting a WCS
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WcsFitError {
    #[error("insufficient correspondences: degree requires {required}, got {got}")]
    InsufficientCorrespondences { required: usize, got: usize },

    #[error("{pixels} pixel positions but {sky} sky positions")]
    LengthMismatch { pixels: usize, sky: usize },

    #[error("unsupported fit degree {0}")]
    InvalidDegree(usize),

    #[error("sky position {0} cannot be projected about the field center")]
    ProjectionFailed(usize),

    #[error("polynomial fit failed: {0}")]
    Fit(#[from] FitError),
}

/// Minimum number of pairs a fit of `degree` needs.
pub fn min_pairs_for_degree(degree: usize) -> usize {
    term_count(degree)
}

/// Fit a [`PolyWcs`] of the given degree.
///
/// The tangent point is the mean direction of the sky positions and the
/// polynomial origin is the pixel centroid. Offsets are normalised to unit
/// range before fitting, which keeps the degree-3 design matrix well
/// conditioned on a full-frame sensor.
pub fn fit_wcs(
    pixels: &[Vector2<f64>],
    sky: &[SkyCoord],
    degree: usize,
) -> Result<PolyWcs, WcsFitError> {
    if degree == 0 || degree > MAX_FIT_DEGREE {
        return Err(WcsFitError::InvalidDegree(degree));
    }
    if pixels.len() != sky.len() {
        return Err(WcsFitError::LengthMismatch {
            pixels: pixels.len(),
            sky: sky.len(),
        });
    }
    let required = min_pairs_for_degree(degree);
    if pixels.len() < required {
        return Err(WcsFitError::InsufficientCorrespondences {
            required,
            got: pixels.len(),
        });
    }

    let crval = mean_direction(sky).ok_or(WcsFitError::ProjectionFailed(0))?;
    let crpix = pixels.iter().fold(Vector2::zeros(), |acc, p| acc + p) / pixels.len() as f64;

    let mut xi = Vec::with_capacity(sky.len());
    let mut eta = Vec::with_capacity(sky.len());
    for (i, s) in sky.iter().enumerate() {
        let (a, b) = gnomonic_project(s, &crval).ok_or(WcsFitError::ProjectionFailed(i))?;
        xi.push(a);
        eta.push(b);
    }

    let pixel_norm = max_abs(pixels.iter().flat_map(|p| {
        let d = p - crpix;
        [d.x, d.y]
    }));
    let sky_norm = max_abs(xi.iter().chain(eta.iter()).copied());

    let u: Vec<f64> = pixels.iter().map(|p| (p.x - crpix.x) / pixel_norm).collect();
    let v: Vec<f64> = pixels.iter().map(|p| (p.y - crpix.y) / pixel_norm).collect();
    let a: Vec<f64> = xi.iter().map(|x| x / sky_norm).collect();
    let b: Vec<f64> = eta.iter().map(|y| y / sky_norm).collect();

    let forward = fit_polynomial_pair(&u, &v, &a, &b, degree).map_err(map_fit_error)?;
    let inverse = fit_polynomial_pair(&a, &b, &u, &v, degree).map_err(map_fit_error)?;

    let model = PolyWcs::from_parts(crval, crpix, pixel_norm, sky_norm, forward, inverse);
    debug!(
        "fitted degree {} WCS from {} pairs about {}",
        degree,
        pixels.len(),
        crval
    );
    Ok(model)
}

fn map_fit_error(error: FitError) -> WcsFitError {
    match error {
        FitError::InsufficientPoints { required, got } => {
            WcsFitError::InsufficientCorrespondences { required, got }
        }
        other => WcsFitError::Fit(other),
    }
}

fn max_abs(values: impl Iterator<Item = f64>) -> f64 {
    let max = values.fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if max > 0.0 && max.is_finite() {
        max
    } else {
        1.0
    }
}

/// Pixel distance between each observed pixel and its sky position projected
/// through `model`. Unprojectable positions yield NaN.
pub fn projection_residuals(
    model: &dyn WcsModel,
    pixels: &[Vector2<f64>],
    sky: &[SkyCoord],
) -> Vec<f64> {
    pixels
        .iter()
        .zip(sky)
        .map(|(pixel, s)| {
            model
                .project(s)
                .map(|projected| (projected - pixel).norm())
                .unwrap_or(f64::NAN)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tan::TanWcs;
    use approx::assert_relative_eq;

    fn grid(n: usize, size: f64) -> Vec<Vector2<f64>> {
        let step = size / (n - 1) as f64;
        (0..n)
            .flat_map(|i| (0..n).map(move |j| Vector2::new(i as f64 * step, j as f64 * step)))
            .collect()
    }

    #[test]
    fn test_fit_recovers_tan() {
        let truth = TanWcs::from_pointing(
            SkyCoord::new(30.0, 60.0),
            Vector2::new(1024.0, 1024.0),
            1.2,
            15.0,
            false,
        );
        let pixels = grid(8, 2048.0);
        let sky = truth.unproject_all(&pixels);
        let fitted = fit_wcs(&pixels, &sky, 1).unwrap();
        for p in grid(5, 2000.0) {
            let a = truth.unproject(&p);
            let b = fitted.unproject(&p);
            // linear fit of a TAN field about a different tangent point
            assert!(a.separation_arcsec(&b) < 1e-3);
        }
    }

    #[test]
    fn test_minimum_pairs() {
        assert_eq!(min_pairs_for_degree(1), 3);
        assert_eq!(min_pairs_for_degree(2), 6);
        assert_eq!(min_pairs_for_degree(3), 10);

        let pixels = grid(3, 100.0);
        let sky: Vec<SkyCoord> = pixels
            .iter()
            .map(|p| SkyCoord::new(10.0 + p.x * 1e-4, 10.0 + p.y * 1e-4))
            .collect();
        assert_eq!(
            fit_wcs(&pixels, &sky, 3),
            Err(WcsFitError::InsufficientCorrespondences {
                required: 10,
                got: 9
            })
        );
    }

    #[test]
    fn test_invalid_inputs() {
        let pixels = grid(4, 100.0);
        let sky = vec![SkyCoord::new(0.0, 0.0); 3];
        assert!(matches!(
            fit_wcs(&pixels, &sky, 1),
            Err(WcsFitError::LengthMismatch { .. })
        ));
        assert_eq!(fit_wcs(&pixels, &sky, 0), Err(WcsFitError::InvalidDegree(0)));
        assert_eq!(fit_wcs(&pixels, &sky, 8), Err(WcsFitError::InvalidDegree(8)));
    }

    #[test]
    fn test_collinear_pixels_rejected() {
        let pixels: Vec<Vector2<f64>> = (0..10).map(|i| Vector2::new(i as f64, 0.0)).collect();
        let sky: Vec<SkyCoord> = (0..10)
            .map(|i| SkyCoord::new(10.0 + i as f64 * 1e-3, 5.0))
            .collect();
        assert!(matches!(
            fit_wcs(&pixels, &sky, 1),
            Err(WcsFitError::Fit(FitError::RankDeficient { .. }))
        ));
    }

    #[test]
    fn test_residuals_zero_for_exact_model() {
        let truth = TanWcs::from_pointing(
            SkyCoord::new(300.0, -10.0),
            Vector2::new(50.0, 50.0),
            2.0,
            0.0,
            false,
        );
        let pixels = grid(4, 100.0);
        let sky = truth.unproject_all(&pixels);
        for r in projection_residuals(&truth, &pixels, &sky) {
            assert_relative_eq!(r, 0.0, epsilon = 1e-8);
        }
    }
}
