//! TAN-SIP form of a polynomial WCS.
//!
//! SIP (Shupe et al. 2005) writes the distortion as pixel-space polynomials
//! about the reference pixel:
//!
//! ```text
//! (U, V) = (s + A(s, t), t + B(s, t))        s, t = pixel - CRPIX
//! (ξ, η) = CD · (U, V)
//! ```
//!
//! with `A`, `B` carrying only terms of order 2 and above, plus an
//! approximate inverse `(s, t) = (U + AP(U, V), V + BP(U, V))`.

use astro_math::{fit_polynomial_pair, FitError, Polynomial2};
use log::debug;
use nalgebra::Vector2;
use thiserror::Error;

use crate::image_size::ImageSize;
use crate::model::WcsModel;
use crate::poly_wcs::PolyWcs;
use crate::sphere::SkyCoord;
use crate::tan::{gnomonic_deproject, gnomonic_project, TanWcs};

/// Samples per axis used to fit the inverse polynomials.
const INVERSE_GRID: usize = 24;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SipError {
    #[error("model has no invertible linear part at its tangent point")]
    NoLinearSolution,

    #[error("inverse polynomial fit failed: {0}")]
    InverseFit(#[from] FitError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SipWcs {
    /// Linear part; `crpix` is zero-based
    pub linear: TanWcs,
    pub a: Polynomial2,
    pub b: Polynomial2,
    pub ap: Polynomial2,
    pub bp: Polynomial2,
}

impl SipWcs {
    /// Re-express `model` in SIP form. The inverse polynomials are fitted
    /// one order higher than the forward ones over the frame `size`.
    pub fn from_poly(model: &PolyWcs, size: ImageSize) -> Result<Self, SipError> {
        let linear = model
            .linear_approximation()
            .ok_or(SipError::NoLinearSolution)?;
        let cd_inv = linear.cd_inverse().ok_or(SipError::NoLinearSolution)?;

        let pixel_norm = model.pixel_norm();
        let shift = (linear.crpix - model.crpix()) / pixel_norm;
        let (fx, fy) = model.forward();
        let qx = fx
            .substitute(1.0 / pixel_norm, shift.x, shift.y)
            .scaled(model.sky_norm());
        let qy = fy
            .substitute(1.0 / pixel_norm, shift.x, shift.y)
            .scaled(model.sky_norm());

        let degree = model.degree();
        let distortion = |row: usize| {
            Polynomial2::from_fn(degree, |p, q| {
                if p + q < 2 {
                    0.0
                } else {
                    cd_inv[(row, 0)] * qx.coeff(p, q) + cd_inv[(row, 1)] * qy.coeff(p, q)
                }
            })
        };
        let a = distortion(0);
        let b = distortion(1);

        let (ap, bp) = fit_inverse(&a, &b, &linear.crpix, size, degree + 1)?;
        debug!("converted degree {} model to SIP", degree);
        Ok(Self {
            linear,
            a,
            b,
            ap,
            bp,
        })
    }
}

fn fit_inverse(
    a: &Polynomial2,
    b: &Polynomial2,
    crpix: &Vector2<f64>,
    size: ImageSize,
    degree: usize,
) -> Result<(Polynomial2, Polynomial2), FitError> {
    let scale = size.width.max(size.height).max(1) as f64;
    let step = |extent: usize| extent as f64 / (INVERSE_GRID - 1) as f64;
    let (step_x, step_y) = (step(size.width), step(size.height));

    let n = INVERSE_GRID * INVERSE_GRID;
    let mut u = Vec::with_capacity(n);
    let mut v = Vec::with_capacity(n);
    let mut du = Vec::with_capacity(n);
    let mut dv = Vec::with_capacity(n);
    for i in 0..INVERSE_GRID {
        for j in 0..INVERSE_GRID {
            let s = i as f64 * step_x - crpix.x;
            let t = j as f64 * step_y - crpix.y;
            let big_u = s + a.eval(s, t);
            let big_v = t + b.eval(s, t);
            u.push(big_u / scale);
            v.push(big_v / scale);
            du.push(s - big_u);
            dv.push(t - big_v);
        }
    }

    let (px, py) = fit_polynomial_pair(&u, &v, &du, &dv, degree)?;
    Ok((
        px.substitute(1.0 / scale, 0.0, 0.0),
        py.substitute(1.0 / scale, 0.0, 0.0),
    ))
}

impl WcsModel for SipWcs {
    fn project(&self, sky: &SkyCoord) -> Option<Vector2<f64>> {
        let (xi, eta) = gnomonic_project(sky, &self.linear.crval)?;
        let uv = self.linear.cd_inverse()? * Vector2::new(xi, eta);
        let s = uv.x + self.ap.eval(uv.x, uv.y);
        let t = uv.y + self.bp.eval(uv.x, uv.y);
        Some(self.linear.crpix + Vector2::new(s, t))
    }

    fn unproject(&self, pixel: &Vector2<f64>) -> SkyCoord {
        let d = pixel - self.linear.crpix;
        let uv = Vector2::new(d.x + self.a.eval(d.x, d.y), d.y + self.b.eval(d.x, d.y));
        let iwc = self.linear.cd * uv;
        gnomonic_deproject(iwc.x, iwc.y, &self.linear.crval)
    }

    fn degree(&self) -> usize {
        self.a.degree()
    }
}
