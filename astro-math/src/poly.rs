//! Bivariate polynomial least squares.
//!
//! A polynomial of total degree `d` in `(u, v)` has `(d + 1)(d + 2) / 2`
//! coefficients, ordered by total degree and then by decreasing power of `u`:
//!
//! ```text
//! 1, u, v, u², uv, v², u³, u²v, uv², v³, ...
//! ```
//!
//! Fits solve the over-determined Vandermonde system with an SVD, the same way
//! the affine display/sensor calibration does. Callers are expected to
//! normalise their inputs to roughly unit range before fitting higher degrees.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while fitting a polynomial
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("insufficient points: need at least {required}, got {got}")]
    InsufficientPoints { required: usize, got: usize },

    #[error("length mismatch: {inputs} sample positions but {targets} target values")]
    LengthMismatch { inputs: usize, targets: usize },

    #[error("non-finite sample at index {0}")]
    NonFinite(usize),

    #[error("sample positions are degenerate: rank {rank} < {terms} terms")]
    RankDeficient { rank: usize, terms: usize },

    #[error("least-squares solve failed: {0}")]
    SolveFailed(&'static str),
}

/// Number of coefficients of a bivariate polynomial of total degree `degree`.
pub fn term_count(degree: usize) -> usize {
    (degree + 1) * (degree + 2) / 2
}

/// Position of `u^p v^q` in coefficient order.
pub fn term_index(p: usize, q: usize) -> usize {
    let total = p + q;
    total * (total + 1) / 2 + q
}

/// Exponent pairs `(p, q)` of the monomials `u^p v^q` in coefficient order.
pub fn terms(degree: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::with_capacity(term_count(degree));
    for total in 0..=degree {
        for q in 0..=total {
            out.push((total - q, q));
        }
    }
    out
}

fn powers(x: f64, degree: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(degree + 1);
    let mut acc = 1.0;
    for _ in 0..=degree {
        out.push(acc);
        acc *= x;
    }
    out
}

fn binomial(n: usize, k: usize) -> f64 {
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

/// Bivariate polynomial `Σ c_pq u^p v^q`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polynomial2 {
    degree: usize,
    coeffs: Vec<f64>,
}

impl Polynomial2 {
    /// Build from coefficients in [`terms`] order.
    pub fn new(degree: usize, coeffs: Vec<f64>) -> Result<Self, FitError> {
        let expected = term_count(degree);
        if coeffs.len() != expected {
            return Err(FitError::LengthMismatch {
                inputs: expected,
                targets: coeffs.len(),
            });
        }
        Ok(Self { degree, coeffs })
    }

    pub fn zero(degree: usize) -> Self {
        Self {
            degree,
            coeffs: vec![0.0; term_count(degree)],
        }
    }

    /// Build by evaluating `coeff(p, q)` for every term.
    pub fn from_fn(degree: usize, mut coeff: impl FnMut(usize, usize) -> f64) -> Self {
        Self {
            degree,
            coeffs: terms(degree).into_iter().map(|(p, q)| coeff(p, q)).collect(),
        }
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn coeffs(&self) -> &[f64] {
        &self.coeffs
    }

    /// Coefficient of `u^p v^q`, zero if the term is above the degree.
    pub fn coeff(&self, p: usize, q: usize) -> f64 {
        if p + q > self.degree {
            return 0.0;
        }
        self.coeffs[term_index(p, q)]
    }

    /// Multiply every coefficient by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            degree: self.degree,
            coeffs: self.coeffs.iter().map(|c| c * factor).collect(),
        }
    }

    /// Change of variables: returns `Q` with
    /// `Q(s, t) = P(scale·s + shift_u, scale·t + shift_v)`.
    pub fn substitute(&self, scale: f64, shift_u: f64, shift_v: f64) -> Self {
        let mut out = vec![0.0; self.coeffs.len()];
        for (&(p, q), &c) in terms(self.degree).iter().zip(&self.coeffs) {
            if c == 0.0 {
                continue;
            }
            for i in 0..=p {
                let wu = binomial(p, i) * scale.powi(i as i32) * shift_u.powi((p - i) as i32);
                for j in 0..=q {
                    let wv =
                        binomial(q, j) * scale.powi(j as i32) * shift_v.powi((q - j) as i32);
                    out[term_index(i, j)] += c * wu * wv;
                }
            }
        }
        Self {
            degree: self.degree,
            coeffs: out,
        }
    }

    pub fn eval(&self, u: f64, v: f64) -> f64 {
        let up = powers(u, self.degree);
        let vp = powers(v, self.degree);
        terms(self.degree)
            .iter()
            .zip(&self.coeffs)
            .map(|(&(p, q), c)| c * up[p] * vp[q])
            .sum()
    }

    /// Partial derivatives `(∂/∂u, ∂/∂v)`.
    pub fn gradient(&self, u: f64, v: f64) -> (f64, f64) {
        let up = powers(u, self.degree);
        let vp = powers(v, self.degree);
        let mut du = 0.0;
        let mut dv = 0.0;
        for (&(p, q), c) in terms(self.degree).iter().zip(&self.coeffs) {
            if p > 0 {
                du += c * p as f64 * up[p - 1] * vp[q];
            }
            if q > 0 {
                dv += c * q as f64 * up[p] * vp[q - 1];
            }
        }
        (du, dv)
    }
}

/// Fit a single polynomial `target ≈ P(u, v)`.
pub fn fit_polynomial(
    u: &[f64],
    v: &[f64],
    target: &[f64],
    degree: usize,
) -> Result<Polynomial2, FitError> {
    let (px, _) = fit_polynomial_pair(u, v, target, target, degree)?;
    Ok(px)
}

/// Fit two polynomials that share the same sample positions, e.g. both
/// output axes of a 2D mapping. The design matrix is decomposed once.
pub fn fit_polynomial_pair(
    u: &[f64],
    v: &[f64],
    target_x: &[f64],
    target_y: &[f64],
    degree: usize,
) -> Result<(Polynomial2, Polynomial2), FitError> {
    let n = u.len();
    for len in [v.len(), target_x.len(), target_y.len()] {
        if len != n {
            return Err(FitError::LengthMismatch {
                inputs: n,
                targets: len,
            });
        }
    }

    let m = term_count(degree);
    if n < m {
        return Err(FitError::InsufficientPoints {
            required: m,
            got: n,
        });
    }

    for i in 0..n {
        if !(u[i].is_finite() && v[i].is_finite() && target_x[i].is_finite())
            || !target_y[i].is_finite()
        {
            return Err(FitError::NonFinite(i));
        }
    }

    let exponents = terms(degree);
    let mut design = DMatrix::<f64>::zeros(n, m);
    for i in 0..n {
        let up = powers(u[i], degree);
        let vp = powers(v[i], degree);
        for (k, &(p, q)) in exponents.iter().enumerate() {
            design[(i, k)] = up[p] * vp[q];
        }
    }

    // Solve using SVD (robust to ill-conditioned systems)
    let svd = design.svd(true, true);
    let max_sv = svd.singular_values.max();
    let rank = svd.rank(max_sv * 1e-12);
    if rank < m {
        return Err(FitError::RankDeficient { rank, terms: m });
    }

    let bx = DVector::from_column_slice(target_x);
    let by = DVector::from_column_slice(target_y);
    let cx = svd.solve(&bx, 1e-14).map_err(FitError::SolveFailed)?;
    let cy = svd.solve(&by, 1e-14).map_err(FitError::SolveFailed)?;

    Ok((
        Polynomial2::new(degree, cx.iter().copied().collect())?,
        Polynomial2::new(degree, cy.iter().copied().collect())?,
    ))
}
