//! Residual statistics and single-pass sigma clipping.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    Array1::from_vec(values.to_vec()).mean()
}

/// Population standard deviation (ddof = 0), `None` for an empty slice.
pub fn population_std(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(Array1::from_vec(values.to_vec()).std(0.0))
}

/// Reference point the clip threshold is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipAnchor {
    /// Keep values below `mean + k·σ`.
    #[default]
    Mean,
    /// Keep values below `k·σ`.
    Zero,
}

/// Outcome of [`sigma_clip`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClipResult {
    /// One flag per input value, `true` if the value survives.
    pub keep: Vec<bool>,
    /// Mean of the finite input values.
    pub mean: f64,
    /// Population standard deviation of the finite input values.
    pub std: f64,
    /// Values must be strictly below this to survive.
    pub threshold: f64,
}

impl ClipResult {
    pub fn kept_count(&self) -> usize {
        self.keep.iter().filter(|&&k| k).count()
    }

    pub fn rejected_count(&self) -> usize {
        self.keep.len() - self.kept_count()
    }

    /// Values that survived, in input order.
    pub fn kept<'a>(&'a self, values: &'a [f64]) -> impl Iterator<Item = f64> + 'a {
        values
            .iter()
            .zip(&self.keep)
            .filter(|(_, keep)| **keep)
            .map(|(value, _)| *value)
    }
}

/// Single-pass upper-tail clip of non-negative residual magnitudes.
///
/// Non-finite values are always rejected and do not contribute to the
/// statistics. When the spread is zero nothing is rejected.
///
/// With [`ClipAnchor::Mean`] and `k >= 1` every removed value lies at least one
/// standard deviation above the mean, so the surviving population's standard
/// deviation never exceeds the input's.
pub fn sigma_clip(values: &[f64], k: f64, anchor: ClipAnchor) -> ClipResult {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let mean_value = mean(&finite).unwrap_or(f64::NAN);
    let std = population_std(&finite).unwrap_or(f64::NAN);

    let threshold = match anchor {
        ClipAnchor::Mean => mean_value + k * std,
        ClipAnchor::Zero => k * std,
    };

    let no_spread = !(std > 0.0);
    let keep = values
        .iter()
        .map(|v| v.is_finite() && (no_spread || *v < threshold))
        .collect();

    ClipResult {
        keep,
        mean: mean_value,
        std,
        threshold,
    }
}
