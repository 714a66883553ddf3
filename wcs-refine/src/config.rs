//! Refinement configuration.

use astro_math::ClipAnchor;
use serde::{Deserialize, Serialize};
use skywcs::{min_pairs_for_degree, ImageSize, MAX_FIT_DEGREE};
use std::fs;
use std::path::Path;

use crate::error::RefineError;

/// Parameters for the external star finder, carried so one file configures
/// the whole solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionParams {
    /// Expected stellar FWHM in pixels
    pub fwhm_estimate: f64,
    /// Smallest FWHM accepted as a star
    pub fwhm_min: f64,
    /// Detection threshold in sigma above background
    pub find_threshold: f64,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            fwhm_estimate: 1.7,
            fwhm_min: 1.5,
            find_threshold: 3.0,
        }
    }
}

/// Configuration for [`crate::WcsRefiner`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineConfig {
    pub detection: DetectionParams,
    /// Fewest detections worth attempting a solve with
    pub min_star_count: usize,
    /// Maximum catalog stars requested per footprint
    pub gaia_request_count: usize,
    /// Faintest catalog G magnitude requested (exclusive)
    pub gaia_mag_limit: f64,
    /// Largest detected-to-catalog separation accepted in the first match
    pub max_sep_px: f64,
    /// Restrict the first match to a square window of this half-extent
    pub match_window_px: Option<f64>,
    /// Outlier threshold in standard deviations of the residual magnitudes
    pub gwcs_refine_max_stdev: f64,
    /// Where the outlier threshold is measured from
    pub clip_anchor: ClipAnchor,
    /// Degree of the edge-tolerant intermediate fit
    pub low_fit_degree: usize,
    /// Degree of the final fit
    pub fit_degree: usize,
    /// Pixel window whose footprint is queried, independent of the image size
    pub query_window: ImageSize,
    /// Outward padding of the query footprint in pixels
    pub query_border_px: f64,
    /// Upper bound on fit / re-match / reject passes
    pub refine_iterations: usize,
    /// Stop iterating once the residual spread improves by less than this
    /// fraction
    pub min_stdev_improvement: f64,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            detection: DetectionParams::default(),
            min_star_count: 20,
            gaia_request_count: 1000,
            gaia_mag_limit: 17.0,
            max_sep_px: 25.0,
            match_window_px: None,
            gwcs_refine_max_stdev: 2.0,
            clip_anchor: ClipAnchor::Mean,
            low_fit_degree: 2,
            fit_degree: 3,
            query_window: ImageSize::from_width_height(2048, 2048),
            query_border_px: 50.0,
            refine_iterations: 1,
            min_stdev_improvement: 0.01,
        }
    }
}

impl RefineConfig {
    pub fn validate(&self) -> Result<(), RefineError> {
        let invalid = |msg: String| Err(RefineError::InvalidConfig(msg));

        for (name, degree) in [
            ("low_fit_degree", self.low_fit_degree),
            ("fit_degree", self.fit_degree),
        ] {
            if degree == 0 || degree > MAX_FIT_DEGREE {
                return invalid(format!("{name} must be in 1..={MAX_FIT_DEGREE}, got {degree}"));
            }
        }
        if !(self.max_sep_px > 0.0) {
            return invalid(format!("max_sep_px must be positive, got {}", self.max_sep_px));
        }
        if let Some(window) = self.match_window_px {
            if !(window > 0.0) {
                return invalid(format!("match_window_px must be positive, got {window}"));
            }
        }
        if !(self.gwcs_refine_max_stdev > 0.0 && self.gwcs_refine_max_stdev.is_finite()) {
            return invalid(format!(
                "gwcs_refine_max_stdev must be positive, got {}",
                self.gwcs_refine_max_stdev
            ));
        }
        if !self.gaia_mag_limit.is_finite() {
            return invalid("gaia_mag_limit must be finite".to_string());
        }
        if self.gaia_request_count == 0 {
            return invalid("gaia_request_count must be at least 1".to_string());
        }
        if self.query_window.is_empty() {
            return invalid(format!("query_window {} is empty", self.query_window));
        }
        if !(self.query_border_px >= 0.0 && self.query_border_px.is_finite()) {
            return invalid(format!(
                "query_border_px must be non-negative, got {}",
                self.query_border_px
            ));
        }
        if self.refine_iterations == 0 {
            return invalid("refine_iterations must be at least 1".to_string());
        }
        if !(self.min_stdev_improvement >= 0.0) {
            return invalid(format!(
                "min_stdev_improvement must be non-negative, got {}",
                self.min_stdev_improvement
            ));
        }
        Ok(())
    }

    /// Fewest correspondences the configured fits can work with.
    pub fn min_correspondences(&self) -> usize {
        min_pairs_for_degree(self.low_fit_degree.max(self.fit_degree))
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, RefineError> {
        let contents =
            fs::read_to_string(path.as_ref()).map_err(|e| RefineError::File(e.to_string()))?;
        let config: Self =
            serde_json::from_str(&contents).map_err(|e| RefineError::File(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), RefineError> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| RefineError::File(e.to_string()))?;
        fs::write(path.as_ref(), json).map_err(|e| RefineError::File(e.to_string()))
    }
}
