//! Refinement state machine.
//!
//! One [`WcsRefiner`] solves one image at a time:
//!
//! ```text
//! Detecting → CoarseSolving → CatalogFetching → Matching
//!     → FittingLow → ReMatching → OutlierRejecting → FittingHigh → Done
//! ```
//!
//! with `Failed` reachable from every state. The fit / re-match / reject
//! passes repeat up to `refine_iterations` times and stop early when nothing
//! is rejected or the residual spread stops improving. Nothing is returned
//! unless `Done` is reached.

use astro_math::{match_points, population_std, sigma_clip, MatchOptions};
use log::{debug, info, warn};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use skycatalog::{CancelToken, CatalogSource, CatalogStar};
use skywcs::{
    fit_wcs, min_pairs_for_degree, projection_residuals, ImageSize, PolyWcs, SkyCoord, TanWcs,
    WcsModel,
};
use std::fmt;

use crate::config::RefineConfig;
use crate::error::RefineError;
use crate::footprint::query_footprint;
use crate::provenance::{ProvenanceRow, ProvenanceTable};
use crate::solver::CoarseSolver;
use crate::stars::StarTable;

/// Refinement pipeline states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefineState {
    /// Checking the detected star table
    Detecting,
    /// Waiting on the external coarse solver
    CoarseSolving,
    /// Querying reference stars in the coarse footprint
    CatalogFetching,
    /// Pairing detections with catalog stars projected through the coarse WCS
    Matching,
    /// Edge-tolerant low-degree fit
    FittingLow,
    /// Re-projecting the matched catalog stars through the low-degree fit
    ReMatching,
    /// Dropping pairs with outlying residuals
    OutlierRejecting,
    /// Final fit on the surviving pairs
    FittingHigh,
    Done,
    Failed,
}

impl RefineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RefineState::Done | RefineState::Failed)
    }
}

impl fmt::Display for RefineState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            RefineState::Detecting => "detecting",
            RefineState::CoarseSolving => "coarse solving",
            RefineState::CatalogFetching => "fetching catalog",
            RefineState::Matching => "matching",
            RefineState::FittingLow => "fitting low order",
            RefineState::ReMatching => "re-matching",
            RefineState::OutlierRejecting => "rejecting outliers",
            RefineState::FittingHigh => "fitting high order",
            RefineState::Done => "done",
            RefineState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Counts from the first match against the coarse WCS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub detected: usize,
    pub catalog: usize,
    /// Detections sharing their nearest catalog star with another detection
    pub ambiguous: usize,
    /// Detections with no catalog star in reach
    pub unmatched: usize,
    /// Unique pairs closer than `max_sep_px`
    pub accepted: usize,
}

/// Residual statistics of one fit / re-match / reject pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PassStats {
    /// Pairs entering the pass
    pub pairs: usize,
    pub residual_mean_px: f64,
    pub residual_std_px: f64,
    /// Residuals at or above this were rejected
    pub threshold_px: f64,
    /// Pairs surviving the pass
    pub kept: usize,
    /// Spread of the surviving residuals
    pub kept_std_px: f64,
}

/// Result of a successful refinement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refinement {
    /// Final high-order model
    pub wcs: PolyWcs,
    /// Solution the refinement started from
    pub coarse: TanWcs,
    pub provenance: ProvenanceTable,
    /// Catalog stars returned for the footprint
    pub catalog_count: usize,
    pub first_match: MatchSummary,
    pub passes: Vec<PassStats>,
}

#[derive(Debug, Clone, Copy)]
struct Pair {
    detected: usize,
    catalog: usize,
}

fn pair_positions(
    pairs: &[Pair],
    pixels: &[Vector2<f64>],
    sky: &[SkyCoord],
) -> (Vec<Vector2<f64>>, Vec<SkyCoord>) {
    pairs
        .iter()
        .map(|p| (pixels[p.detected], sky[p.catalog]))
        .unzip()
}

/// Refines the WCS of one image at a time.
pub struct WcsRefiner<S, C> {
    config: RefineConfig,
    solver: S,
    catalog: C,
    cancel: CancelToken,
    state: RefineState,
    history: Vec<RefineState>,
}

impl<S: CoarseSolver, C: CatalogSource> WcsRefiner<S, C> {
    pub fn new(config: RefineConfig, solver: S, catalog: C) -> Self {
        Self {
            config,
            solver,
            catalog,
            cancel: CancelToken::new(),
            state: RefineState::Detecting,
            history: Vec::new(),
        }
    }

    /// Cancellation is checked on every state transition.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &RefineConfig {
        &self.config
    }

    pub fn state(&self) -> RefineState {
        self.state
    }

    /// States visited by the last call to [`WcsRefiner::refine`].
    pub fn history(&self) -> &[RefineState] {
        &self.history
    }

    fn transition(&mut self, state: RefineState) {
        info!("refinement: {} -> {}", self.state, state);
        self.state = state;
        self.history.push(state);
    }

    fn enter(&mut self, state: RefineState) -> Result<(), RefineError> {
        if self.cancel.is_cancelled() {
            return Err(RefineError::Cancelled(self.state));
        }
        self.transition(state);
        Ok(())
    }

    /// Run the whole pipeline on one image's detections.
    pub fn refine(
        &mut self,
        stars: &StarTable,
        image_size: ImageSize,
    ) -> Result<Refinement, RefineError> {
        self.history.clear();
        match self.run(stars, image_size) {
            Ok(refinement) => {
                self.transition(RefineState::Done);
                Ok(refinement)
            }
            Err(error) => {
                warn!("refinement failed while {}: {}", error.state(), error);
                self.transition(RefineState::Failed);
                Err(error)
            }
        }
    }

    fn run(&mut self, stars: &StarTable, image_size: ImageSize) -> Result<Refinement, RefineError> {
        self.enter(RefineState::Detecting)?;
        self.config.validate()?;
        if stars.len() < self.config.min_star_count {
            return Err(RefineError::InsufficientDetections {
                required: self.config.min_star_count,
                got: stars.len(),
            });
        }
        info!("{} detections in {}", stars.len(), image_size);

        self.enter(RefineState::CoarseSolving)?;
        let (xs, ys) = stars.xy();
        let coarse = self.solver.solve(&xs, &ys, image_size)?;

        self.enter(RefineState::CatalogFetching)?;
        let catalog = query_footprint(
            &coarse,
            self.config.query_window,
            self.config.query_border_px,
            self.config.gaia_request_count,
            self.config.gaia_mag_limit,
            &self.catalog,
        )?;
        if catalog.is_empty() {
            return Err(RefineError::EmptyCatalogFootprint);
        }
        info!("{} catalog stars in footprint", catalog.len());
        let catalog_sky: Vec<SkyCoord> = catalog.iter().map(CatalogStar::position).collect();
        let detected_px = stars.positions();

        self.enter(RefineState::Matching)?;
        let projected = coarse.project_all(&catalog_sky);
        let options = MatchOptions {
            window_px: self.config.match_window_px,
            exclude_self: false,
        };
        let matches = match_points(stars.stars(), &projected, &options);
        let accepted = matches.accepted(self.config.max_sep_px);
        let first_match = MatchSummary {
            detected: stars.len(),
            catalog: catalog.len(),
            ambiguous: matches.ambiguous_count(),
            unmatched: matches.unmatched_count(),
            accepted: accepted.len(),
        };
        info!(
            "matched {} of {} detections within {} px ({} ambiguous, {} unmatched)",
            first_match.accepted,
            first_match.detected,
            self.config.max_sep_px,
            first_match.ambiguous,
            first_match.unmatched
        );
        let mut pairs: Vec<Pair> = accepted
            .iter()
            .map(|&(detected, catalog, _)| Pair { detected, catalog })
            .collect();
        let required = min_pairs_for_degree(self.config.low_fit_degree);
        if pairs.len() < required {
            return Err(RefineError::InsufficientCorrespondences {
                state: RefineState::Matching,
                required,
                got: pairs.len(),
            });
        }

        let mut passes: Vec<PassStats> = Vec::new();
        for pass in 1..=self.config.refine_iterations {
            self.enter(RefineState::FittingLow)?;
            let (pixels, sky) = pair_positions(&pairs, &detected_px, &catalog_sky);
            let low = fit_wcs(&pixels, &sky, self.config.low_fit_degree)
                .map_err(|e| RefineError::from_fit(RefineState::FittingLow, e))?;

            self.enter(RefineState::ReMatching)?;
            let residuals = projection_residuals(&low, &pixels, &sky);

            self.enter(RefineState::OutlierRejecting)?;
            let clip = sigma_clip(
                &residuals,
                self.config.gwcs_refine_max_stdev,
                self.config.clip_anchor,
            );
            let stats = PassStats {
                pairs: pairs.len(),
                residual_mean_px: clip.mean,
                residual_std_px: clip.std,
                threshold_px: clip.threshold,
                kept: clip.kept_count(),
                kept_std_px: population_std(&clip.kept(&residuals).collect::<Vec<_>>())
                    .unwrap_or(f64::NAN),
            };
            info!(
                "pass {}: residual {:.3} ± {:.3} px, rejected {} above {:.3} px",
                pass,
                stats.residual_mean_px,
                stats.residual_std_px,
                clip.rejected_count(),
                stats.threshold_px
            );
            pairs = pairs
                .iter()
                .zip(&clip.keep)
                .filter(|(_, keep)| **keep)
                .map(|(pair, _)| *pair)
                .collect();

            let previous_std = passes.last().map(|p| p.residual_std_px);
            passes.push(stats);
            if clip.rejected_count() == 0 {
                debug!("no outliers left after pass {}", pass);
                break;
            }
            if let Some(previous) = previous_std {
                let improvement = (previous - stats.residual_std_px) / previous;
                if !(improvement >= self.config.min_stdev_improvement) {
                    debug!(
                        "residual spread improved by {:.4} after pass {}, stopping",
                        improvement, pass
                    );
                    break;
                }
            }
        }

        self.enter(RefineState::FittingHigh)?;
        let (pixels, sky) = pair_positions(&pairs, &detected_px, &catalog_sky);
        let wcs = fit_wcs(&pixels, &sky, self.config.fit_degree)
            .map_err(|e| RefineError::from_fit(RefineState::FittingHigh, e))?;

        let residuals = projection_residuals(&wcs, &pixels, &sky);
        let rows = pairs
            .iter()
            .zip(&residuals)
            .filter_map(|(pair, residual)| {
                let star = stars.get(pair.detected)?;
                let reference = catalog.get(pair.catalog)?;
                Some(ProvenanceRow::new(star, reference, *residual))
            })
            .collect();
        let provenance = ProvenanceTable { rows };
        info!(
            "degree {} WCS from {} pairs, rms residual {:.3} px",
            wcs.degree(),
            provenance.len(),
            provenance.rms_residual_px()
        );

        Ok(Refinement {
            wcs,
            coarse,
            provenance,
            catalog_count: catalog.len(),
            first_match,
            passes,
        })
    }
}
