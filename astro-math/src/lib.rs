//! Numeric building blocks shared by the astrometric refinement crates.
//!
//! - [`matching`]: nearest-neighbour correspondence with ambiguity rejection
//! - [`poly`]: bivariate polynomial least squares
//! - [`stats`]: residual statistics and single-pass sigma clipping

pub mod matching;
pub mod poly;
pub mod stats;

pub use matching::{
    match_points, Correspondence, Locatable2d, MatchOptions, MatchSet, UNMATCHED_INDEX,
};
pub use poly::{
    fit_polynomial, fit_polynomial_pair, term_count, term_index, terms, FitError, Polynomial2,
};
pub use stats::{mean, population_std, sigma_clip, ClipAnchor, ClipResult};
