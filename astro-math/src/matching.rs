//! Point correspondence via nearest-neighbor matching.
//!
//! Pairs every detected point with the closest candidate point (for example a
//! catalog star projected into pixel space). The result is kept in-band, one
//! entry per detected point in input order:
//!
//! - a usable pairing stores the candidate index and the pixel distance
//! - a point with no candidate stores [`UNMATCHED_INDEX`] and a NaN residual
//! - points that claim the same candidate all keep that index but get a NaN
//!   residual, so none of them can be used downstream
//!
//! [`MatchSet::get`] exposes the same information as a [`Correspondence`] so
//! callers never have to interpret the sentinels themselves.

use std::collections::HashMap;

use log::debug;
use nalgebra::Vector2;

/// Index stored for a detected point that found no candidate.
pub const UNMATCHED_INDEX: usize = usize::MAX;

/// Trait for objects that can be located in a 2D Cartesian coordinate system.
pub trait Locatable2d {
    /// Returns the x-coordinate of the object.
    fn x(&self) -> f64;

    /// Returns the y-coordinate of the object.
    fn y(&self) -> f64;
}

impl Locatable2d for Vector2<f64> {
    fn x(&self) -> f64 {
        self.x
    }

    fn y(&self) -> f64 {
        self.y
    }
}

impl Locatable2d for (f64, f64) {
    fn x(&self) -> f64 {
        self.0
    }

    fn y(&self) -> f64 {
        self.1
    }
}

/// Outcome for a single detected point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correspondence {
    /// Unique nearest candidate and its distance.
    Matched { index: usize, residual: f64 },
    /// Nearest candidate is shared with at least one other detected point.
    Ambiguous { index: usize },
    /// No candidate was found (empty candidate set or nothing in the window).
    Unmatched,
}

impl Correspondence {
    /// Candidate index and residual if this pairing may be used with the given
    /// separation limit.
    pub fn usable_within(&self, max_separation: f64) -> Option<(usize, f64)> {
        match *self {
            Correspondence::Matched { index, residual } if residual < max_separation => {
                Some((index, residual))
            }
            _ => None,
        }
    }
}

/// Search options for [`match_points`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MatchOptions {
    /// Only consider candidates inside a square window of this half-extent
    /// around the detected point. `None` searches all candidates.
    pub window_px: Option<f64>,

    /// Skip the candidate with the same index as the detected point. Used when
    /// a point set is matched against itself.
    pub exclude_self: bool,
}

/// In-band match result: parallel index and residual arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchSet {
    /// Candidate index per detected point, [`UNMATCHED_INDEX`] if none.
    pub indices: Vec<usize>,
    /// Distance to the candidate, NaN if unmatched or ambiguous.
    pub residuals: Vec<f64>,
}

impl MatchSet {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Tagged view of entry `i`.
    ///
    /// # Panics
    /// If `i` is out of range.
    pub fn get(&self, i: usize) -> Correspondence {
        let index = self.indices[i];
        let residual = self.residuals[i];
        if index == UNMATCHED_INDEX {
            Correspondence::Unmatched
        } else if residual.is_finite() {
            Correspondence::Matched { index, residual }
        } else {
            Correspondence::Ambiguous { index }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Correspondence> + '_ {
        (0..self.len()).map(|i| self.get(i))
    }

    /// All pairings with a finite residual below `max_separation`, as
    /// `(detected_idx, candidate_idx, residual)` in detected order.
    pub fn accepted(&self, max_separation: f64) -> Vec<(usize, usize, f64)> {
        self.iter()
            .enumerate()
            .filter_map(|(i, c)| {
                c.usable_within(max_separation)
                    .map(|(index, residual)| (i, index, residual))
            })
            .collect()
    }

    pub fn ambiguous_count(&self) -> usize {
        self.iter()
            .filter(|c| matches!(c, Correspondence::Ambiguous { .. }))
            .count()
    }

    pub fn unmatched_count(&self) -> usize {
        self.indices
            .iter()
            .filter(|&&idx| idx == UNMATCHED_INDEX)
            .count()
    }
}

/// Finds the closest candidate for each detected point using brute-force search.
///
/// Ties resolve to the lowest candidate index, so candidate order (e.g. catalog
/// brightness order) is significant. Candidates with non-finite coordinates are
/// never selected.
///
/// Time complexity: O(n × m) where n = detected points, m = candidates.
// TODO: accelerate with a KD-tree for catalogs beyond a few thousand entries
pub fn match_points<D, C>(detected: &[D], candidates: &[C], options: &MatchOptions) -> MatchSet
where
    D: Locatable2d,
    C: Locatable2d,
{
    let mut indices = Vec::with_capacity(detected.len());
    let mut residuals = Vec::with_capacity(detected.len());

    for (i, point) in detected.iter().enumerate() {
        let (px, py) = (point.x(), point.y());
        let mut best: Option<(usize, f64)> = None;

        for (j, candidate) in candidates.iter().enumerate() {
            if options.exclude_self && i == j {
                continue;
            }

            let dx = candidate.x() - px;
            let dy = candidate.y() - py;

            if let Some(half_extent) = options.window_px {
                if !(dx.abs() <= half_extent && dy.abs() <= half_extent) {
                    continue;
                }
            }

            let dist = dx.hypot(dy);
            if !dist.is_finite() {
                continue;
            }

            if best.map_or(true, |(_, min_dist)| dist < min_dist) {
                best = Some((j, dist));
            }
        }

        match best {
            Some((j, dist)) => {
                indices.push(j);
                residuals.push(dist);
            }
            None => {
                indices.push(UNMATCHED_INDEX);
                residuals.push(f64::NAN);
            }
        }
    }

    let ambiguous = reject_duplicates(&indices, &mut residuals);
    if ambiguous > 0 {
        debug!("{ambiguous} detected points share a candidate and were disqualified");
    }

    MatchSet { indices, residuals }
}

/// Overwrites the residual of every point whose candidate is claimed more than
/// once with NaN. Returns the number of disqualified points.
fn reject_duplicates(indices: &[usize], residuals: &mut [f64]) -> usize {
    let mut claims: HashMap<usize, usize> = HashMap::new();
    for &idx in indices.iter().filter(|&&idx| idx != UNMATCHED_INDEX) {
        *claims.entry(idx).or_insert(0) += 1;
    }

    let mut disqualified = 0;
    for (idx, residual) in indices.iter().zip(residuals.iter_mut()) {
        if claims.get(idx).copied().unwrap_or(0) > 1 {
            *residual = f64::NAN;
            disqualified += 1;
        }
    }
    disqualified
}
