use skycatalog::CatalogError;
use skywcs::WcsFitError;
use thiserror::Error;

use crate::controller::RefineState;
use crate::solver::SolverError;

/// Errors that abort the refinement of one image.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("insufficient stars: need {required}, detected {got}")]
    InsufficientDetections { required: usize, got: usize },

    #[error("coarse solve found no solution: {0}")]
    NoCoarseSolution(String),

    #[error("coarse solver failed: {0}")]
    SolverService(SolverError),

    #[error("catalog query failed: {0}")]
    CatalogService(#[from] CatalogError),

    #[error("no catalog stars in the image footprint")]
    EmptyCatalogFootprint,

    #[error("insufficient correspondences while {state}: need {required}, have {got}")]
    InsufficientCorrespondences {
        state: RefineState,
        required: usize,
        got: usize,
    },

    #[error("WCS fit failed while {state}: {source}")]
    Fit {
        state: RefineState,
        source: WcsFitError,
    },

    #[error("refinement cancelled while {0}")]
    Cancelled(RefineState),

    #[error("file error: {0}")]
    File(String),
}

impl RefineError {
    /// Pipeline state the failure occurred in.
    ///
    /// Configuration problems are found on entry and report `Detecting`;
    /// file errors happen outside a solve and report `Failed`.
    pub fn state(&self) -> RefineState {
        match self {
            RefineError::InvalidConfig(_) | RefineError::InsufficientDetections { .. } => {
                RefineState::Detecting
            }
            RefineError::NoCoarseSolution(_) | RefineError::SolverService(_) => {
                RefineState::CoarseSolving
            }
            RefineError::CatalogService(_) | RefineError::EmptyCatalogFootprint => {
                RefineState::CatalogFetching
            }
            RefineError::InsufficientCorrespondences { state, .. }
            | RefineError::Fit { state, .. }
            | RefineError::Cancelled(state) => *state,
            RefineError::File(_) => RefineState::Failed,
        }
    }

    pub(crate) fn from_fit(state: RefineState, error: WcsFitError) -> Self {
        match error {
            WcsFitError::InsufficientCorrespondences { required, got } => {
                RefineError::InsufficientCorrespondences {
                    state,
                    required,
                    got,
                }
            }
            source => RefineError::Fit { state, source },
        }
    }
}

impl From<SolverError> for RefineError {
    fn from(error: SolverError) -> Self {
        match error {
            SolverError::NoSolution(reason) => RefineError::NoCoarseSolution(reason),
            SolverError::Cancelled => RefineError::Cancelled(RefineState::CoarseSolving),
            other => RefineError::SolverService(other),
        }
    }
}
