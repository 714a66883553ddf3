//! Star-to-catalog matching and WCS refinement.
//!
//! Given the detected stars of an image, a [`CoarseSolver`] and a catalog,
//! [`WcsRefiner`] produces a distortion-aware [`skywcs::PolyWcs`] and a
//! provenance table of the correspondences it was fitted on. See
//! [`controller`] for the pipeline stages.

pub mod batch;
pub mod config;
pub mod controller;
pub mod error;
pub mod footprint;
mod nullable;
pub mod nova;
pub mod provenance;
pub mod solver;
pub mod stars;
pub mod synthetic;

pub use batch::{refine_batch, BatchItem, BatchOutcome};
pub use config::{DetectionParams, RefineConfig};
pub use controller::{MatchSummary, PassStats, RefineState, Refinement, WcsRefiner};
pub use error::RefineError;
pub use footprint::{footprint_polygon, query_footprint};
pub use nova::{
    HttpNovaService, NovaService, NovaSettings, NovaSolver, PositionHint, ScaleHint, SourceList,
    NOVA_URL,
};
pub use provenance::{ProvenanceRow, ProvenanceTable};
pub use solver::{parse_sexagesimal, CoarseSolver, PointingHintSolver, SolverError};
pub use stars::{DetectedStar, StarTable};
pub use synthetic::{HeldOutStar, RadialDistortionWcs, SyntheticField, SyntheticFieldConfig};
