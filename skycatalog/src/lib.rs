//! Reference star catalogs for astrometric refinement.
//!
//! A [`CatalogSource`] answers footprint queries: every star inside a sky
//! polygon brighter than a magnitude limit, brightest first, truncated to a
//! maximum count. Two sources are provided:
//!
//! - [`GaiaCatalog`]: ADQL queries against a TAP service, run as
//!   asynchronous UWS jobs and waited on with a [`WaitPolicy`]
//! - [`StaticCatalog`]: an in-memory table for offline use and tests

pub mod error;
pub mod job;
pub mod polygon;
pub mod source;
pub mod star;
pub mod tap;

pub use error::CatalogError;
pub use job::{wait_for_completion, CancelToken, JobPhase, WaitError, WaitPolicy};
pub use polygon::SkyPolygon;
pub use source::{CatalogSource, StaticCatalog};
pub use star::CatalogStar;
pub use tap::{
    parse_tap_json, GaiaCatalog, HttpTapService, TapService, GAIA_SOURCE_TABLE, GAIA_TAP_URL,
};
