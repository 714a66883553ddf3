//! World coordinate systems for refined astrometry.
//!
//! Two model families implement [`WcsModel`]:
//!
//! - [`TanWcs`]: linear gnomonic model, the shape a blind solver hands back
//! - [`PolyWcs`]: gnomonic projection about a tangent point with polynomial
//!   distortion, produced by [`fit_wcs`] from matched pixel/sky pairs
//!
//! Pixel coordinates are zero-based throughout. FITS header export in
//! [`header`] converts to the one-based FITS convention.

pub mod analysis;
pub mod fit;
pub mod header;
pub mod image_size;
pub mod model;
pub mod poly_wcs;
pub mod sip;
pub mod sphere;
pub mod tan;

pub use analysis::{center_sky, distortion_grid, field_of_view_deg, DistortionSample};
pub use fit::{
    fit_wcs, min_pairs_for_degree, projection_residuals, WcsFitError, MAX_FIT_DEGREE,
};
pub use header::{
    header_block, parse_header, remove_wcs_keywords, HeaderCard, HeaderError, HeaderValue,
};
pub use image_size::ImageSize;
pub use model::WcsModel;
pub use poly_wcs::PolyWcs;
pub use sip::{SipError, SipWcs};
pub use sphere::SkyCoord;
pub use tan::TanWcs;
