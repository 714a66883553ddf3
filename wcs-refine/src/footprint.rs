//! Catalog stars inside an image footprint.

use log::info;
use skycatalog::{CatalogError, CatalogSource, CatalogStar, SkyPolygon};
use skywcs::{ImageSize, WcsModel};

/// Sky polygon of `window`'s corners pushed out by `border` pixels.
pub fn footprint_polygon(
    wcs: &dyn WcsModel,
    window: ImageSize,
    border: f64,
) -> Result<SkyPolygon, CatalogError> {
    SkyPolygon::new(wcs.unproject_all(&window.corners_with_border(border)))
}

/// Up to `max_count` catalog stars brighter than `mag_limit` inside the
/// footprint, brightest first. An empty result is returned as is.
pub fn query_footprint<C: CatalogSource + ?Sized>(
    wcs: &dyn WcsModel,
    window: ImageSize,
    border: f64,
    max_count: usize,
    mag_limit: f64,
    catalog: &C,
) -> Result<Vec<CatalogStar>, CatalogError> {
    let polygon = footprint_polygon(wcs, window, border)?;
    info!(
        "querying catalog around {} (radius {:.4}°, G < {}, top {})",
        polygon.center(),
        polygon.radius_deg(),
        mag_limit,
        max_count
    );
    catalog.query_polygon(&polygon, mag_limit, max_count)
}
