//! The catalog query interface and an in-memory implementation.

use log::debug;
use std::fs;
use std::path::Path;

use crate::error::CatalogError;
use crate::polygon::SkyPolygon;
use crate::star::{sort_by_brightness, CatalogStar};

/// Anything that can answer a footprint query.
pub trait CatalogSource {
    /// Stars inside `polygon` with `g_mag < mag_limit`, brightest first,
    /// at most `max_count` of them. An empty result is not an error.
    fn query_polygon(
        &self,
        polygon: &SkyPolygon,
        mag_limit: f64,
        max_count: usize,
    ) -> Result<Vec<CatalogStar>, CatalogError>;
}

impl<T: CatalogSource + ?Sized> CatalogSource for &T {
    fn query_polygon(
        &self,
        polygon: &SkyPolygon,
        mag_limit: f64,
        max_count: usize,
    ) -> Result<Vec<CatalogStar>, CatalogError> {
        (**self).query_polygon(polygon, mag_limit, max_count)
    }
}

/// A fixed table of stars held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    stars: Vec<CatalogStar>,
}

impl StaticCatalog {
    pub fn new(stars: Vec<CatalogStar>) -> Self {
        Self { stars }
    }

    pub fn len(&self) -> usize {
        self.stars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stars.is_empty()
    }

    pub fn stars(&self) -> &[CatalogStar] {
        &self.stars
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let contents =
            fs::read_to_string(path.as_ref()).map_err(|e| CatalogError::File(e.to_string()))?;
        let stars: Vec<CatalogStar> =
            serde_json::from_str(&contents).map_err(|e| CatalogError::File(e.to_string()))?;
        Ok(Self::new(stars))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CatalogError> {
        let json = serde_json::to_string_pretty(&self.stars)
            .map_err(|e| CatalogError::File(e.to_string()))?;
        fs::write(path.as_ref(), json).map_err(|e| CatalogError::File(e.to_string()))
    }
}

impl CatalogSource for StaticCatalog {
    fn query_polygon(
        &self,
        polygon: &SkyPolygon,
        mag_limit: f64,
        max_count: usize,
    ) -> Result<Vec<CatalogStar>, CatalogError> {
        let mut found: Vec<CatalogStar> = self
            .stars
            .iter()
            .filter(|s| (s.g_mag as f64) < mag_limit && polygon.contains(&s.position()))
            .copied()
            .collect();
        sort_by_brightness(&mut found);
        found.truncate(max_count);
        debug!(
            "static catalog: {} of {} stars in footprint",
            found.len(),
            self.stars.len()
        );
        Ok(found)
    }
}
