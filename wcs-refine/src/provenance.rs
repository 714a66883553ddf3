//! Which detected star was matched to which catalog star.

use serde::{Deserialize, Serialize};
use skycatalog::CatalogStar;
use std::fs;
use std::path::Path;

use crate::error::RefineError;
use crate::nullable::{nan_f32, nan_f64};
use crate::stars::DetectedStar;

/// One accepted correspondence: detection attributes followed by the
/// matched catalog star.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRow {
    pub id: usize,
    pub x: f64,
    pub y: f64,
    #[serde(with = "nan_f64")]
    pub fwhm: f64,
    #[serde(with = "nan_f64")]
    pub sharpness: f64,
    #[serde(with = "nan_f64")]
    pub roundness: f64,
    #[serde(with = "nan_f64")]
    pub pa: f64,
    #[serde(with = "nan_f64")]
    pub sky: f64,
    pub peak: f64,
    pub flux: f64,
    #[serde(with = "nan_f64")]
    pub mag: f64,
    pub gaia_id: i64,
    pub gaia_ra: f64,
    pub gaia_dec: f64,
    #[serde(with = "nan_f32")]
    pub gaia_g_mag: f32,
    #[serde(with = "nan_f32")]
    pub gaia_rp_mag: f32,
    /// Distance between the detection and the catalog star projected
    /// through the final WCS, pixels
    #[serde(with = "nan_f64")]
    pub residual_px: f64,
}

impl ProvenanceRow {
    pub fn new(star: &DetectedStar, catalog: &CatalogStar, residual_px: f64) -> Self {
        Self {
            id: star.id,
            x: star.x,
            y: star.y,
            fwhm: star.fwhm,
            sharpness: star.sharpness,
            roundness: star.roundness,
            pa: star.pa,
            sky: star.sky,
            peak: star.peak,
            flux: star.flux,
            mag: star.mag,
            gaia_id: catalog.id,
            gaia_ra: catalog.ra,
            gaia_dec: catalog.dec,
            gaia_g_mag: catalog.g_mag,
            gaia_rp_mag: catalog.rp_mag,
            residual_px,
        }
    }
}

/// Provenance rows in detection order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceTable {
    pub rows: Vec<ProvenanceRow>,
}

impl ProvenanceTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Root mean square of the final residuals, NaN for an empty table.
    pub fn rms_residual_px(&self) -> f64 {
        if self.rows.is_empty() {
            return f64::NAN;
        }
        let sum: f64 = self.rows.iter().map(|r| r.residual_px.powi(2)).sum();
        (sum / self.rows.len() as f64).sqrt()
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, RefineError> {
        let contents =
            fs::read_to_string(path.as_ref()).map_err(|e| RefineError::File(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| RefineError::File(e.to_string()))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), RefineError> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| RefineError::File(e.to_string()))?;
        fs::write(path.as_ref(), json).map_err(|e| RefineError::File(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_row_copies_both_sides() {
        let star = DetectedStar::new(101.5, 202.5, 3000.0, 12000.0).with_shape(2.2, 0.5, 0.1);
        let gaia = CatalogStar::new(998877, 10.5, -3.25, 13.1, f32::NAN);
        let row = ProvenanceRow::new(&star, &gaia, 0.12);
        assert_eq!(row.x, 101.5);
        assert_eq!(row.fwhm, 2.2);
        assert_eq!(row.gaia_id, 998877);
        assert_eq!(row.gaia_dec, -3.25);
        assert!(row.gaia_rp_mag.is_nan());
    }

    #[test]
    fn test_table_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("provenance.json");
        let star = DetectedStar::new(1.0, 2.0, 30.0, 300.0);
        let table = ProvenanceTable {
            rows: vec![
                ProvenanceRow::new(&star, &CatalogStar::new(1, 0.1, 0.2, 11.0, 10.5), 0.3),
                ProvenanceRow::new(&star, &CatalogStar::new(2, 0.3, 0.4, 12.0, 11.5), 0.4),
            ],
        };
        table.save_to_file(&path).unwrap();
        let loaded = ProvenanceTable::load_from_file(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.rows[1].gaia_id, 2);
        assert!(loaded.rows[0].pa.is_nan());
        assert!((loaded.rms_residual_px() - 0.125_f64.sqrt()).abs() < 1e-12);
    }
}
