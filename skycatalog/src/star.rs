use serde::{Deserialize, Deserializer, Serialize, Serializer};
use skywcs::SkyCoord;

/// One reference star as returned by a catalog query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CatalogStar {
    /// Catalog identifier (Gaia `source_id`)
    pub id: i64,
    /// Right ascension in degrees
    pub ra: f64,
    /// Declination in degrees
    pub dec: f64,
    /// G-band mean magnitude
    #[serde(with = "nullable_mag")]
    pub g_mag: f32,
    /// RP-band mean magnitude, NaN when the catalog has none
    #[serde(with = "nullable_mag")]
    pub rp_mag: f32,
}

/// Missing magnitudes are NaN in memory and `null` in JSON.
mod nullable_mag {
    use super::*;

    pub fn serialize<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f32(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
        Ok(Option::<f32>::deserialize(deserializer)?.unwrap_or(f32::NAN))
    }
}

impl CatalogStar {
    pub fn new(id: i64, ra: f64, dec: f64, g_mag: f32, rp_mag: f32) -> Self {
        Self {
            id,
            ra,
            dec,
            g_mag,
            rp_mag,
        }
    }

    pub fn position(&self) -> SkyCoord {
        SkyCoord::new(self.ra, self.dec)
    }
}

/// Stable brightest-first ordering; NaN magnitudes sort last.
pub(crate) fn sort_by_brightness(stars: &mut [CatalogStar]) {
    stars.sort_by(|a, b| a.g_mag.total_cmp(&b.g_mag));
}
