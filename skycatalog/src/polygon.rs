//! Sky polygons for footprint queries.

use serde::{Deserialize, Serialize};
use skywcs::sphere::mean_direction;
use skywcs::tan::gnomonic_project;
use skywcs::SkyCoord;

use crate::error::CatalogError;

/// A convex-or-not polygon on the sky with great-circle edges.
///
/// Containment is evaluated in the gnomonic plane tangent at the vertex
/// centroid, where great circles are straight lines, so it is exact for
/// polygons smaller than a hemisphere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkyPolygon {
    vertices: Vec<SkyCoord>,
    center: SkyCoord,
    /// Vertices in the tangent plane at `center`, degrees
    plane: Vec<(f64, f64)>,
}

impl SkyPolygon {
    pub fn new(vertices: Vec<SkyCoord>) -> Result<Self, CatalogError> {
        if vertices.len() < 3 {
            return Err(CatalogError::InvalidQuery(format!(
                "polygon needs at least 3 vertices, got {}",
                vertices.len()
            )));
        }
        if let Some(bad) = vertices.iter().position(|v| !v.is_finite()) {
            return Err(CatalogError::InvalidQuery(format!(
                "polygon vertex {bad} is not finite"
            )));
        }
        let center = mean_direction(&vertices)
            .ok_or_else(|| CatalogError::InvalidQuery("degenerate polygon".to_string()))?;
        let plane = vertices
            .iter()
            .map(|v| gnomonic_project(v, &center))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                CatalogError::InvalidQuery("polygon spans more than a hemisphere".to_string())
            })?;
        Ok(Self {
            vertices,
            center,
            plane,
        })
    }

    pub fn vertices(&self) -> &[SkyCoord] {
        &self.vertices
    }

    pub fn center(&self) -> SkyCoord {
        self.center
    }

    /// Largest distance from the centroid to a vertex, degrees.
    pub fn radius_deg(&self) -> f64 {
        self.vertices
            .iter()
            .map(|v| v.separation_deg(&self.center))
            .fold(0.0, f64::max)
    }

    pub fn contains(&self, point: &SkyCoord) -> bool {
        let Some((px, py)) = gnomonic_project(point, &self.center) else {
            return false;
        };
        // even-odd ray casting
        let mut inside = false;
        let n = self.plane.len();
        for i in 0..n {
            let (xi, yi) = self.plane[i];
            let (xj, yj) = self.plane[(i + n - 1) % n];
            if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
                inside = !inside;
            }
        }
        inside
    }

    /// ADQL `POLYGON('ICRS', ...)` literal.
    pub fn to_adql(&self) -> String {
        let coords: Vec<String> = self
            .vertices
            .iter()
            .map(|v| format!("{:.8}, {:.8}", v.ra, v.dec))
            .collect();
        format!("POLYGON('ICRS', {})", coords.join(", "))
    }
}
