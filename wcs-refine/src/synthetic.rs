//! Simulated star fields with known distortion.
//!
//! Stars are placed on the detector, carried to the sky through a radially
//! distorted TAN model and split into three groups: detected stars (with
//! Gaussian centroid noise) that also appear in the catalog, catalog-only
//! stars fainter than the default magnitude limit, and held-out stars used
//! only to check a refined model.

use log::debug;
use nalgebra::Vector2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use skycatalog::{CatalogStar, StaticCatalog};
use skywcs::{ImageSize, SkyCoord, TanWcs, WcsModel};

use crate::error::RefineError;
use crate::solver::PointingHintSolver;
use crate::stars::{DetectedStar, StarTable};

const PLACEMENT_ATTEMPTS: usize = 10_000;
const FWHM_PX: f64 = 2.5;

/// TAN model with barrel/pincushion distortion about the reference pixel:
/// the ideal position of pixel `p` is `p + k·d·|d|²` with `d = p - crpix`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadialDistortionWcs {
    pub linear: TanWcs,
    /// `k`, per square pixel
    pub coefficient: f64,
}

impl RadialDistortionWcs {
    /// Distortion of `corner_shift_px` at the corners of `size`.
    pub fn with_corner_shift(linear: TanWcs, size: ImageSize, corner_shift_px: f64) -> Self {
        let corner = (Vector2::zeros() - linear.crpix)
            .norm()
            .max((Vector2::new(size.width as f64, size.height as f64) - linear.crpix).norm());
        let coefficient = if corner > 0.0 {
            corner_shift_px / corner.powi(3)
        } else {
            0.0
        };
        Self {
            linear,
            coefficient,
        }
    }

    fn shift(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let d = pixel - self.linear.crpix;
        d * (self.coefficient * d.norm_squared())
    }
}

impl WcsModel for RadialDistortionWcs {
    fn project(&self, sky: &SkyCoord) -> Option<Vector2<f64>> {
        let ideal = self.linear.project(sky)?;
        let mut pixel = ideal;
        for _ in 0..50 {
            let next = ideal - self.shift(&pixel);
            let step = (next - pixel).norm();
            pixel = next;
            if step < 1e-12 {
                break;
            }
        }
        pixel.iter().all(|v| v.is_finite()).then_some(pixel)
    }

    fn unproject(&self, pixel: &Vector2<f64>) -> SkyCoord {
        self.linear.unproject(&(pixel + self.shift(pixel)))
    }

    fn degree(&self) -> usize {
        3
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticFieldConfig {
    pub size: ImageSize,
    pub center: SkyCoord,
    pub scale_arcsec: f64,
    /// Position angle of +y east of north
    pub rotation_deg: f64,
    /// Stars both detected and in the catalog
    pub star_count: usize,
    /// Catalog-only stars fainter than magnitude 17
    pub faint_count: usize,
    /// Undetected, uncatalogued stars for checking a fit
    pub held_out_count: usize,
    /// Closest allowed approach of any two stars
    pub min_separation_px: f64,
    /// Keep stars this far from the frame edge
    pub margin_px: f64,
    /// Centroid noise per axis (1σ)
    pub noise_px: f64,
    /// Radial distortion at the frame corner
    pub distortion_px: f64,
    /// Offset of the coarse pointing from the true field center
    pub pointing_error_px: f64,
    pub seed: u64,
}

impl Default for SyntheticFieldConfig {
    fn default() -> Self {
        Self {
            size: ImageSize::from_width_height(2048, 2048),
            center: SkyCoord::new(83.82, -5.39),
            scale_arcsec: 0.05,
            rotation_deg: 12.0,
            star_count: 50,
            faint_count: 10,
            held_out_count: 10,
            min_separation_px: 60.0,
            margin_px: 16.0,
            noise_px: 0.3,
            distortion_px: 1.0,
            pointing_error_px: 2.5,
            seed: 7,
        }
    }
}

/// A star that was neither detected nor catalogued.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeldOutStar {
    /// True detector position
    pub pixel: Vector2<f64>,
    /// True sky position
    pub sky: SkyCoord,
}

pub struct SyntheticField {
    pub config: SyntheticFieldConfig,
    pub truth: RadialDistortionWcs,
    pub detections: StarTable,
    pub catalog: StaticCatalog,
    pub held_out: Vec<HeldOutStar>,
}

impl SyntheticField {
    pub fn generate(config: SyntheticFieldConfig) -> Result<Self, RefineError> {
        if config.size.is_empty() || !(config.scale_arcsec > 0.0) {
            return Err(RefineError::InvalidConfig(format!(
                "synthetic field {} at {}\"/px",
                config.size, config.scale_arcsec
            )));
        }
        let noise = Normal::new(0.0, config.noise_px)
            .map_err(|e| RefineError::InvalidConfig(e.to_string()))?;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);

        let linear = TanWcs::from_pointing(
            config.center,
            config.size.center(),
            config.scale_arcsec,
            config.rotation_deg,
            false,
        );
        let truth = RadialDistortionWcs::with_corner_shift(linear, config.size, config.distortion_px);

        let w = config.size.width as f64;
        let h = config.size.height as f64;
        let full = (
            Vector2::new(config.margin_px, config.margin_px),
            Vector2::new(w - config.margin_px, h - config.margin_px),
        );
        // held-out stars stay in the interior where the fit interpolates
        let inner = (Vector2::new(0.1 * w, 0.1 * h), Vector2::new(0.9 * w, 0.9 * h));

        let mut placed: Vec<Vector2<f64>> = Vec::new();
        let mut place = |rng: &mut ChaCha8Rng, region: (Vector2<f64>, Vector2<f64>)| {
            for _ in 0..PLACEMENT_ATTEMPTS {
                let candidate = Vector2::new(
                    rng.random_range(region.0.x..region.1.x),
                    rng.random_range(region.0.y..region.1.y),
                );
                if placed
                    .iter()
                    .all(|p| (p - candidate).norm() >= config.min_separation_px)
                {
                    placed.push(candidate);
                    return Ok(candidate);
                }
            }
            Err(RefineError::InvalidConfig(format!(
                "cannot place {} stars {} px apart",
                placed.len() + 1,
                config.min_separation_px
            )))
        };

        let mut detections = Vec::with_capacity(config.star_count);
        let mut catalog = Vec::with_capacity(config.star_count + config.faint_count);
        for i in 0..config.star_count {
            let pixel = place(&mut rng, full)?;
            let sky = truth.unproject(&pixel);
            let g_mag: f64 = rng.random_range(10.0..16.0);
            catalog.push(CatalogStar::new(
                1_000_000 + i as i64,
                sky.ra,
                sky.dec,
                g_mag as f32,
                (g_mag - 0.6) as f32,
            ));

            let flux = 10f64.powf(-0.4 * (g_mag - 25.0));
            let sigma = FWHM_PX / (8.0 * 2f64.ln()).sqrt();
            let peak = flux / (2.0 * std::f64::consts::PI * sigma * sigma);
            let mut star = DetectedStar::new(
                pixel.x + noise.sample(&mut rng),
                pixel.y + noise.sample(&mut rng),
                peak,
                flux,
            )
            .with_shape(FWHM_PX, 0.6, rng.random_range(-0.1..0.1));
            star.sky = 100.0;
            detections.push(star);
        }

        for i in 0..config.faint_count {
            let pixel = place(&mut rng, full)?;
            let sky = truth.unproject(&pixel);
            let g_mag: f64 = rng.random_range(17.5..19.5);
            catalog.push(CatalogStar::new(
                2_000_000 + i as i64,
                sky.ra,
                sky.dec,
                g_mag as f32,
                f32::NAN,
            ));
        }

        let mut held_out = Vec::with_capacity(config.held_out_count);
        for _ in 0..config.held_out_count {
            let pixel = place(&mut rng, inner)?;
            held_out.push(HeldOutStar {
                pixel,
                sky: truth.unproject(&pixel),
            });
        }

        debug!(
            "synthetic field: {} detections, {} catalog stars, {} held out",
            detections.len(),
            catalog.len(),
            held_out.len()
        );
        Ok(Self {
            config,
            truth,
            detections: StarTable::from_detections(detections),
            catalog: StaticCatalog::new(catalog),
            held_out,
        })
    }

    /// Coarse solver whose tangent point is off by `pointing_error_px`.
    pub fn coarse_solver(&self) -> PointingHintSolver {
        let offset = Vector2::new(1.0, -0.6) * self.config.pointing_error_px;
        let center = self
            .truth
            .linear
            .unproject(&(self.config.size.center() + offset));
        PointingHintSolver::new(center, self.config.scale_arcsec)
            .with_rotation(self.config.rotation_deg)
    }

    /// Pixel distance between every held-out star and its true sky position
    /// projected through `model`.
    pub fn held_out_errors_px(&self, model: &dyn WcsModel) -> Vec<f64> {
        self.held_out
            .iter()
            .map(|star| {
                model
                    .project(&star.sky)
                    .map_or(f64::INFINITY, |pixel| (pixel - star.pixel).norm())
            })
            .collect()
    }

    /// Angular error of `model` at every held-out star, arcseconds.
    pub fn held_out_errors_arcsec(&self, model: &dyn WcsModel) -> Vec<f64> {
        self.held_out
            .iter()
            .map(|star| model.unproject(&star.pixel).separation_arcsec(&star.sky))
            .collect()
    }
}
