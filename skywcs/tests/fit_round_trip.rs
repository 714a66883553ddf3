//! Fitting noise-free samples of a known field must reproduce the sample
//! pixels when their sky positions are projected back.

use nalgebra::Vector2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rstest::rstest;
use skywcs::{fit_wcs, projection_residuals, ImageSize, SipWcs, SkyCoord, TanWcs, WcsModel};

#[derive(Debug, Clone, Copy)]
enum Distortion {
    None,
    /// Pixel-space quadratic term, amplitude in pixels at the frame edge
    Quadratic(f64),
    /// Radial barrel term, amplitude in pixels at the frame corner
    Radial(f64),
}

struct Field {
    truth: TanWcs,
    distortion: Distortion,
    size: ImageSize,
}

impl Field {
    fn new(distortion: Distortion) -> Self {
        let size = ImageSize::from_width_height(2048, 2048);
        Self {
            truth: TanWcs::from_pointing(
                SkyCoord::new(210.8, 54.35),
                size.center(),
                1.1,
                7.5,
                false,
            ),
            distortion,
            size,
        }
    }

    fn sky(&self, pixel: &Vector2<f64>) -> SkyCoord {
        let d = pixel - self.truth.crpix;
        let half = self.size.width as f64 / 2.0;
        let offset = match self.distortion {
            Distortion::None => Vector2::zeros(),
            Distortion::Quadratic(amp) => {
                Vector2::new(d.x * d.x, d.x * d.y) * (amp / (half * half))
            }
            Distortion::Radial(amp) => {
                let corner = half * std::f64::consts::SQRT_2;
                d * (amp * d.norm_squared() / corner.powi(3))
            }
        };
        self.truth.unproject(&(pixel + offset))
    }

    /// Random pixels plus their point reflections through the frame center.
    fn samples(&self, pairs: usize, seed: u64) -> (Vec<Vector2<f64>>, Vec<SkyCoord>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let center = self.size.center();
        let mut pixels = Vec::with_capacity(2 * pairs);
        for _ in 0..pairs {
            let p = Vector2::new(
                rng.random_range(0.0..self.size.width as f64),
                rng.random_range(0.0..self.size.height as f64),
            );
            pixels.push(p);
            pixels.push(2.0 * center - p);
        }
        let sky = pixels.iter().map(|p| self.sky(p)).collect();
        (pixels, sky)
    }
}

#[rstest]
#[case::linear(Distortion::None, 1)]
#[case::quadratic(Distortion::Quadratic(2.0), 2)]
#[case::radial_cubic(Distortion::Radial(3.0), 3)]
#[case::radial_quartic(Distortion::Radial(3.0), 4)]
fn test_fit_round_trip(#[case] distortion: Distortion, #[case] degree: usize) {
    let field = Field::new(distortion);
    let (pixels, sky) = field.samples(30, 7);

    let model = fit_wcs(&pixels, &sky, degree).unwrap();
    assert_eq!(model.degree(), degree);

    let residuals = projection_residuals(&model, &pixels, &sky);
    let worst = residuals.iter().cloned().fold(0.0, f64::max);
    assert!(worst < 1e-3, "worst round-trip residual {worst} px");

    for (pixel, expected) in pixels.iter().zip(&sky) {
        assert!(model.unproject(pixel).separation_arcsec(expected) < 1e-3);
    }
}

#[test]
fn test_low_degree_underfits_distortion() {
    let field = Field::new(Distortion::Radial(3.0));
    let (pixels, sky) = field.samples(40, 11);

    let low = fit_wcs(&pixels, &sky, 2).unwrap();
    let high = fit_wcs(&pixels, &sky, 3).unwrap();
    let worst = |model: &dyn WcsModel| {
        projection_residuals(model, &pixels, &sky)
            .into_iter()
            .fold(0.0, f64::max)
    };
    assert!(worst(&low) > 0.1);
    assert!(worst(&high) < 1e-3);
}

#[test]
fn test_sip_header_describes_fitted_model() {
    let field = Field::new(Distortion::Radial(3.0));
    let (pixels, sky) = field.samples(50, 3);
    let model = fit_wcs(&pixels, &sky, 3).unwrap();

    let cards = model.to_header_cards(field.size).unwrap();
    let ctype = cards.iter().find(|c| c.keyword == "CTYPE1").unwrap();
    assert_eq!(ctype.value.as_str(), Some("RA---TAN-SIP"));
    assert!(cards.iter().any(|c| c.keyword == "A_3_0"));
    assert!(cards.iter().any(|c| c.keyword == "BP_0_4"));
    assert!(!cards.iter().any(|c| c.keyword == "A_1_0"));

    // The linear part read back from the header agrees with the SIP model
    let sip = SipWcs::from_poly(&model, field.size).unwrap();
    let linear = TanWcs::from_header_cards(&cards).unwrap();
    assert!((linear.crpix - sip.linear.crpix).norm() < 1e-9);
    for pixel in pixels.iter().take(10) {
        let a = sip.unproject(pixel);
        let b = model.unproject(pixel);
        assert!(a.separation_arcsec(&b) < 1e-6);
    }
}
