//! Coarse (linear TAN) solutions from an external solver.

use log::{debug, info};
use skycatalog::WaitError;
use skywcs::header::find_value;
use skywcs::{HeaderCard, ImageSize, SkyCoord, TanWcs};
use thiserror::Error;

/// Errors that can occur while obtaining a coarse solution
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("{0}")]
    NoSolution(String),

    #[error("solver service error: {0}")]
    Service(String),

    #[error("solver timed out")]
    Timeout,

    #[error("solve cancelled")]
    Cancelled,

    #[error("invalid solver input: {0}")]
    InvalidInput(String),
}

impl From<WaitError> for SolverError {
    fn from(error: WaitError) -> Self {
        match error {
            WaitError::Timeout(_) => SolverError::Timeout,
            WaitError::Cancelled => SolverError::Cancelled,
        }
    }
}

/// Turns star centroids into an initial TAN WCS.
pub trait CoarseSolver {
    /// Solve from parallel x/y pixel arrays of an image of `size`.
    fn solve(&self, xs: &[f64], ys: &[f64], size: ImageSize) -> Result<TanWcs, SolverError>;
}

impl<T: CoarseSolver + ?Sized> CoarseSolver for &T {
    fn solve(&self, xs: &[f64], ys: &[f64], size: ImageSize) -> Result<TanWcs, SolverError> {
        (**self).solve(xs, ys, size)
    }
}

pub(crate) fn check_input(xs: &[f64], ys: &[f64], size: ImageSize) -> Result<(), SolverError> {
    if xs.len() != ys.len() {
        return Err(SolverError::InvalidInput(format!(
            "{} x positions but {} y positions",
            xs.len(),
            ys.len()
        )));
    }
    if size.is_empty() {
        return Err(SolverError::InvalidInput(format!("empty image {size}")));
    }
    Ok(())
}

/// Coarse solution from a nominal pointing (mount coordinates, known plate
/// scale and camera angle). The star positions are not used; the tangent
/// point lands on the image center.
#[derive(Debug, Clone, PartialEq)]
pub struct PointingHintSolver {
    center: SkyCoord,
    scale_arcsec: f64,
    rotation_deg: f64,
    mirrored: bool,
}

impl PointingHintSolver {
    pub fn new(center: SkyCoord, scale_arcsec: f64) -> Self {
        Self {
            center,
            scale_arcsec,
            rotation_deg: 0.0,
            mirrored: false,
        }
    }

    /// Pointing from the `OBJCTRA` (hours) / `OBJCTDEC` (degrees) cards
    /// written by most capture software.
    pub fn from_header_cards(cards: &[HeaderCard], scale_arcsec: f64) -> Result<Self, SolverError> {
        let text = |keyword: &str| {
            find_value(cards, keyword)
                .and_then(|v| v.as_str())
                .ok_or_else(|| SolverError::InvalidInput(format!("missing {keyword}")))
        };
        let ra_hours = parse_sexagesimal(text("OBJCTRA")?)
            .ok_or_else(|| SolverError::InvalidInput("malformed OBJCTRA".to_string()))?;
        let dec = parse_sexagesimal(text("OBJCTDEC")?)
            .ok_or_else(|| SolverError::InvalidInput("malformed OBJCTDEC".to_string()))?;
        Ok(Self::new(SkyCoord::new(ra_hours * 15.0, dec), scale_arcsec))
    }

    /// Position angle of +y east of north.
    pub fn with_rotation(mut self, rotation_deg: f64) -> Self {
        self.rotation_deg = rotation_deg;
        self
    }

    pub fn with_mirrored(mut self, mirrored: bool) -> Self {
        self.mirrored = mirrored;
        self
    }

    pub fn center(&self) -> SkyCoord {
        self.center
    }
}

impl CoarseSolver for PointingHintSolver {
    fn solve(&self, xs: &[f64], ys: &[f64], size: ImageSize) -> Result<TanWcs, SolverError> {
        check_input(xs, ys, size)?;
        if !self.center.is_finite() {
            return Err(SolverError::NoSolution(
                "pointing hint is not finite".to_string(),
            ));
        }
        if !(self.scale_arcsec > 0.0 && self.scale_arcsec.is_finite()) {
            return Err(SolverError::InvalidInput(format!(
                "plate scale must be positive, got {}",
                self.scale_arcsec
            )));
        }
        debug!("pointing hint solve for {} stars in {}", xs.len(), size);
        let wcs = TanWcs::from_pointing(
            self.center,
            size.center(),
            self.scale_arcsec,
            self.rotation_deg,
            self.mirrored,
        );
        info!(
            "coarse solution at {} ({:.3}\"/px, {:.2}°)",
            wcs.crval,
            wcs.pixel_scale_arcsec(),
            wcs.rotation_deg()
        );
        Ok(wcs)
    }
}

/// Parse `"dd mm ss.s"`, `"dd:mm:ss.s"` or a plain decimal into decimal units.
pub fn parse_sexagesimal(text: &str) -> Option<f64> {
    let text = text.trim();
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let parts: Vec<f64> = body
        .split(|c: char| c == ':' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if parts.is_empty() || parts.len() > 3 || parts.iter().skip(1).any(|p| *p < 0.0 || *p >= 60.0)
    {
        return None;
    }
    let value = parts
        .iter()
        .zip([1.0, 60.0, 3600.0])
        .map(|(p, div)| p / div)
        .sum::<f64>();
    Some(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use skywcs::{HeaderValue, WcsModel};

    #[test]
    fn test_parse_sexagesimal() {
        assert_relative_eq!(parse_sexagesimal("12 30 00").unwrap(), 12.5);
        assert_relative_eq!(parse_sexagesimal("-00:30:36").unwrap(), -0.51);
        assert_relative_eq!(parse_sexagesimal("+45.25").unwrap(), 45.25);
        assert!(parse_sexagesimal("12 75 00").is_none());
        assert!(parse_sexagesimal("abc").is_none());
        assert!(parse_sexagesimal("").is_none());
    }

    #[test]
    fn test_hint_from_header() {
        let cards = vec![
            HeaderCard::new("OBJCTRA", HeaderValue::Text("05 35 17.3".to_string())),
            HeaderCard::new("OBJCTDEC", HeaderValue::Text("-05 23 28".to_string())),
        ];
        let solver = PointingHintSolver::from_header_cards(&cards, 1.2).unwrap();
        assert_relative_eq!(solver.center().ra, 83.822083, epsilon = 1e-5);
        assert_relative_eq!(solver.center().dec, -5.391111, epsilon = 1e-5);

        assert!(PointingHintSolver::from_header_cards(&cards[..1], 1.2).is_err());
    }

    #[test]
    fn test_solution_centered_on_image() {
        let solver = PointingHintSolver::new(SkyCoord::new(30.0, 40.0), 2.0).with_rotation(15.0);
        let size = ImageSize::from_width_height(1000, 800);
        let wcs = solver.solve(&[1.0, 2.0], &[3.0, 4.0], size).unwrap();
        let center = wcs.unproject(&size.center());
        assert!(center.separation_arcsec(&SkyCoord::new(30.0, 40.0)) < 1e-6);
        assert_relative_eq!(wcs.pixel_scale_arcsec(), 2.0, epsilon = 1e-9);
        assert_relative_eq!(wcs.rotation_deg(), 15.0, epsilon = 1e-9);
    }

    #[test]
    fn test_rejects_bad_input() {
        let solver = PointingHintSolver::new(SkyCoord::new(30.0, 40.0), 2.0);
        let size = ImageSize::from_width_height(100, 100);
        assert!(matches!(
            solver.solve(&[1.0], &[], size),
            Err(SolverError::InvalidInput(_))
        ));
        assert!(matches!(
            PointingHintSolver::new(SkyCoord::new(f64::NAN, 0.0), 2.0).solve(&[], &[], size),
            Err(SolverError::NoSolution(_))
        ));
    }
}
