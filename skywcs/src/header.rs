//! FITS header cards for WCS models.
//!
//! Models are exported as the usual `CTYPE`/`CRPIX`/`CRVAL`/`CD` keyword set,
//! with `A_p_q`/`B_p_q`/`AP_p_q`/`BP_p_q` terms for TAN-SIP. FITS pixel
//! coordinates are one-based, so `CRPIXn` is the zero-based reference pixel
//! plus one.

use log::warn;
use nalgebra::{Matrix2, Vector2};
use std::fmt;
use thiserror::Error;

use crate::image_size::ImageSize;
use crate::model::WcsModel;
use crate::poly_wcs::PolyWcs;
use crate::sip::{SipError, SipWcs};
use crate::sphere::SkyCoord;
use crate::tan::TanWcs;

const CARD_LENGTH: usize = 80;
const BLOCK_LENGTH: usize = 2880;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HeaderError {
    #[error("missing header keyword {0}")]
    MissingKeyword(String),

    #[error("header keyword {0} has the wrong type")]
    InvalidValue(String),

    #[error("unsupported projection {0}")]
    UnsupportedProjection(String),

    #[error("CD matrix is singular")]
    SingularMatrix,

    #[error("SIP conversion failed: {0}")]
    Sip(#[from] SipError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Logical(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl HeaderValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Integer(v) => Some(*v as f64),
            HeaderValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeaderValue::Logical(v) => write!(f, "{:>20}", if *v { "T" } else { "F" }),
            HeaderValue::Integer(v) => write!(f, "{v:>20}"),
            HeaderValue::Real(v) => write!(f, "{:>20}", format!("{v:.13E}")),
            HeaderValue::Text(s) => {
                let quoted = format!("'{:<8}'", s.replace('\'', "''"));
                write!(f, "{quoted:<20}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderCard {
    pub keyword: String,
    pub value: HeaderValue,
    pub comment: Option<String>,
}

impl HeaderCard {
    pub fn new(keyword: impl Into<String>, value: HeaderValue) -> Self {
        Self {
            keyword: keyword.into().to_ascii_uppercase(),
            value,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Fixed-format 80 character card image.
    pub fn to_card_string(&self) -> String {
        let mut card = format!("{:<8}= {}", self.keyword, self.value);
        if let Some(comment) = &self.comment {
            card.push_str(" / ");
            card.push_str(comment);
        }
        let mut card: String = card.chars().take(CARD_LENGTH).collect();
        while card.len() < CARD_LENGTH {
            card.push(' ');
        }
        card
    }
}

impl HeaderCard {
    /// Parse a fixed-format card image.
    ///
    /// Commentary cards (`COMMENT`, `HISTORY`, blank keywords), cards without
    /// a `= ` value indicator and undefined values give `None`.
    pub fn parse(card: &str) -> Option<Self> {
        let keyword = card.get(..8)?.trim();
        if keyword.is_empty() || card.get(8..10) != Some("= ") {
            return None;
        }
        let rest = card.get(10..)?.trim_start();

        let (value, after) = match rest.strip_prefix('\'') {
            Some(quoted) => {
                let mut text = String::new();
                let mut chars = quoted.char_indices().peekable();
                let mut end = None;
                while let Some((i, c)) = chars.next() {
                    if c != '\'' {
                        text.push(c);
                    } else if matches!(chars.peek(), Some((_, '\''))) {
                        text.push('\'');
                        chars.next();
                    } else {
                        end = Some(i + 1);
                        break;
                    }
                }
                let after = &quoted[end?..];
                (HeaderValue::Text(text.trim_end().to_string()), after)
            }
            None => {
                let split = rest.find('/').unwrap_or(rest.len());
                let token = rest[..split].trim();
                let value = match token {
                    "T" => HeaderValue::Logical(true),
                    "F" => HeaderValue::Logical(false),
                    _ => match token.parse::<i64>() {
                        Ok(v) => HeaderValue::Integer(v),
                        Err(_) => HeaderValue::Real(token.replace(['D', 'd'], "E").parse().ok()?),
                    },
                };
                (value, &rest[split..])
            }
        };

        let comment = after
            .trim_start()
            .strip_prefix('/')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        Some(Self {
            keyword: keyword.to_ascii_uppercase(),
            value,
            comment,
        })
    }
}

/// Cards of a FITS header unit, up to its `END` card.
pub fn parse_header(bytes: &[u8]) -> Vec<HeaderCard> {
    let mut cards = Vec::new();
    for chunk in bytes.chunks(CARD_LENGTH) {
        let image = String::from_utf8_lossy(chunk);
        if image.trim_end() == "END" {
            break;
        }
        if let Some(card) = HeaderCard::parse(&image) {
            cards.push(card);
        }
    }
    cards
}

/// `cards` followed by `END`, blank-padded to whole 2880 byte blocks.
pub fn header_block(cards: &[HeaderCard]) -> Vec<u8> {
    let mut block: Vec<u8> = cards
        .iter()
        .flat_map(|card| card.to_card_string().into_bytes())
        .collect();
    block.extend(format!("{:<width$}", "END", width = CARD_LENGTH).bytes());
    block.resize(block.len().div_ceil(BLOCK_LENGTH) * BLOCK_LENGTH, b' ');
    block
}

fn real(keyword: &str, value: f64) -> HeaderCard {
    HeaderCard::new(keyword, HeaderValue::Real(value))
}

fn integer(keyword: &str, value: i64) -> HeaderCard {
    HeaderCard::new(keyword, HeaderValue::Integer(value))
}

fn text(keyword: &str, value: &str) -> HeaderCard {
    HeaderCard::new(keyword, HeaderValue::Text(value.to_string()))
}

/// Value of the last card with `keyword`.
pub fn find_value<'a>(cards: &'a [HeaderCard], keyword: &str) -> Option<&'a HeaderValue> {
    cards
        .iter()
        .rev()
        .find(|c| c.keyword.eq_ignore_ascii_case(keyword))
        .map(|c| &c.value)
}

fn find_f64(cards: &[HeaderCard], keyword: &str) -> Result<Option<f64>, HeaderError> {
    match find_value(cards, keyword) {
        None => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| HeaderError::InvalidValue(keyword.to_string())),
    }
}

fn require_f64(cards: &[HeaderCard], keyword: &str) -> Result<f64, HeaderError> {
    find_f64(cards, keyword)?.ok_or_else(|| HeaderError::MissingKeyword(keyword.to_string()))
}

fn is_axis_keyword(keyword: &str, prefix: &str) -> bool {
    keyword
        .strip_prefix(prefix)
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

fn is_matrix_keyword(keyword: &str, prefix: &str) -> bool {
    keyword.strip_prefix(prefix).is_some_and(|rest| {
        let mut parts = rest.split('_');
        let all_digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
        matches!((parts.next(), parts.next(), parts.next()), (Some(i), Some(j), None) if all_digits(i) && all_digits(j))
    })
}

/// True for keywords describing a celestial WCS (linear part, SIP terms and
/// their metadata).
pub fn is_wcs_keyword(keyword: &str) -> bool {
    let keyword = keyword.to_ascii_uppercase();
    const EXACT: [&str; 14] = [
        "WCSAXES", "WCSVER", "WCSNAME", "RADESYS", "LONPOLE", "LATPOLE", "A_ORDER", "B_ORDER",
        "AP_ORDER", "BP_ORDER", "A_DMAX", "B_DMAX", "MJDREF", "EQUINOX",
    ];
    if EXACT.contains(&keyword.as_str()) {
        return true;
    }
    ["CRPIX", "CRVAL", "CDELT", "CUNIT", "CTYPE", "CROTA"]
        .iter()
        .any(|prefix| is_axis_keyword(&keyword, prefix))
        || ["PC", "CD", "A_", "B_", "AP_", "BP_"]
            .iter()
            .any(|prefix| is_matrix_keyword(&keyword, prefix))
}

/// Remove every WCS card in place, returning how many were removed.
pub fn remove_wcs_keywords(cards: &mut Vec<HeaderCard>) -> usize {
    let before = cards.len();
    cards.retain(|card| !is_wcs_keyword(&card.keyword));
    before - cards.len()
}

fn linear_cards(linear: &TanWcs, ctype1: &str, ctype2: &str) -> Vec<HeaderCard> {
    vec![
        integer("WCSAXES", 2).with_comment("Number of coordinate axes"),
        text("CTYPE1", ctype1).with_comment("TAN (gnomonic) projection"),
        text("CTYPE2", ctype2).with_comment("TAN (gnomonic) projection"),
        text("CUNIT1", "deg"),
        text("CUNIT2", "deg"),
        text("RADESYS", "ICRS"),
        real("CRPIX1", linear.crpix.x + 1.0).with_comment("Pixel coordinate of reference point"),
        real("CRPIX2", linear.crpix.y + 1.0).with_comment("Pixel coordinate of reference point"),
        real("CRVAL1", linear.crval.ra).with_comment("[deg] RA at reference point"),
        real("CRVAL2", linear.crval.dec).with_comment("[deg] Dec at reference point"),
        real("CD1_1", linear.cd[(0, 0)]),
        real("CD1_2", linear.cd[(0, 1)]),
        real("CD2_1", linear.cd[(1, 0)]),
        real("CD2_2", linear.cd[(1, 1)]),
    ]
}

impl TanWcs {
    pub fn to_header_cards(&self) -> Vec<HeaderCard> {
        linear_cards(self, "RA---TAN", "DEC--TAN")
    }

    /// Read the linear TAN part of a header. `CDi_j` takes precedence over
    /// `PCi_j`/`CDELTn`, which take precedence over `CROTA2`/`CDELTn`. SIP
    /// terms, if any, are ignored.
    pub fn from_header_cards(cards: &[HeaderCard]) -> Result<Self, HeaderError> {
        for (key, expected) in [("CTYPE1", "RA---TAN"), ("CTYPE2", "DEC--TAN")] {
            let ctype = find_value(cards, key)
                .ok_or_else(|| HeaderError::MissingKeyword(key.to_string()))?
                .as_str()
                .ok_or_else(|| HeaderError::InvalidValue(key.to_string()))?
                .trim()
                .to_string();
            if !ctype.starts_with(expected) {
                return Err(HeaderError::UnsupportedProjection(ctype));
            }
            if ctype.ends_with("-SIP") && key == "CTYPE1" {
                warn!("ignoring SIP distortion terms; using linear TAN part only");
            }
        }

        let crpix = Vector2::new(
            require_f64(cards, "CRPIX1")? - 1.0,
            require_f64(cards, "CRPIX2")? - 1.0,
        );
        let crval = SkyCoord::new(require_f64(cards, "CRVAL1")?, require_f64(cards, "CRVAL2")?);

        let cd = if find_value(cards, "CD1_1").is_some() {
            let get = |key: &str| find_f64(cards, key).map(|v| v.unwrap_or(0.0));
            Matrix2::new(get("CD1_1")?, get("CD1_2")?, get("CD2_1")?, get("CD2_2")?)
        } else {
            let cdelt1 = require_f64(cards, "CDELT1")?;
            let cdelt2 = require_f64(cards, "CDELT2")?;
            let pc = if find_value(cards, "PC1_1").is_some() {
                let get = |key: &str, default: f64| find_f64(cards, key).map(|v| v.unwrap_or(default));
                Matrix2::new(
                    get("PC1_1", 1.0)?,
                    get("PC1_2", 0.0)?,
                    get("PC2_1", 0.0)?,
                    get("PC2_2", 1.0)?,
                )
            } else {
                let rho = find_f64(cards, "CROTA2")?.unwrap_or(0.0).to_radians();
                let ratio = cdelt2 / cdelt1;
                Matrix2::new(
                    rho.cos(),
                    -rho.sin() * ratio,
                    rho.sin() / ratio,
                    rho.cos(),
                )
            };
            Matrix2::from_diagonal(&Vector2::new(cdelt1, cdelt2)) * pc
        };

        let wcs = TanWcs::new(crval, crpix, cd);
        if wcs.cd_inverse().is_none() {
            return Err(HeaderError::SingularMatrix);
        }
        Ok(wcs)
    }
}

impl SipWcs {
    pub fn to_header_cards(&self) -> Vec<HeaderCard> {
        let mut cards = linear_cards(&self.linear, "RA---TAN-SIP", "DEC--TAN-SIP");
        for (name, poly, min_order) in [
            ("A", &self.a, 2),
            ("B", &self.b, 2),
            ("AP", &self.ap, 0),
            ("BP", &self.bp, 0),
        ] {
            cards.push(integer(&format!("{name}_ORDER"), poly.degree() as i64));
            for (p, q) in astro_math::terms(poly.degree()) {
                if p + q >= min_order {
                    cards.push(real(&format!("{name}_{p}_{q}"), poly.coeff(p, q)));
                }
            }
        }
        cards
    }
}

impl PolyWcs {
    /// TAN-SIP header for this model over the frame `size`. Degree-1 models
    /// are written as plain TAN.
    pub fn to_header_cards(&self, size: ImageSize) -> Result<Vec<HeaderCard>, HeaderError> {
        if self.degree() < 2 {
            let linear = self
                .linear_approximation()
                .ok_or(HeaderError::SingularMatrix)?;
            return Ok(linear.to_header_cards());
        }
        Ok(SipWcs::from_poly(self, size)?.to_header_cards())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_tan() -> TanWcs {
        TanWcs::from_pointing(
            SkyCoord::new(83.82, -5.39),
            Vector2::new(1023.5, 767.5),
            1.25,
            -30.0,
            false,
        )
    }

    #[test]
    fn test_card_formatting() {
        let card = HeaderCard::new("crval1", HeaderValue::Real(83.82)).with_comment("RA");
        let image = card.to_card_string();
        assert_eq!(image.len(), 80);
        assert!(image.starts_with("CRVAL1  = "));
        assert_eq!(&image[30..33], " / ");
        assert!(image[10..30].trim().parse::<f64>().is_ok());

        let text = HeaderCard::new("CTYPE1", HeaderValue::Text("RA---TAN".into()));
        assert!(text.to_card_string().starts_with("CTYPE1  = 'RA---TAN'"));

        let short = HeaderCard::new("CUNIT1", HeaderValue::Text("deg".into()));
        assert!(short.to_card_string().starts_with("CUNIT1  = 'deg     '"));

        let logical = HeaderCard::new("SIMPLE", HeaderValue::Logical(true));
        assert_eq!(&logical.to_card_string()[29..30], "T");
    }

    #[test]
    fn test_parse_cards() {
        let card = HeaderCard::parse(
            "CTYPE1  = 'RA---TAN-SIP'       / TAN (gnomonic) projection + SIP distortions   ",
        )
        .unwrap();
        assert_eq!(card.keyword, "CTYPE1");
        assert_eq!(card.value, HeaderValue::Text("RA---TAN-SIP".into()));
        assert_eq!(
            card.comment.as_deref(),
            Some("TAN (gnomonic) projection + SIP distortions")
        );

        let card = HeaderCard::parse("CRVAL1  =        83.8220833333 / RA  of reference point").unwrap();
        assert_eq!(card.value, HeaderValue::Real(83.8220833333));
        let card = HeaderCard::parse("CD1_1   =           -1.5D-04").unwrap();
        assert_eq!(card.value, HeaderValue::Real(-1.5e-4));
        let card = HeaderCard::parse("IMAGEW  =                 2048").unwrap();
        assert_eq!(card.value, HeaderValue::Integer(2048));
        let card = HeaderCard::parse("SIMPLE  =                    T").unwrap();
        assert_eq!(card.value, HeaderValue::Logical(true));
        assert_eq!(card.comment, None);
        let card = HeaderCard::parse("OBSERVER= 'O''Neil / Smith'   / names").unwrap();
        assert_eq!(card.value, HeaderValue::Text("O'Neil / Smith".into()));
        assert_eq!(card.comment.as_deref(), Some("names"));

        assert!(HeaderCard::parse("COMMENT Original key: \"END\"").is_none());
        assert!(HeaderCard::parse("HISTORY = not a value card").is_none());
        assert!(HeaderCard::parse("BLANK   =").is_none());
        assert!(HeaderCard::parse("        ").is_none());
    }

    #[test]
    fn test_header_block_round_trip() {
        let wcs = sample_tan();
        let mut cards = wcs.to_header_cards();
        cards.insert(0, HeaderCard::new("SIMPLE", HeaderValue::Logical(true)));

        let block = header_block(&cards);
        assert_eq!(block.len() % 2880, 0);
        assert!(block.iter().all(u8::is_ascii));

        // anything after END belongs to the data unit
        let mut bytes = block.clone();
        bytes.extend(b"CRPIX1  =                  1.0".iter());
        let parsed = parse_header(&bytes);
        assert_eq!(parsed.len(), cards.len());
        assert_eq!(parsed[0].value, HeaderValue::Logical(true));

        let back = TanWcs::from_header_cards(&parsed).unwrap();
        assert_relative_eq!(back.crpix, wcs.crpix, epsilon = 1e-9);
        assert_relative_eq!(back.cd, wcs.cd, epsilon = 1e-15);
        assert_relative_eq!(back.crval.dec, wcs.crval.dec, epsilon = 1e-10);
    }

    #[test]
    fn test_tan_header_round_trip() {
        let wcs = sample_tan();
        let cards = wcs.to_header_cards();
        assert_eq!(
            find_value(&cards, "CRPIX1").and_then(HeaderValue::as_f64),
            Some(1024.5)
        );
        let back = TanWcs::from_header_cards(&cards).unwrap();
        assert_relative_eq!(back.crpix, wcs.crpix, epsilon = 1e-9);
        assert_relative_eq!(back.cd, wcs.cd, epsilon = 1e-18);
        assert_relative_eq!(back.crval.ra, wcs.crval.ra, epsilon = 1e-12);
    }

    #[test]
    fn test_parse_cdelt_pc() {
        let cards = vec![
            HeaderCard::new("CTYPE1", HeaderValue::Text("RA---TAN".into())),
            HeaderCard::new("CTYPE2", HeaderValue::Text("DEC--TAN".into())),
            HeaderCard::new("CRPIX1", HeaderValue::Integer(11)),
            HeaderCard::new("CRPIX2", HeaderValue::Integer(21)),
            HeaderCard::new("CRVAL1", HeaderValue::Real(10.0)),
            HeaderCard::new("CRVAL2", HeaderValue::Real(20.0)),
            HeaderCard::new("CDELT1", HeaderValue::Real(-1e-3)),
            HeaderCard::new("CDELT2", HeaderValue::Real(1e-3)),
        ];
        let wcs = TanWcs::from_header_cards(&cards).unwrap();
        assert_relative_eq!(wcs.crpix, Vector2::new(10.0, 20.0));
        assert_relative_eq!(wcs.cd, Matrix2::new(-1e-3, 0.0, 0.0, 1e-3), epsilon = 1e-18);
    }

    #[test]
    fn test_rejects_other_projections() {
        let mut cards = sample_tan().to_header_cards();
        cards.push(HeaderCard::new("CTYPE1", HeaderValue::Text("RA---SIN".into())));
        assert_eq!(
            TanWcs::from_header_cards(&cards),
            Err(HeaderError::UnsupportedProjection("RA---SIN".into()))
        );

        let mut cards = sample_tan().to_header_cards();
        cards.retain(|c| c.keyword != "CRVAL2");
        assert_eq!(
            TanWcs::from_header_cards(&cards),
            Err(HeaderError::MissingKeyword("CRVAL2".into()))
        );
    }

    #[test]
    fn test_wcs_keyword_detection() {
        for key in [
            "CRPIX1", "crval2", "CD1_2", "PC2_1", "A_ORDER", "A_3_0", "BP_0_4", "CTYPE2", "CROTA2",
            "WCSAXES",
        ] {
            assert!(is_wcs_keyword(key), "{key}");
        }
        for key in ["OBJCTRA", "EXPTIME", "CDELTA", "A_X_1", "CD1", "DATE-OBS", "BSCALE"] {
            assert!(!is_wcs_keyword(key), "{key}");
        }
    }

    #[test]
    fn test_remove_wcs_keywords() {
        let mut cards = sample_tan().to_header_cards();
        cards.push(HeaderCard::new("EXPTIME", HeaderValue::Real(30.0)));
        cards.push(HeaderCard::new("A_2_0", HeaderValue::Real(1e-7)));
        let total = cards.len();
        let removed = remove_wcs_keywords(&mut cards);
        assert_eq!(removed, total - 1);
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].keyword, "EXPTIME");
    }
}
