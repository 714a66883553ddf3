//! Refine the WCS of a real image from its detected stars
//!
//! Reads a JSON list of detections, blind-solves them with astrometry.net,
//! fetches Gaia stars for the footprint and prints the refined solution.

use clap::Parser;
use log::info;
use skycatalog::{GaiaCatalog, HttpTapService, GAIA_TAP_URL};
use skywcs::{ImageSize, SipWcs, WcsModel};
use std::fs;
use std::path::PathBuf;
use wcs_refine::{
    DetectedStar, HttpNovaService, NovaSettings, NovaSolver, RefineConfig, ScaleHint, StarTable,
    WcsRefiner, NOVA_URL,
};

#[derive(Parser, Debug)]
#[command(
    name = "Refine Stars",
    about = "Blind-solves detected stars and refines the WCS against Gaia",
    long_about = None
)]
struct Args {
    /// Detected stars as a JSON array
    stars: PathBuf,

    /// Image width in pixels
    #[arg(long)]
    width: usize,

    /// Image height in pixels
    #[arg(long)]
    height: usize,

    /// astrometry.net API key (defaults to $ASTROMETRY_NET_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// astrometry.net server
    #[arg(long, default_value = NOVA_URL)]
    nova_url: String,

    /// TAP service hosting the Gaia source table
    #[arg(long, default_value = GAIA_TAP_URL)]
    tap_url: String,

    /// Lower plate scale bound in arcseconds per pixel
    #[arg(long, requires = "scale_high")]
    scale_low: Option<f64>,

    /// Upper plate scale bound in arcseconds per pixel
    #[arg(long, requires = "scale_low")]
    scale_high: Option<f64>,

    /// Refinement configuration (JSON); defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the provenance table here as JSON
    #[arg(long)]
    provenance: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let api_key = match args.api_key.clone() {
        Some(key) => key,
        None => std::env::var("ASTROMETRY_NET_API_KEY")
            .map_err(|_| "no API key: pass --api-key or set ASTROMETRY_NET_API_KEY")?,
    };
    let config = match &args.config {
        Some(path) => RefineConfig::load_from_file(path)?,
        None => RefineConfig::default(),
    };

    let detections: Vec<DetectedStar> = serde_json::from_str(&fs::read_to_string(&args.stars)?)?;
    let stars = StarTable::from_detections(detections);
    let size = ImageSize::from_width_height(args.width, args.height);
    info!("loaded {} stars for a {} image", stars.len(), size);

    let settings = NovaSettings {
        scale: args
            .scale_low
            .zip(args.scale_high)
            .map(|(lower_arcsec, upper_arcsec)| ScaleHint {
                lower_arcsec,
                upper_arcsec,
            }),
        ..Default::default()
    };
    let solver =
        NovaSolver::new(HttpNovaService::new(&args.nova_url), api_key).with_settings(settings);
    let catalog = GaiaCatalog::new(HttpTapService::new(&args.tap_url));

    let mut refiner = WcsRefiner::new(config, solver, catalog);
    let refinement = refiner.refine(&stars, size)?;

    println!("WCS Refinement");
    println!("==============");
    println!("Image:            {size}");
    println!("Coarse center:    {}", refinement.coarse.crval);
    println!("Catalog stars:    {}", refinement.catalog_count);
    println!(
        "First match:      {} accepted, {} ambiguous, {} unmatched",
        refinement.first_match.accepted,
        refinement.first_match.ambiguous,
        refinement.first_match.unmatched
    );
    println!(
        "Final fit:        degree {}, {} pairs, rms {:.4} px",
        refinement.wcs.degree(),
        refinement.provenance.len(),
        refinement.provenance.rms_residual_px()
    );

    if let Some(path) = &args.provenance {
        refinement.provenance.save_to_file(path)?;
        println!("Provenance:       {}", path.display());
    }

    println!();
    for card in SipWcs::from_poly(&refinement.wcs, size)?.to_header_cards() {
        println!("{}", card.to_card_string());
    }

    Ok(())
}
