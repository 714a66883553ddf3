//! Full pipeline on a simulated 2048×2048 field with radial distortion and
//! 0.3 px centroid noise.

use approx::assert_relative_eq;
use astro_math::ClipAnchor;
use rstest::rstest;
use skywcs::{SipWcs, WcsModel};
use tempfile::tempdir;
use wcs_refine::{
    refine_batch, BatchItem, ProvenanceTable, RefineConfig, SyntheticField, SyntheticFieldConfig,
    WcsRefiner,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn worst(errors: &[f64]) -> f64 {
    errors.iter().copied().fold(0.0, f64::max)
}

fn rms(errors: &[f64]) -> f64 {
    (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt()
}

#[rstest]
#[case(7)]
#[case(21)]
#[case(1234)]
fn test_refined_wcs_recovers_held_out_stars(#[case] seed: u64) {
    init_logger();
    let field = SyntheticField::generate(SyntheticFieldConfig {
        seed,
        ..Default::default()
    })
    .unwrap();
    let config = RefineConfig {
        max_sep_px: 25.0,
        gwcs_refine_max_stdev: 2.0,
        fit_degree: 3,
        ..Default::default()
    };

    let mut refiner = WcsRefiner::new(config, field.coarse_solver(), &field.catalog);
    let refinement = refiner.refine(&field.detections, field.config.size).unwrap();

    assert_eq!(refinement.wcs.degree(), 3);
    assert_eq!(refinement.catalog_count, 50);
    assert_eq!(refinement.first_match.accepted, 50);
    assert_eq!(refinement.first_match.ambiguous, 0);
    assert!(
        refinement.provenance.len() >= 45,
        "only {} correspondences survived",
        refinement.provenance.len()
    );

    let refined = field.held_out_errors_arcsec(&refinement.wcs);
    let coarse = field.held_out_errors_arcsec(&refinement.coarse);
    assert_eq!(refined.len(), 10);
    assert!(worst(&refined) < 0.05, "held-out error {:?}", refined);
    assert!(worst(&refined) < worst(&coarse));

    // in pixels, so the bound does not loosen with the plate scale
    let refined_px = field.held_out_errors_px(&refinement.wcs);
    assert!(worst(&refined_px) < 0.6, "held-out error {:?} px", refined_px);
    assert!(rms(&refined_px) < 0.35, "held-out rms {} px", rms(&refined_px));
    assert!(worst(&refined_px) < worst(&field.held_out_errors_px(&refinement.coarse)));
}

#[test]
fn test_zero_anchored_clip_keeps_residuals_below_k_sigma() {
    init_logger();
    let field = SyntheticField::generate(SyntheticFieldConfig::default()).unwrap();
    let run = |clip_anchor| {
        let config = RefineConfig {
            clip_anchor,
            ..Default::default()
        };
        let mut refiner = WcsRefiner::new(config, field.coarse_solver(), &field.catalog);
        refiner.refine(&field.detections, field.config.size).unwrap()
    };

    let zero = run(ClipAnchor::Zero);
    let pass = zero.passes[0];
    assert_relative_eq!(pass.threshold_px, 2.0 * pass.residual_std_px, epsilon = 1e-12);
    assert_eq!(zero.provenance.len(), pass.kept);

    let mean = run(ClipAnchor::Mean);
    let mean_pass = mean.passes[0];
    assert_relative_eq!(
        mean_pass.threshold_px,
        mean_pass.residual_mean_px + 2.0 * mean_pass.residual_std_px,
        epsilon = 1e-12
    );
    assert_eq!(pass.residual_std_px, mean_pass.residual_std_px);

    // centroid residuals are all positive, so anchoring at zero rejects far more
    assert!(pass.threshold_px < mean_pass.threshold_px);
    assert!(pass.kept < mean_pass.kept);
    assert!(pass.kept >= 10, "degree 3 needs 10 pairs, kept {}", pass.kept);
    assert!(mean_pass.kept >= 45);
}

#[test]
fn test_provenance_rows_follow_detection_order() {
    init_logger();
    let field = SyntheticField::generate(SyntheticFieldConfig::default()).unwrap();
    let mut refiner =
        WcsRefiner::new(RefineConfig::default(), field.coarse_solver(), &field.catalog);
    let refinement = refiner.refine(&field.detections, field.config.size).unwrap();

    let ids: Vec<usize> = refinement.provenance.rows.iter().map(|r| r.id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    // every row pairs a detection with the catalog star generated for it
    for row in &refinement.provenance.rows {
        let star = field.detections.get(row.id).unwrap();
        assert_eq!(row.x, star.x);
        let truth = field
            .truth
            .project(&skywcs::SkyCoord::new(row.gaia_ra, row.gaia_dec))
            .unwrap();
        assert!((truth - star.position()).norm() < 2.0);
        assert!(row.residual_px < 1.5);
    }

    let dir = tempdir().unwrap();
    let path = dir.path().join("provenance.json");
    refinement.provenance.save_to_file(&path).unwrap();
    let loaded = ProvenanceTable::load_from_file(&path).unwrap();
    assert_eq!(loaded.len(), refinement.provenance.len());
}

#[test]
fn test_iterated_refinement_stays_accurate() {
    init_logger();
    let field = SyntheticField::generate(SyntheticFieldConfig::default()).unwrap();
    let config = RefineConfig {
        refine_iterations: 5,
        ..Default::default()
    };
    let mut refiner = WcsRefiner::new(config, field.coarse_solver(), &field.catalog);
    let refinement = refiner.refine(&field.detections, field.config.size).unwrap();

    assert!(!refinement.passes.is_empty() && refinement.passes.len() <= 5);
    assert!(worst(&field.held_out_errors_arcsec(&refinement.wcs)) < 0.05);
}

#[test]
fn test_refined_model_exports_as_sip() {
    init_logger();
    let field = SyntheticField::generate(SyntheticFieldConfig::default()).unwrap();
    let mut refiner =
        WcsRefiner::new(RefineConfig::default(), field.coarse_solver(), &field.catalog);
    let refinement = refiner.refine(&field.detections, field.config.size).unwrap();

    let sip = SipWcs::from_poly(&refinement.wcs, field.config.size).unwrap();
    let cards: Vec<String> = sip
        .to_header_cards()
        .iter()
        .map(|c| c.to_card_string())
        .collect();
    assert!(cards.iter().any(|c| c.starts_with("CTYPE1  = 'RA---TAN-SIP'")));
    assert!(cards.iter().all(|c| c.len() == 80));
    assert!(worst(&field.held_out_errors_arcsec(&sip)) < 0.05);
}

#[test]
fn test_batch_of_fields() {
    init_logger();
    let field = SyntheticField::generate(SyntheticFieldConfig::default()).unwrap();
    let items: Vec<BatchItem> = (0..4)
        .map(|i| BatchItem {
            name: format!("frame-{i}"),
            stars: field.detections.clone(),
            image_size: field.config.size,
        })
        .collect();

    let outcomes = refine_batch(
        &items,
        &RefineConfig::default(),
        &field.coarse_solver(),
        &field.catalog,
    );
    assert_eq!(outcomes.len(), 4);
    for outcome in &outcomes {
        let refinement = outcome.result.as_ref().unwrap();
        assert!(refinement.provenance.len() >= 45);
    }
}
