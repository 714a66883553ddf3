//! Refining many images in parallel.

use log::info;
use rayon::prelude::*;
use skycatalog::CatalogSource;
use skywcs::ImageSize;

use crate::config::RefineConfig;
use crate::controller::{Refinement, WcsRefiner};
use crate::error::RefineError;
use crate::solver::CoarseSolver;
use crate::stars::StarTable;

/// Detections of one image.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub name: String,
    pub stars: StarTable,
    pub image_size: ImageSize,
}

/// Outcome for one image of a batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub name: String,
    pub result: Result<Refinement, RefineError>,
}

/// Refine every item with its own [`WcsRefiner`], in parallel.
///
/// Results come back in input order. A failure only affects its own image.
pub fn refine_batch<S, C>(
    items: &[BatchItem],
    config: &RefineConfig,
    solver: &S,
    catalog: &C,
) -> Vec<BatchOutcome>
where
    S: CoarseSolver + Sync + ?Sized,
    C: CatalogSource + Sync + ?Sized,
{
    let outcomes: Vec<BatchOutcome> = items
        .par_iter()
        .map(|item| {
            let mut refiner = WcsRefiner::new(config.clone(), solver, catalog);
            BatchOutcome {
                name: item.name.clone(),
                result: refiner.refine(&item.stars, item.image_size),
            }
        })
        .collect();

    let solved = outcomes.iter().filter(|o| o.result.is_ok()).count();
    info!("batch refined {} of {} images", solved, outcomes.len());
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticField, SyntheticFieldConfig};

    #[test]
    fn test_batch_isolates_failures() {
        let field = SyntheticField::generate(SyntheticFieldConfig::default()).unwrap();
        let size = field.config.size;
        let items = vec![
            BatchItem {
                name: "good".to_string(),
                stars: field.detections.clone(),
                image_size: size,
            },
            BatchItem {
                name: "empty".to_string(),
                stars: StarTable::default(),
                image_size: size,
            },
            BatchItem {
                name: "good again".to_string(),
                stars: field.detections.clone(),
                image_size: size,
            },
        ];

        let outcomes = refine_batch(
            &items,
            &RefineConfig::default(),
            &field.coarse_solver(),
            &field.catalog,
        );
        let names: Vec<&str> = outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["good", "empty", "good again"]);
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(
            outcomes[1].result,
            Err(RefineError::InsufficientDetections { got: 0, .. })
        ));

        let first = outcomes[0].result.as_ref().unwrap();
        let third = outcomes[2].result.as_ref().unwrap();
        let pairs = |r: &Refinement| -> Vec<(usize, i64)> {
            r.provenance.rows.iter().map(|row| (row.id, row.gaia_id)).collect()
        };
        assert_eq!(pairs(first), pairs(third));
    }
}
