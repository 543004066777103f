//! Composite indicator builder.
//!
//! A composite is the weighted linear fusion of several raw layers that
//! describe one concept (urban, agricultural or industrial intensity).
//!
//! Missing sources are never treated as zero. The weights of the sources that
//! are present are rescaled to sum to 1, so for the reference urban table
//! (0.35 / 0.25 / 0.20 / 0.20) losing the 0.25 source leaves
//! 0.35/0.75, 0.20/0.75, 0.20/0.75. If no source is present the composite
//! fails and every sector that references it fails with it.
//!
//! Within a present source, invalid cells contribute 0 to that term. The
//! output is clipped below at 0 and has no upper ceiling.

use std::collections::BTreeMap;

use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::config::CompositeSpec;
use crate::grid::GridError;
use crate::provider::LayerSet;
use crate::raster::Raster;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompositeError {
    #[error("composite {composite:?}: none of its sources are available ({missing:?})")]
    AllSourcesMissing { composite: String, missing: Vec<String> },
    #[error("composite {composite:?}: available sources carry zero total weight")]
    ZeroWeight { composite: String },
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// A built composite plus how it was built.
#[derive(Debug, Clone)]
pub struct Composite {
    pub name: String,
    pub raster: Raster,
    /// `(layer, weight)` actually applied, summing to 1.
    pub effective_weights: Vec<(String, f64)>,
    /// Configured sources that were unavailable.
    pub missing: Vec<String>,
}

/// Build one composite from the available layers.
pub fn build_composite(spec: &CompositeSpec, layers: &LayerSet) -> Result<Composite, CompositeError> {
    let mut present: Vec<(&str, f64, &Raster)> = Vec::with_capacity(spec.sources.len());
    let mut missing = Vec::new();
    for s in &spec.sources {
        match layers.get(&s.layer) {
            Some(r) => present.push((s.layer.as_str(), s.weight, r)),
            None => missing.push(s.layer.clone()),
        }
    }

    if present.is_empty() {
        return Err(CompositeError::AllSourcesMissing { composite: spec.name.clone(), missing });
    }
    let total: f64 = present.iter().map(|(_, w, _)| w).sum();
    if total <= 0.0 {
        return Err(CompositeError::ZeroWeight { composite: spec.name.clone() });
    }

    let mut acc = Raster::zeros(*layers.grid());
    let mut effective_weights = Vec::with_capacity(present.len());
    for (layer, w, r) in &present {
        let w_eff = w / total;
        effective_weights.push((layer.to_string(), w_eff));
        if w_eff == 0.0 {
            continue;
        }
        acc = acc.add(&r.filled_nodata(0.0).scaled(w_eff))?;
    }
    let raster = acc.clipped_non_negative();

    if !missing.is_empty() {
        warn!(
            "composite {}: {} source(s) missing ({}), weights renormalized over {}",
            spec.name,
            missing.len(),
            missing.join(", "),
            effective_weights.iter().map(|(l, w)| format!("{l}={w:.3}")).collect::<Vec<_>>().join(", ")
        );
    }

    Ok(Composite { name: spec.name.clone(), raster, effective_weights, missing })
}

/// Outcome of building every configured composite.
#[derive(Debug, Clone, Default)]
pub struct CompositeSet {
    pub built: BTreeMap<String, Composite>,
    pub failed: BTreeMap<String, CompositeError>,
}

impl CompositeSet {
    pub fn get(&self, name: &str) -> Option<&Composite> {
        self.built.get(name)
    }

    pub fn failure(&self, name: &str) -> Option<&CompositeError> {
        self.failed.get(name)
    }
}

/// Build all composites. A failure is recorded, not raised: it only becomes
/// fatal for sectors that depend on the failed composite.
pub fn build_composites(specs: &[CompositeSpec], layers: &LayerSet) -> CompositeSet {
    let mut set = CompositeSet::default();
    for spec in specs {
        match build_composite(spec, layers) {
            Ok(c) => {
                info!("composite {}: built from {} source(s)", c.name, c.effective_weights.len());
                set.built.insert(spec.name.clone(), c);
            }
            Err(e) => {
                warn!("{e}");
                set.failed.insert(spec.name.clone(), e);
            }
        }
    }
    set
}

/// Serializable summary of a composite build.
#[derive(Debug, Clone, Serialize)]
pub struct CompositeSummary {
    pub name: String,
    pub effective_weights: Vec<(String, f64)>,
    pub missing: Vec<String>,
    pub failed: bool,
}

impl CompositeSet {
    pub fn summaries(&self) -> Vec<CompositeSummary> {
        let mut out: Vec<CompositeSummary> = self
            .built
            .values()
            .map(|c| CompositeSummary {
                name: c.name.clone(),
                effective_weights: c.effective_weights.clone(),
                missing: c.missing.clone(),
                failed: false,
            })
            .collect();
        out.extend(self.failed.iter().map(|(name, e)| CompositeSummary {
            name: name.clone(),
            effective_weights: Vec::new(),
            missing: match e {
                CompositeError::AllSourcesMissing { missing, .. } => missing.clone(),
                CompositeError::ZeroWeight { .. } | CompositeError::Grid(_) => Vec::new(),
            },
            failed: true,
        }));
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;
    use crate::raster::DEFAULT_NODATA;
    use approx::assert_relative_eq;

    fn grid() -> Grid {
        Grid::new(0.0, 0.0, 3.0, 1.0, 1.0).unwrap()
    }

    fn layer(values: [f64; 3]) -> Raster {
        Raster::new(grid(), values.to_vec(), DEFAULT_NODATA).unwrap()
    }

    fn urban_spec() -> CompositeSpec {
        CompositeSpec::new("urban", &[("a", 0.35), ("b", 0.25), ("c", 0.20), ("d", 0.20)])
    }

    fn full_layers() -> LayerSet {
        LayerSet::new(grid())
            .with("a", layer([1.0, 0.0, 0.5])).unwrap()
            .with("b", layer([0.0, 1.0, 0.5])).unwrap()
            .with("c", layer([0.2, 0.4, 0.6])).unwrap()
            .with("d", layer([0.9, 0.1, 0.0])).unwrap()
    }

    #[test]
    fn full_sources_give_weighted_sum() {
        let c = build_composite(&urban_spec(), &full_layers()).unwrap();
        assert!(c.missing.is_empty());
        let expected0 = 0.35 * 1.0 + 0.25 * 0.0 + 0.20 * 0.2 + 0.20 * 0.9;
        assert_relative_eq!(c.raster.data()[0], expected0, epsilon = 1e-12);
    }

    #[test]
    fn missing_source_renormalizes_remaining_weights() {
        // Drop "b" (0.25): remaining 0.35 / 0.20 / 0.20 rescale by 1 / 0.75.
        let layers = LayerSet::new(grid())
            .with("a", layer([1.0, 0.0, 0.5])).unwrap()
            .with("c", layer([0.2, 0.4, 0.6])).unwrap()
            .with("d", layer([0.9, 0.1, 0.0])).unwrap();
        let c = build_composite(&urban_spec(), &layers).unwrap();

        assert_eq!(c.missing, vec!["b".to_string()]);
        let wsum: f64 = c.effective_weights.iter().map(|(_, w)| w).sum();
        assert_relative_eq!(wsum, 1.0, epsilon = 1e-12);

        // Rebuild directly from the present sources with rescaled weights.
        let direct = CompositeSpec::new("direct", &[("a", 0.35 / 0.75), ("c", 0.20 / 0.75), ("d", 0.20 / 0.75)]);
        let reference = build_composite(&direct, &layers).unwrap();
        for (x, y) in c.raster.data().iter().zip(reference.raster.data()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-12);
        }

        // And it differs from silently treating "b" as zero.
        let zero_b = build_composite(&urban_spec(), &layers.clone().with("b", layer([0.0; 3])).unwrap()).unwrap();
        assert!((c.raster.data()[0] - zero_b.raster.data()[0]).abs() > 1e-3);
    }

    #[test]
    fn all_sources_missing_is_an_error() {
        let err = build_composite(&urban_spec(), &LayerSet::new(grid())).unwrap_err();
        match err {
            CompositeError::AllSourcesMissing { composite, missing } => {
                assert_eq!(composite, "urban");
                assert_eq!(missing.len(), 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn present_sources_with_zero_weight_fail() {
        let spec = CompositeSpec::new("z", &[("a", 0.0), ("missing", 1.0)]);
        let layers = LayerSet::new(grid()).with("a", layer([1.0; 3])).unwrap();
        assert!(matches!(build_composite(&spec, &layers), Err(CompositeError::ZeroWeight { .. })));
    }

    #[test]
    fn output_is_clipped_non_negative_and_nodata_contributes_zero() {
        let spec = CompositeSpec::new("x", &[("neg", 0.5), ("hole", 0.5)]);
        let layers = LayerSet::new(grid())
            .with("neg", layer([-4.0, 2.0, 2.0])).unwrap()
            .with("hole", layer([1.0, DEFAULT_NODATA, 4.0])).unwrap();
        let c = build_composite(&spec, &layers).unwrap();
        assert_eq!(c.raster.data(), &[0.0, 1.0, 3.0]);
    }

    #[test]
    fn build_composites_records_failures_separately() {
        let specs = vec![urban_spec(), CompositeSpec::new("ghost", &[("nowhere", 1.0)])];
        let set = build_composites(&specs, &full_layers());
        assert!(set.get("urban").is_some());
        assert!(set.failure("ghost").is_some());
        let names: Vec<_> = set.summaries().into_iter().map(|s| (s.name, s.failed)).collect();
        assert_eq!(names, vec![("ghost".to_string(), true), ("urban".to_string(), false)]);
    }
}
