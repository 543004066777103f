//! Run configuration: grid, classification rules and every weight table.
//!
//! All tables are plain data handed to the engine and validated once by
//! [`DownscaleConfig::validate`]. Weights must be finite and non-negative;
//! rows do not need to sum to 1 because composites and sector allocations
//! are renormalized downstream.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classifier::{reference_rules, KeywordRule};
use crate::gas::GwpTable;
use crate::grid::Grid;
use crate::sector::SectorType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{table}: weight {weight} for {entry:?} must be finite and non-negative")]
    InvalidWeight { table: String, entry: String, weight: f64 },
    #[error("composite {0:?} has no sources")]
    EmptyComposite(String),
    #[error("composite {0:?} is defined more than once")]
    DuplicateComposite(String),
    #[error("composite {composite:?} lists composite {layer:?} as a source; sources must be raw layers")]
    CompositeSourceIsComposite { composite: String, layer: String },
    #[error("sector {0} has more than one allocation table")]
    DuplicateSector(SectorType),
    #[error("sector {0} has no allocation terms")]
    EmptySector(SectorType),
    #[error("{name} must be finite and > 0, got {value}")]
    InvalidTolerance { name: &'static str, value: f64 },
    #[error("max_drop_rate must lie in [0, 1], got {0}")]
    InvalidDropRate(f64),
    #[error("retry_attempts must be at least 1")]
    NoRetryAttempts,
}

/// One weighted raw layer inside a composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedSource {
    pub layer: String,
    pub weight: f64,
}

/// A composite indicator fused from several raw auxiliary layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeSpec {
    pub name: String,
    pub sources: Vec<WeightedSource>,
}

impl CompositeSpec {
    pub fn new(name: &str, sources: &[(&str, f64)]) -> Self {
        Self {
            name: name.to_string(),
            sources: sources
                .iter()
                .map(|&(layer, weight)| WeightedSource { layer: layer.to_string(), weight })
                .collect(),
        }
    }
}

/// One term of a sector allocation: a composite or raw layer, optionally
/// entering as its complement `1 − v`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorTerm {
    pub indicator: String,
    pub weight: f64,
    #[serde(default)]
    pub complement: bool,
}

impl IndicatorTerm {
    pub fn new(indicator: &str, weight: f64) -> Self {
        Self { indicator: indicator.to_string(), weight, complement: false }
    }

    pub fn complement_of(indicator: &str, weight: f64) -> Self {
        Self { indicator: indicator.to_string(), weight, complement: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorAllocation {
    pub sector: SectorType,
    pub terms: Vec<IndicatorTerm>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub rules: Vec<KeywordRule>,
    pub default_sector: SectorType,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self { rules: reference_rules(), default_sector: SectorType::Residential }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombineConfig {
    /// Multiply each gas by its GWP before summing into the combined raster.
    /// Off by default: reference inventories are already in CO2-equivalent.
    pub gwp_weighted: bool,
    pub gwp: GwpTable,
}

impl Default for CombineConfig {
    fn default() -> Self {
        Self { gwp_weighted: false, gwp: GwpTable::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerances {
    /// Maximum relative error of a corrected gas total.
    pub mass_balance_rel: f64,
    /// Unnormalized sector sums at or below this trigger the uniform fallback.
    pub zero_sum_eps: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self { mass_balance_rel: 1e-6, zero_sum_eps: 1e-12 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownscaleConfig {
    pub grid: Grid,
    pub classification: ClassificationConfig,
    pub composites: Vec<CompositeSpec>,
    pub sectors: Vec<SectorAllocation>,
    pub combine: CombineConfig,
    pub tolerances: Tolerances,
    /// Fraction of inventory rows that may be dropped before loading fails.
    pub max_drop_rate: f64,
    /// Attempts per auxiliary layer before a transient failure is fatal.
    pub retry_attempts: u32,
}

/// Reference national extent at ~1 km (0.01°).
fn reference_grid() -> Grid {
    match Grid::new(55.9, 37.2, 73.2, 45.6, 0.01) {
        Ok(g) => g,
        Err(e) => unreachable!("reference grid is valid: {e}"),
    }
}

pub fn reference_composites() -> Vec<CompositeSpec> {
    vec![
        CompositeSpec::new(
            "urban",
            &[("nightlights", 0.35), ("population", 0.25), ("esa_urban", 0.20), ("dw_built", 0.20)],
        ),
        CompositeSpec::new(
            "agricultural",
            &[
                ("esa_agriculture", 0.40),
                ("modis_cropland", 0.30),
                ("copernicus_cropland", 0.20),
                ("dw_crops", 0.10),
            ],
        ),
        CompositeSpec::new(
            "industrial",
            &[("nightlights", 0.50), ("city_proximity", 0.30), ("esa_urban", 0.20)],
        ),
    ]
}

pub fn reference_sectors() -> Vec<SectorAllocation> {
    use IndicatorTerm as T;
    vec![
        SectorAllocation {
            sector: SectorType::EnergyIndustries,
            terms: vec![T::new("population", 0.2), T::new("urban", 0.4), T::new("industrial", 0.4)],
        },
        SectorAllocation {
            sector: SectorType::Transport,
            terms: vec![T::new("population", 0.3), T::new("urban", 0.5), T::new("city_proximity", 0.2)],
        },
        SectorAllocation {
            sector: SectorType::Agriculture,
            terms: vec![
                T::new("agricultural", 0.6),
                T::complement_of("urban", 0.3),
                T::new("esa_grassland", 0.1),
            ],
        },
        SectorAllocation {
            sector: SectorType::Manufacturing,
            terms: vec![T::new("industrial", 0.6), T::new("urban", 0.3), T::new("population", 0.1)],
        },
        SectorAllocation {
            sector: SectorType::Residential,
            terms: vec![T::new("population", 0.7), T::new("urban", 0.3)],
        },
    ]
}

impl Default for DownscaleConfig {
    fn default() -> Self {
        Self {
            grid: reference_grid(),
            classification: ClassificationConfig::default(),
            composites: reference_composites(),
            sectors: reference_sectors(),
            combine: CombineConfig::default(),
            tolerances: Tolerances::default(),
            max_drop_rate: 0.5,
            retry_attempts: 3,
        }
    }
}

fn check_weight(table: &str, entry: &str, weight: f64) -> Result<(), ConfigError> {
    if weight.is_finite() && weight >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidWeight { table: table.to_string(), entry: entry.to_string(), weight })
    }
}

fn check_tolerance(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidTolerance { name, value })
    }
}

impl DownscaleConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: DownscaleConfig = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = BTreeSet::new();
        for c in &self.composites {
            if !names.insert(c.name.as_str()) {
                return Err(ConfigError::DuplicateComposite(c.name.clone()));
            }
            if c.sources.is_empty() {
                return Err(ConfigError::EmptyComposite(c.name.clone()));
            }
            for s in &c.sources {
                check_weight(&format!("composite {}", c.name), &s.layer, s.weight)?;
            }
        }
        for c in &self.composites {
            if let Some(s) = c.sources.iter().find(|s| names.contains(s.layer.as_str())) {
                return Err(ConfigError::CompositeSourceIsComposite {
                    composite: c.name.clone(),
                    layer: s.layer.clone(),
                });
            }
        }

        let mut sectors = BTreeSet::new();
        for s in &self.sectors {
            if !sectors.insert(s.sector) {
                return Err(ConfigError::DuplicateSector(s.sector));
            }
            if s.terms.is_empty() {
                return Err(ConfigError::EmptySector(s.sector));
            }
            for t in &s.terms {
                check_weight(&format!("sector {}", s.sector), &t.indicator, t.weight)?;
            }
        }

        let gwp = &self.combine.gwp;
        for (name, w) in [("CO2", gwp.co2), ("CH4", gwp.ch4), ("N2O", gwp.n2o)] {
            check_weight("gwp", name, w)?;
        }

        check_tolerance("tolerances.mass_balance_rel", self.tolerances.mass_balance_rel)?;
        check_tolerance("tolerances.zero_sum_eps", self.tolerances.zero_sum_eps)?;
        if !(0.0..=1.0).contains(&self.max_drop_rate) {
            return Err(ConfigError::InvalidDropRate(self.max_drop_rate));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::NoRetryAttempts);
        }
        Ok(())
    }

    pub fn sector_terms(&self, sector: SectorType) -> Option<&[IndicatorTerm]> {
        self.sectors.iter().find(|s| s.sector == sector).map(|s| s.terms.as_slice())
    }

    pub fn composite(&self, name: &str) -> Option<&CompositeSpec> {
        self.composites.iter().find(|c| c.name == name)
    }

    /// Every raw layer name referenced by a composite source or directly by
    /// a sector term, sorted and de-duplicated.
    pub fn required_layers(&self) -> Vec<String> {
        let mut out = BTreeSet::new();
        for c in &self.composites {
            for s in &c.sources {
                out.insert(s.layer.clone());
            }
        }
        for s in &self.sectors {
            for t in &s.terms {
                if self.composite(&t.indicator).is_none() {
                    out.insert(t.indicator.clone());
                }
            }
        }
        out.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_config_is_valid_and_covers_every_sector() {
        let cfg = DownscaleConfig::default();
        cfg.validate().unwrap();
        for s in SectorType::ALL {
            assert!(cfg.sector_terms(s).is_some(), "missing table for {s}");
        }
    }

    #[test]
    fn required_layers_excludes_composite_names() {
        let cfg = DownscaleConfig::default();
        let layers = cfg.required_layers();
        assert!(layers.contains(&"population".to_string()));
        assert!(layers.contains(&"esa_grassland".to_string()));
        assert!(layers.contains(&"city_proximity".to_string()));
        assert!(!layers.contains(&"urban".to_string()));
        assert!(!layers.contains(&"industrial".to_string()));
    }

    #[test]
    fn negative_weight_is_rejected() {
        let mut cfg = DownscaleConfig::default();
        cfg.sectors[2].terms[1].weight = -0.1;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidWeight { .. })));
    }

    #[test]
    fn nan_composite_weight_is_rejected() {
        let mut cfg = DownscaleConfig::default();
        cfg.composites[0].sources[0].weight = f64::NAN;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidWeight { .. })));
    }

    #[test]
    fn duplicate_tables_are_rejected() {
        let mut cfg = DownscaleConfig::default();
        cfg.sectors.push(cfg.sectors[0].clone());
        assert!(matches!(cfg.validate(), Err(ConfigError::DuplicateSector(_))));

        let mut cfg = DownscaleConfig::default();
        cfg.composites.push(cfg.composites[1].clone());
        assert!(matches!(cfg.validate(), Err(ConfigError::DuplicateComposite(_))));
    }

    #[test]
    fn composite_cannot_source_another_composite() {
        let mut cfg = DownscaleConfig::default();
        cfg.composites.push(CompositeSpec::new("hub", &[("urban", 0.5), ("nightlights", 0.5)]));
        match cfg.validate() {
            Err(ConfigError::CompositeSourceIsComposite { composite, layer }) => {
                assert_eq!(composite, "hub");
                assert_eq!(layer, "urban");
            }
            other => panic!("unexpected {other:?}"),
        }

        // Self-reference is caught the same way.
        let mut cfg = DownscaleConfig::default();
        cfg.composites.push(CompositeSpec::new("loop", &[("loop", 1.0)]));
        assert!(matches!(cfg.validate(), Err(ConfigError::CompositeSourceIsComposite { .. })));
    }

    #[test]
    fn rows_need_not_sum_to_one() {
        let mut cfg = DownscaleConfig::default();
        cfg.sectors[0].terms = vec![IndicatorTerm::new("population", 7.0)];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{
            "grid": {"min_lon": 0.0, "min_lat": 0.0, "max_lon": 2.0, "max_lat": 1.0, "cell_size_deg": 0.5},
            "max_drop_rate": 0.1
        }"#;
        let cfg = DownscaleConfig::from_json_str(json).unwrap();
        assert_eq!(cfg.grid.width(), 4);
        assert_eq!(cfg.max_drop_rate, 0.1);
        assert_eq!(cfg.composites, reference_composites());
        assert_eq!(cfg.tolerances, Tolerances::default());
    }

    #[test]
    fn invalid_drop_rate_fails_at_load() {
        let err = DownscaleConfig::from_json_str(r#"{"max_drop_rate": 1.5}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDropRate(_)));
    }
}
