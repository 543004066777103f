//! Pipeline orchestrator: runs every downscaling stage in order.
//!
//! A run either returns a full set of mass-balance-verified rasters together
//! with a [`RunReport`] of every fallback taken, or fails with an error
//! naming the gas, sector or layer that could not be reconciled.

use std::collections::{BTreeMap, BTreeSet};

use log::{info, warn};
#[cfg(feature = "threading")]
use rayon::prelude::*;
use thiserror::Error;

use crate::allocation::{AllocationEngine, AllocationError, IndicatorSet, SectorWeightSummary, SectorWeights};
use crate::balance::{correct_mass_balance, BalancedEmission, MassBalanceError};
use crate::classifier::{ClassifiedRecord, SectorClassifier};
use crate::composite::{build_composites, CompositeSet};
use crate::config::{ConfigError, DownscaleConfig};
use crate::distributor::{distribute_gas, DistributionError};
use crate::gas::Gas;
use crate::grid::GridError;
use crate::inventory::{Inventory, InventoryError, LoadReport};
use crate::mask::TerritoryMask;
use crate::provider::{AuxiliaryProvider, LayerSet, ProviderError};
use crate::raster::Raster;
use crate::report::{CombinedSummary, RunReport};
use crate::sector::SectorType;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Distribution(#[from] DistributionError),
    #[error(transparent)]
    MassBalance(#[from] MassBalanceError),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("territory mask covers no cells of the grid")]
    EmptyTerritory,
}

/// Everything a run produces.
#[derive(Debug, Clone)]
pub struct DownscaleResult {
    /// One corrected raster per gas present in the inventory, in gas order.
    pub emissions: Vec<BalancedEmission>,
    /// Sum over gases, GWP-weighted when configured.
    pub combined: Raster,
    pub sector_weights: BTreeMap<SectorType, SectorWeights>,
    pub composites: CompositeSet,
    pub report: RunReport,
}

impl DownscaleResult {
    pub fn emission(&self, gas: Gas) -> Option<&BalancedEmission> {
        self.emissions.iter().find(|e| e.gas == gas)
    }
}

pub struct Downscaler {
    config: DownscaleConfig,
    classifier: SectorClassifier,
    allocation: AllocationEngine,
}

impl Downscaler {
    pub fn new(config: DownscaleConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let classifier = SectorClassifier::new(&config.classification.rules, config.classification.default_sector);
        let allocation = AllocationEngine::new(&config.sectors, config.tolerances.zero_sum_eps);
        Ok(Self { config, classifier, allocation })
    }

    pub fn config(&self) -> &DownscaleConfig {
        &self.config
    }

    /// Fetch every layer the configuration references, then run.
    pub fn run(
        &self,
        inventory: &Inventory,
        provider: &dyn AuxiliaryProvider,
        territory: &TerritoryMask,
    ) -> Result<DownscaleResult, PipelineError> {
        territory.ensure_aligned(&self.config.grid)?;
        let names = self.config.required_layers();
        info!("fetching {} auxiliary layer(s)", names.len());
        let layers = LayerSet::fetch_all(provider, &names, &self.config.grid, self.config.retry_attempts)?;
        self.run_with_layers(inventory, &layers, territory)
    }

    /// Run on layers already on the grid.
    ///
    /// Stage order:
    ///   1. Sector classification
    ///   2. Composite indicators
    ///   3. Sector allocation weights
    ///   4. Per-gas distribution
    ///   5. Mass-balance correction
    ///   6. Combined raster
    pub fn run_with_layers(
        &self,
        inventory: &Inventory,
        layers: &LayerSet,
        territory: &TerritoryMask,
    ) -> Result<DownscaleResult, PipelineError> {
        let grid = self.config.grid;
        territory.ensure_aligned(&grid)?;
        grid.ensure_aligned(layers.grid())?;
        if territory.count() == 0 {
            return Err(PipelineError::EmptyTerritory);
        }
        info!("grid {grid}: {} of {} cells in territory", territory.count(), grid.len());

        // ── 1. Classification ───────────────────────────────────────────────
        let (records, unclassified) = self.classifier.classify_inventory(inventory);
        let needed: BTreeSet<SectorType> = records.iter().map(|r| r.sector).collect();

        // ── 2. Composites ───────────────────────────────────────────────────
        let composites = build_composites(&self.config.composites, layers);

        // ── 3. Allocation weights ───────────────────────────────────────────
        let sector_weights = self.sector_weights(&composites, layers, territory, &needed)?;

        // ── 4–5. Distribution and mass balance ──────────────────────────────
        let emissions = self.distribute_all(&records, &inventory.gases(), &sector_weights, territory)?;

        // ── 6. Combined raster ──────────────────────────────────────────────
        let combine = &self.config.combine;
        let multipliers: Vec<(Gas, f64)> = emissions
            .iter()
            .map(|e| (e.gas, if combine.gwp_weighted { combine.gwp.factor(e.gas) } else { 1.0 }))
            .collect();
        let mut combined = Raster::zeros(grid).masked(territory)?;
        for (e, &(_, m)) in emissions.iter().zip(&multipliers) {
            combined = combined.add(&e.raster.scaled(m))?;
        }
        let combined_total = combined.sum();
        info!("combined total {combined_total:.6e} (gwp weighted: {})", combine.gwp_weighted);

        let report = RunReport {
            inventory: None,
            territory_cells: territory.count(),
            unclassified,
            missing_layers: layers.missing().to_vec(),
            composites: composites.summaries(),
            sectors: sector_weights.values().map(SectorWeightSummary::from).collect(),
            balances: emissions.iter().map(|e| e.balance).collect(),
            combined: Some(CombinedSummary { gwp_weighted: combine.gwp_weighted, multipliers, total: combined_total }),
        };
        if report.has_fallbacks() {
            warn!("run completed with fallbacks; see the run report");
        }

        Ok(DownscaleResult { emissions, combined, sector_weights, composites, report })
    }

    /// As [`Downscaler::run`], attaching the inventory load report.
    pub fn run_loaded(
        &self,
        inventory: &Inventory,
        load_report: LoadReport,
        provider: &dyn AuxiliaryProvider,
        territory: &TerritoryMask,
    ) -> Result<DownscaleResult, PipelineError> {
        let mut result = self.run(inventory, provider, territory)?;
        result.report.inventory = Some(load_report);
        Ok(result)
    }

    /// Weights for every configured sector. Failure is fatal only for
    /// sectors that carry emissions; the others are logged and left out.
    fn sector_weights(
        &self,
        composites: &CompositeSet,
        layers: &LayerSet,
        territory: &TerritoryMask,
        needed: &BTreeSet<SectorType>,
    ) -> Result<BTreeMap<SectorType, SectorWeights>, PipelineError> {
        let indicators = IndicatorSet::new(composites, layers);
        let compute = |s: &SectorType| (*s, self.allocation.weights_for(*s, &indicators, territory));

        #[cfg(feature = "threading")]
        let results: Vec<_> = SectorType::ALL.par_iter().map(compute).collect();
        #[cfg(not(feature = "threading"))]
        let results: Vec<_> = SectorType::ALL.iter().map(compute).collect();

        let mut out = BTreeMap::new();
        for (sector, result) in results {
            match result {
                Ok(w) => {
                    out.insert(sector, w);
                }
                Err(e) if needed.contains(&sector) => return Err(e.into()),
                Err(AllocationError::NoTable(_)) => {}
                Err(e) => warn!("{e} (sector has no emissions, skipped)"),
            }
        }
        Ok(out)
    }

    fn distribute_all(
        &self,
        records: &[ClassifiedRecord],
        gases: &[Gas],
        weights: &BTreeMap<SectorType, SectorWeights>,
        territory: &TerritoryMask,
    ) -> Result<Vec<BalancedEmission>, PipelineError> {
        let tolerance = self.config.tolerances.mass_balance_rel;
        let one_gas = |gas: &Gas| -> Result<BalancedEmission, PipelineError> {
            let raw = distribute_gas(*gas, records, weights, territory)?;
            Ok(correct_mass_balance(&raw, territory, tolerance)?)
        };

        #[cfg(feature = "threading")]
        let out: Result<Vec<_>, PipelineError> = gases.par_iter().map(one_gas).collect();
        #[cfg(not(feature = "threading"))]
        let out: Result<Vec<_>, PipelineError> = gases.iter().map(one_gas).collect();
        out
    }
}
