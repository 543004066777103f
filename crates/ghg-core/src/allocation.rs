//! Allocation weight engine.
//!
//! For one sector, the unnormalized weight of an in-territory cell is
//!
//! ```text
//!   w(cell) = max(0, Σ_k weight_k · x_k(cell))
//! ```
//!
//! where `x_k` is the k-th indicator (composite first, then raw layer), taken
//! as `1 − x` for complement terms and as 0 where the indicator has no data.
//! The raster is then divided by its in-territory sum so that it sums to 1.
//! A sum at or below `zero_sum_eps` switches to a uniform distribution over
//! the territory (logged and reported). Out-of-territory cells are no-data.

use std::collections::BTreeMap;

use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;

use crate::composite::{CompositeError, CompositeSet};
use crate::config::{IndicatorTerm, SectorAllocation};
use crate::grid::GridError;
use crate::mask::TerritoryMask;
use crate::provider::LayerSet;
use crate::raster::{compensated_sum, Raster};
use crate::sector::SectorType;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("sector {0} has no allocation table")]
    NoTable(SectorType),
    #[error("sector {sector}: composite {composite:?} is unavailable: {cause}")]
    CompositeUnavailable { sector: SectorType, composite: String, cause: CompositeError },
    #[error("sector {sector}: indicator {indicator:?} is neither a composite nor an available layer")]
    IndicatorUnavailable { sector: SectorType, indicator: String },
    #[error("territory has no cells")]
    EmptyTerritory,
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// Indicators a sector table can reference.
pub struct IndicatorSet<'a> {
    pub composites: &'a CompositeSet,
    pub layers: &'a LayerSet,
}

impl<'a> IndicatorSet<'a> {
    pub fn new(composites: &'a CompositeSet, layers: &'a LayerSet) -> Self {
        Self { composites, layers }
    }

    fn resolve(&self, sector: SectorType, name: &str) -> Result<&'a Raster, AllocationError> {
        if let Some(c) = self.composites.get(name) {
            return Ok(&c.raster);
        }
        if let Some(cause) = self.composites.failure(name) {
            return Err(AllocationError::CompositeUnavailable {
                sector,
                composite: name.to_string(),
                cause: cause.clone(),
            });
        }
        self.layers
            .get(name)
            .ok_or_else(|| AllocationError::IndicatorUnavailable { sector, indicator: name.to_string() })
    }
}

/// Normalized allocation weights of one sector.
#[derive(Debug, Clone)]
pub struct SectorWeights {
    pub sector: SectorType,
    /// Sums to 1 over in-territory cells; no-data elsewhere.
    pub raster: Raster,
    /// In-territory sum before normalization.
    pub raw_total: f64,
    pub uniform_fallback: bool,
}

impl SectorWeights {
    /// Wrap an already-normalized raster.
    pub fn from_normalized(sector: SectorType, raster: Raster) -> Self {
        Self { sector, raster, raw_total: 1.0, uniform_fallback: false }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SectorWeightSummary {
    pub sector: SectorType,
    pub raw_total: f64,
    pub uniform_fallback: bool,
}

impl From<&SectorWeights> for SectorWeightSummary {
    fn from(w: &SectorWeights) -> Self {
        Self { sector: w.sector, raw_total: w.raw_total, uniform_fallback: w.uniform_fallback }
    }
}

/// Holds the per-sector tables and the zero-sum threshold.
#[derive(Debug, Clone)]
pub struct AllocationEngine {
    tables: BTreeMap<SectorType, Vec<IndicatorTerm>>,
    zero_sum_eps: f64,
}

impl AllocationEngine {
    pub fn new(sectors: &[SectorAllocation], zero_sum_eps: f64) -> Self {
        let tables = sectors.iter().map(|s| (s.sector, s.terms.clone())).collect();
        Self { tables, zero_sum_eps }
    }

    /// Unnormalized weighted sum over the territory; no-data outside.
    pub fn raw_weights(
        &self,
        sector: SectorType,
        indicators: &IndicatorSet<'_>,
        territory: &TerritoryMask,
    ) -> Result<Raster, AllocationError> {
        let terms = self.tables.get(&sector).ok_or(AllocationError::NoTable(sector))?;
        let grid = *territory.grid();
        indicators.layers.grid().ensure_aligned(&grid)?;

        let mut acc = Raster::zeros(grid);
        for term in terms.iter().filter(|t| t.weight > 0.0) {
            let x = indicators.resolve(sector, &term.indicator)?.filled_nodata(0.0);
            let x = if term.complement { x.complement() } else { x };
            acc = acc.add(&x.scaled(term.weight))?;
        }
        Ok(acc.clipped_non_negative().masked(territory)?)
    }

    /// Normalized weights for one sector.
    pub fn weights_for(
        &self,
        sector: SectorType,
        indicators: &IndicatorSet<'_>,
        territory: &TerritoryMask,
    ) -> Result<SectorWeights, AllocationError> {
        let n = territory.count();
        if n == 0 {
            return Err(AllocationError::EmptyTerritory);
        }
        let raw = self.raw_weights(sector, indicators, territory)?;
        let raw_total = compensated_sum(territory.cells().filter_map(|i| raw.value(i)));

        if !raw_total.is_finite() || raw_total <= self.zero_sum_eps {
            warn!(
                "sector {sector}: unnormalized weight sum {raw_total:e} is degenerate, \
                 falling back to uniform allocation over {n} cells"
            );
            let u = 1.0 / n as f64;
            let raster = Raster::filled(*territory.grid(), u).masked(territory)?;
            return Ok(SectorWeights { sector, raster, raw_total, uniform_fallback: true });
        }

        debug!("sector {sector}: unnormalized sum {raw_total:.6e} over {n} cells");
        let raster = raw.scaled(1.0 / raw_total);
        Ok(SectorWeights { sector, raster, raw_total, uniform_fallback: false })
    }
}
