//! Machine-readable account of a run: every fallback taken and every
//! mass-balance correction applied.

use serde::Serialize;

use crate::allocation::SectorWeightSummary;
use crate::balance::MassBalance;
use crate::classifier::Unclassified;
use crate::composite::CompositeSummary;
use crate::gas::Gas;
use crate::inventory::LoadReport;
use crate::sector::SectorType;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedSummary {
    pub gwp_weighted: bool,
    /// Multiplier applied to each gas before summation (1 when unweighted).
    pub multipliers: Vec<(Gas, f64)>,
    pub total: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory: Option<LoadReport>,
    pub territory_cells: usize,
    pub unclassified: Vec<Unclassified>,
    /// Layers requested from the provider but unavailable.
    pub missing_layers: Vec<String>,
    pub composites: Vec<CompositeSummary>,
    pub sectors: Vec<SectorWeightSummary>,
    pub balances: Vec<MassBalance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combined: Option<CombinedSummary>,
}

impl RunReport {
    pub fn uniform_fallbacks(&self) -> Vec<SectorType> {
        self.sectors.iter().filter(|s| s.uniform_fallback).map(|s| s.sector).collect()
    }

    pub fn balance(&self, gas: Gas) -> Option<&MassBalance> {
        self.balances.iter().find(|b| b.gas == gas)
    }

    /// True when any graceful-degradation path was taken.
    pub fn has_fallbacks(&self) -> bool {
        !self.unclassified.is_empty()
            || !self.missing_layers.is_empty()
            || self.composites.iter().any(|c| c.failed || !c.missing.is_empty())
            || self.sectors.iter().any(|s| s.uniform_fallback)
            || self.inventory.as_ref().is_some_and(|r| r.dropped_total() > 0)
    }
}
